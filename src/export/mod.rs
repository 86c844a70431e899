// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Export Pipeline
//!
//! Read path of the pipeline: consumes the repository's pull-based row and
//! attachment streams together with a per-request [`Decryptor`] and renders
//! either a binary archive (media + raw/decrypted payloads) or flattened
//! tabular data.
//!
//! Export is read-only: a failure aborts only the in-flight request and
//! never touches stored state. Output already flushed to the consumer is not
//! retracted — an abnormally terminated stream must be treated as failed
//! regardless of bytes received.

pub mod archive;
pub mod tabular;

use std::io::{Seek, Write};

use crate::crypto::keyvault::{Decryptor, KeyId};
use crate::error::Result;
use crate::schema::FieldNode;
use crate::storage::blobs::BlobStore;
use crate::storage::repository::submissions::{AttachmentRow, ExportRow, RowCrypto};

pub use archive::ArchiveSummary;
pub use tabular::TabularSummary;

/// One export request's rendering capability: blob access plus the caller's
/// unlocked key set. Owned by the request for its lifetime; nothing is
/// shared across requests.
pub struct ExportPipeline<'a> {
    blobs: &'a BlobStore,
    decryptor: Decryptor,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(blobs: &'a BlobStore, decryptor: Decryptor) -> Self {
        Self { blobs, decryptor }
    }

    /// The key set to filter the repository streams with.
    pub fn decryptable_keys(&self) -> std::collections::HashSet<KeyId> {
        self.decryptor.key_ids()
    }

    /// Render an archive of payloads and media. See [`archive::render`].
    pub fn render_archive<W, R, A>(
        &self,
        rows: R,
        attachments: A,
        writer: W,
    ) -> Result<ArchiveSummary>
    where
        W: Write + Seek,
        R: Iterator<Item = Result<ExportRow>>,
        A: Iterator<Item = Result<AttachmentRow>>,
    {
        archive::render(self.blobs, &self.decryptor, rows, attachments, writer)
    }

    /// Render flattened tabular data. See [`tabular::render`].
    pub fn render_tabular<W, F, R>(
        &self,
        schema: &[FieldNode],
        rows: R,
        sink: F,
    ) -> Result<TabularSummary>
    where
        W: Write,
        F: FnMut(&str) -> std::io::Result<W>,
        R: Iterator<Item = Result<ExportRow>>,
    {
        tabular::render(self.blobs, &self.decryptor, schema, rows, sink)
    }
}

/// Resolve the plaintext payload of an export row, if any.
///
/// - `Ok(Some(bytes))` — plaintext available (raw or decrypted).
/// - `Ok(None)` — nothing to render: the row is flagged encrypted-no-data,
///   or its ciphertext blob was never uploaded or is missing from disk.
/// - `Err(Undecryptable)` — the key set should open this row but decryption
///   failed; aborts the in-flight export.
pub(crate) fn resolve_payload(
    blobs: &BlobStore,
    decryptor: &Decryptor,
    row: &ExportRow,
) -> Result<Option<Vec<u8>>> {
    match &row.crypto {
        RowCrypto::Plain => Ok(row.def.xml.as_ref().map(|xml| xml.clone().into_bytes())),
        RowCrypto::Undecryptable => Ok(None),
        RowCrypto::Decryptable { enc_blob: None } => {
            tracing::warn!(
                instance_id = %row.submission.instance_id,
                "Encrypted payload never uploaded; rendering without it"
            );
            Ok(None)
        }
        RowCrypto::Decryptable {
            enc_blob: Some((blob_id, index)),
        } => {
            let ciphertext = match blobs.read(blob_id) {
                Ok(bytes) => bytes,
                Err(_) => {
                    tracing::warn!(
                        instance_id = %row.submission.instance_id,
                        blob_id = %blob_id,
                        "Payload blob metadata present but content missing"
                    );
                    return Ok(None);
                }
            };

            // Both are present whenever the row is Decryptable.
            let key_id = row.key_id.expect("decryptable row has a key id");
            let local_key = row.def.local_key.as_deref().expect("encrypted def has a local key");

            decryptor
                .decrypt(
                    &ciphertext,
                    key_id,
                    local_key,
                    &row.submission.instance_id,
                    *index,
                )
                .map(Some)
        }
    }
}

/// Sanitize a name for use as an archive entry component.
///
/// Path separators and control characters are replaced, leading dots are
/// dropped. Distinct inputs may collapse to the same output; that is
/// accepted — the archive format permits duplicate entry names and the
/// consuming client disambiguates.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_ordinary_names() {
        assert_eq!(sanitize_filename("photo 1.jpg"), "photo 1.jpg");
        assert_eq!(sanitize_filename("audio-2.m4a"), "audio-2.m4a");
    }

    #[test]
    fn sanitize_neutralizes_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b/c"), "a_b_c");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("..."), "file");
    }
}

/// End-to-end coverage of the full pipeline: client-side encryption, ingest,
/// and export back out through the key vault.
#[cfg(test)]
mod pipeline_tests {
    use std::io::{Cursor, Read};

    use rsa::pkcs8::DecodePublicKey;
    use rsa::RsaPublicKey;
    use tokio_util::sync::CancellationToken;

    use crate::crypto::keyvault::KeyVault;
    use crate::crypto::{encrypt_file, generate_symmetric_key, wrap_submission_key};
    use crate::export::tabular::STATUS_MISSING_ENCRYPTED;
    use crate::ingest::{SubmissionIngest, Submitter};
    use crate::storage::database::SubmissionDatabase;
    use crate::storage::repository::submissions::{Paging, SubmissionRepository};
    use crate::storage::{BlobStore, StoragePaths};

    use super::ExportPipeline;

    struct Fixture {
        db: SubmissionDatabase,
        blobs: BlobStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = SubmissionDatabase::open(&dir.path().join("test.redb")).unwrap();
        let blobs = BlobStore::open(StoragePaths::new(dir.path())).unwrap();
        Fixture {
            db,
            blobs,
            _dir: dir,
        }
    }

    fn submitter() -> Submitter {
        Submitter {
            id: "s1".to_string(),
            display_name: "Enumerator".to_string(),
        }
    }

    /// Client-side: encrypt a submission body + one media file against a
    /// project public key, producing the envelope and the ciphertexts.
    fn encrypt_client_side(
        public_pem: &str,
        instance_id: &str,
        body: &[u8],
        media: &[u8],
    ) -> (String, Vec<u8>, Vec<u8>) {
        let public = RsaPublicKey::from_public_key_pem(public_pem).unwrap();
        let symmetric = generate_symmetric_key();
        let local_key = wrap_submission_key(&public, &symmetric).unwrap();

        // Media first (index 0), body last (index 1), as transmitted.
        let media_ct = encrypt_file(&symmetric, instance_id, 0, media).unwrap();
        let body_ct = encrypt_file(&symmetric, instance_id, 1, body).unwrap();

        let envelope = format!(
            r#"<data id="census" version="1" encrypted="yes">
                <base64EncryptedKey>{local_key}</base64EncryptedKey>
                <meta><instanceID>{instance_id}</instanceID></meta>
                <media><file>photo.jpg.enc</file></media>
                <encryptedXmlFile>submission.xml.enc</encryptedXmlFile>
            </data>"#
        );
        (envelope, body_ct, media_ct)
    }

    #[test]
    fn encrypted_submission_roundtrips_byte_identical() {
        let f = fixture();
        let vault = KeyVault::new(&f.db);
        let key_id = vault.generate_managed("passphrase one", None).unwrap();
        f.db.publish_form("p1", "census", "1", Some(key_id)).unwrap();

        let body = br#"<data id="census" version="1"><meta><instanceID>uuid:rt</instanceID></meta><name>Ada</name></data>"#;
        let media = b"jpeg bytes";
        let public_pem = vault.get(key_id).unwrap().public_key_pem;
        let (envelope, body_ct, media_ct) =
            encrypt_client_side(&public_pem, "uuid:rt", body, media);

        let ingest = SubmissionIngest::new(&f.db, &f.blobs);
        ingest
            .create_all("p1", "census", envelope.as_bytes(), &submitter(), None, &[])
            .unwrap();
        ingest
            .attach("p1", "census", "uuid:rt", "photo.jpg.enc", &media_ct, "application/octet-stream")
            .unwrap();
        ingest
            .attach(
                "p1",
                "census",
                "uuid:rt",
                "submission.xml.enc",
                &body_ct,
                "application/octet-stream",
            )
            .unwrap();

        // Export with the correct passphrase
        let decryptor = vault.resolve_decryptable_keys("passphrase one", "p1").unwrap();
        let pipeline = ExportPipeline::new(&f.blobs, decryptor);
        let keys = pipeline.decryptable_keys();

        let repo = SubmissionRepository::new(&f.db, &f.blobs);
        let rows = repo.stream_export_rows(
            "p1",
            "census",
            &keys,
            Paging::default(),
            CancellationToken::new(),
        );
        let attachments =
            repo.stream_export_attachments("p1", "census", &keys, CancellationToken::new());

        let mut buf = Cursor::new(Vec::new());
        let summary = pipeline.render_archive(rows, attachments, &mut buf).unwrap();
        assert_eq!(summary.payload_entries, 1);
        assert_eq!(summary.media_entries, 1);

        let mut archive = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        let mut payload = Vec::new();
        archive
            .by_name("submissions/uuid_rt.xml")
            .unwrap()
            .read_to_end(&mut payload)
            .unwrap();
        assert_eq!(payload, body, "decrypted payload must be byte-identical");

        let mut media_out = Vec::new();
        archive
            .by_name("media/photo.jpg")
            .unwrap()
            .read_to_end(&mut media_out)
            .unwrap();
        assert_eq!(media_out, media);
    }

    #[test]
    fn key_scoping_exposes_only_unlocked_submissions() {
        let f = fixture();
        let vault = KeyVault::new(&f.db);

        // Two historical keys across a rotation
        let key_a = vault.generate_managed("alpha", None).unwrap();
        f.db.publish_form("p1", "census", "1", Some(key_a)).unwrap();
        let key_b = vault.generate_managed("bravo", None).unwrap();
        f.db.publish_form("p1", "census", "2", Some(key_b)).unwrap();

        let ingest = SubmissionIngest::new(&f.db, &f.blobs);

        // One submission under each key; version must match at ingest time
        for (passkey, instance, version) in
            [(key_a, "uuid:ka", "1"), (key_b, "uuid:kb", "2")]
        {
            // Re-point the form's current version for the second ingest
            if version == "1" {
                f.db.publish_form("p1", "census", "1", Some(key_a)).unwrap();
            } else {
                f.db.publish_form("p1", "census", "2", Some(key_b)).unwrap();
            }
            let body = format!(
                r#"<data id="census" version="{version}"><meta><instanceID>{instance}</instanceID></meta><name>x</name></data>"#
            );
            let public_pem = vault.get(passkey).unwrap().public_key_pem;
            let public = RsaPublicKey::from_public_key_pem(&public_pem).unwrap();
            let symmetric = generate_symmetric_key();
            let local_key = wrap_submission_key(&public, &symmetric).unwrap();
            let body_ct = encrypt_file(&symmetric, instance, 0, body.as_bytes()).unwrap();

            let envelope = format!(
                r#"<data id="census" version="{version}">
                    <base64EncryptedKey>{local_key}</base64EncryptedKey>
                    <meta><instanceID>{instance}</instanceID></meta>
                    <encryptedXmlFile>submission.xml.enc</encryptedXmlFile>
                </data>"#
            );
            ingest
                .create_all("p1", "census", envelope.as_bytes(), &submitter(), None, &[])
                .unwrap();
            ingest
                .attach(
                    "p1",
                    "census",
                    instance,
                    "submission.xml.enc",
                    &body_ct,
                    "application/octet-stream",
                )
                .unwrap();
        }

        // Unlock only key_a
        let decryptor = vault.resolve_decryptable_keys("alpha", "p1").unwrap();
        assert_eq!(decryptor.key_ids(), [key_a].into_iter().collect());
        let pipeline = ExportPipeline::new(&f.blobs, decryptor);
        let keys = pipeline.decryptable_keys();

        let repo = SubmissionRepository::new(&f.db, &f.blobs);
        let rows: Vec<_> = repo
            .stream_export_rows(
                "p1",
                "census",
                &keys,
                Paging::default(),
                CancellationToken::new(),
            )
            .collect::<crate::error::Result<_>>()
            .unwrap();

        // Both rows emitted (stable counts), only one decryptable
        assert_eq!(rows.len(), 2);
        let locked: Vec<_> = rows.iter().filter(|r| r.has_encrypted_data_only()).collect();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].submission.instance_id, "uuid:kb");

        // Tabular: unlocked row has data, locked row is a marker
        let schema = vec![crate::schema::FieldNode::Leaf {
            name: "name".to_string(),
            data_type: crate::schema::FieldType::Text,
        }];
        let rows = repo.stream_export_rows(
            "p1",
            "census",
            &keys,
            Paging::default(),
            CancellationToken::new(),
        );

        use std::cell::RefCell;
        use std::rc::Rc;
        let out: Rc<RefCell<Vec<u8>>> = Default::default();
        struct Buf(Rc<RefCell<Vec<u8>>>);
        impl std::io::Write for Buf {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(b);
                Ok(b.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let summary = pipeline
            .render_tabular(&schema, rows, |_| Ok(Buf(out.clone())))
            .unwrap();
        assert_eq!(summary.main_rows, 2);
        assert_eq!(summary.undecryptable_rows, 1);

        let text = String::from_utf8(out.borrow().clone()).unwrap();
        let locked_line = text
            .lines()
            .find(|l| l.contains("uuid:kb"))
            .expect("locked row present");
        assert!(locked_line.ends_with(STATUS_MISSING_ENCRYPTED));
        let open_line = text
            .lines()
            .find(|l| l.contains("uuid:ka"))
            .expect("unlocked row present");
        assert!(open_line.contains(",x,"));
    }
}
