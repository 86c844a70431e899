// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Archive rendering: payloads plus media files in a zip.
//!
//! ## Entry Layout
//!
//! ```text
//! submissions/{instance id}.xml    # raw or decrypted payload
//! media/{name}                     # raw or decrypted attachment content
//! ```
//!
//! Names are sanitized; collisions are accepted (zip permits duplicate entry
//! names). A recorded attachment with no uploaded blob renders as a
//! zero-length placeholder, not a failure. The archive is finalized exactly
//! once, after the attachment stream signals end-of-stream.

use std::io::{Seek, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::crypto::keyvault::Decryptor;
use crate::error::Result;
use crate::storage::blobs::BlobStore;
use crate::storage::repository::submissions::{AttachmentRow, ExportRow};

use super::{resolve_payload, sanitize_filename};

/// What an archive render produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Payload entries written under `submissions/`.
    pub payload_entries: usize,
    /// Media entries written under `media/`.
    pub media_entries: usize,
    /// Media entries rendered as zero-length placeholders (missing blob).
    pub placeholders: usize,
}

/// Stream rows and attachments into a zip archive.
pub fn render<W, R, A>(
    blobs: &BlobStore,
    decryptor: &Decryptor,
    rows: R,
    attachments: A,
    writer: W,
) -> Result<ArchiveSummary>
where
    W: Write + Seek,
    R: Iterator<Item = Result<ExportRow>>,
    A: Iterator<Item = Result<AttachmentRow>>,
{
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();

    for row in rows {
        let row = row?;
        let Some(payload) = resolve_payload(blobs, decryptor, &row)? else {
            continue;
        };
        let name = format!(
            "submissions/{}.xml",
            sanitize_filename(&row.submission.instance_id)
        );
        zip.start_file(name, options)?;
        zip.write_all(&payload)?;
        summary.payload_entries += 1;
    }

    for attachment in attachments {
        let attachment = attachment?;
        let (content, placeholder) = attachment_content(blobs, decryptor, &attachment)?;

        let mut name = attachment.name.clone();
        if attachment.crypto.is_some() {
            // Decrypted media drops the transport suffix.
            if let Some(stripped) = name.strip_suffix(".enc") {
                name = stripped.to_string();
            }
        }

        zip.start_file(format!("media/{}", sanitize_filename(&name)), options)?;
        zip.write_all(&content)?;
        summary.media_entries += 1;
        if placeholder {
            summary.placeholders += 1;
        }
    }

    // End-of-stream: finalize exactly once.
    zip.finish()?;

    tracing::info!(
        payloads = summary.payload_entries,
        media = summary.media_entries,
        placeholders = summary.placeholders,
        "Archive export rendered"
    );
    Ok(summary)
}

/// Content bytes for one attachment row, with a placeholder flag.
fn attachment_content(
    blobs: &BlobStore,
    decryptor: &Decryptor,
    attachment: &AttachmentRow,
) -> Result<(Vec<u8>, bool)> {
    let Some(blob_id) = attachment.blob_id.as_deref() else {
        return Ok((Vec::new(), true));
    };
    let content = match blobs.read(blob_id) {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::warn!(
                name = %attachment.name,
                blob_id = %blob_id,
                "Attachment blob metadata present but content missing"
            );
            return Ok((Vec::new(), true));
        }
    };

    match &attachment.crypto {
        Some((key_id, local_key)) => {
            let plaintext = decryptor.decrypt(
                &content,
                *key_id,
                local_key,
                &attachment.instance_id,
                attachment.index,
            )?;
            Ok((plaintext, false))
        }
        None => Ok((content, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    use crate::storage::StoragePaths;

    fn test_blobs() -> (BlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(StoragePaths::new(dir.path())).unwrap();
        (blobs, dir)
    }

    fn plain_row(instance: &str, xml: &str) -> ExportRow {
        use crate::storage::repository::submissions::{RowCrypto, Submission, SubmissionDef};
        use chrono::Utc;
        ExportRow {
            submission: Submission {
                id: 1,
                project_id: "p1".to_string(),
                form_id: "census".to_string(),
                instance_id: instance.to_string(),
                submitter_id: "s1".to_string(),
                submitter_name: "Enumerator".to_string(),
                device_id: None,
                created_at: Utc::now(),
                deleted_at: None,
            },
            def: SubmissionDef {
                id: 1,
                submission_id: 1,
                form_version: "1".to_string(),
                xml: Some(xml.to_string()),
                local_key: None,
                enc_data_attachment_name: None,
                signature: None,
                created_at: Utc::now(),
            },
            key_id: None,
            crypto: RowCrypto::Plain,
        }
    }

    fn read_entry(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
        let mut file = archive.by_name(name).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        content
    }

    #[test]
    fn renders_payloads_and_media() {
        let (blobs, _dir) = test_blobs();
        let decryptor = Decryptor::none();

        let blob_id = blobs.write(b"jpeg bytes").unwrap();
        let rows = vec![Ok(plain_row("uuid:one", "<data>1</data>"))];
        let attachments = vec![Ok(AttachmentRow {
            instance_id: "uuid:one".to_string(),
            name: "photo.jpg".to_string(),
            index: 0,
            blob_id: Some(blob_id),
            crypto: None,
        })];

        let mut buf = Cursor::new(Vec::new());
        let summary = render(
            &blobs,
            &decryptor,
            rows.into_iter(),
            attachments.into_iter(),
            &mut buf,
        )
        .unwrap();
        assert_eq!(summary.payload_entries, 1);
        assert_eq!(summary.media_entries, 1);
        assert_eq!(summary.placeholders, 0);

        let mut archive = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(
            read_entry(&mut archive, "submissions/uuid_one.xml"),
            b"<data>1</data>"
        );
        assert_eq!(read_entry(&mut archive, "media/photo.jpg"), b"jpeg bytes");
    }

    #[test]
    fn missing_blob_renders_zero_length_placeholder() {
        let (blobs, _dir) = test_blobs();
        let decryptor = Decryptor::none();

        let attachments = vec![
            // metadata exists, content never uploaded
            Ok(AttachmentRow {
                instance_id: "uuid:one".to_string(),
                name: "never-uploaded.jpg".to_string(),
                index: 0,
                blob_id: None,
                crypto: None,
            }),
            // metadata points at content missing from disk
            Ok(AttachmentRow {
                instance_id: "uuid:one".to_string(),
                name: "vanished.jpg".to_string(),
                index: 1,
                blob_id: Some("0".repeat(64)),
                crypto: None,
            }),
        ];

        let mut buf = Cursor::new(Vec::new());
        let summary = render(
            &blobs,
            &decryptor,
            std::iter::empty(),
            attachments.into_iter(),
            &mut buf,
        )
        .unwrap();
        assert_eq!(summary.media_entries, 2);
        assert_eq!(summary.placeholders, 2);

        let mut archive = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert!(read_entry(&mut archive, "media/never-uploaded.jpg").is_empty());
        assert!(read_entry(&mut archive, "media/vanished.jpg").is_empty());
    }

    #[test]
    fn undecryptable_rows_contribute_no_payload_entry() {
        let (blobs, _dir) = test_blobs();
        let decryptor = Decryptor::none();

        let mut row = plain_row("uuid:locked", "<unused/>");
        row.def.xml = None;
        row.def.local_key = Some("wrapped".to_string());
        row.key_id = Some(9);
        row.crypto = crate::storage::repository::submissions::RowCrypto::Undecryptable;

        let mut buf = Cursor::new(Vec::new());
        let summary = render(
            &blobs,
            &decryptor,
            vec![Ok(row)].into_iter(),
            std::iter::empty(),
            &mut buf,
        )
        .unwrap();
        assert_eq!(summary.payload_entries, 0);

        // The archive still finalizes cleanly.
        let archive = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(archive.len(), 0);
    }
}
