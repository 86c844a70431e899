// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Submission repository: append-only version history and export streams.
//!
//! ## Versioning Model
//!
//! A submission is created once per (project, form, instance id) and never
//! overwritten. Every accepted write appends a `SubmissionDef` row; the
//! "current" def is the one with the maximum creation order, an explicit
//! sequence number assigned inside the write transaction. Attachment
//! join-rows are created with their def in the same transaction and mutated
//! only to set or clear their blob reference.
//!
//! ## Export Streams
//!
//! [`SubmissionRepository::stream_export_rows`] and
//! [`SubmissionRepository::stream_export_attachments`] are pull-based
//! iterators. Each pull drains an internal buffer holding at most one page
//! fetched from a single read snapshot, so memory stays bounded regardless of
//! result size, and a consumer that stops pulling stops all further work. A
//! cancelled [`CancellationToken`] terminates the stream at the next pull.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EXPORT_PAGE_SIZE;
use crate::crypto::keyvault::KeyId;
use crate::error::Result;
use crate::storage::blobs::{BlobMeta, BlobStore};
use crate::storage::database::{ExportEntry, SubmissionDatabase};

pub type SubmissionId = u64;

// =============================================================================
// Stored models
// =============================================================================

/// One logical submission: created on first envelope, never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub project_id: String,
    pub form_id: String,
    /// Unique within (project, form); client-supplied or generated.
    pub instance_id: String,
    pub submitter_id: String,
    /// Denormalized for export rendering.
    pub submitter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Soft delete marker; deleted submissions are excluded from export.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One version of a submission's content. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionDef {
    /// Global def sequence number; doubles as the creation order.
    pub id: u64,
    pub submission_id: SubmissionId,
    /// Form version this def was submitted against.
    pub form_version: String,
    /// Raw payload; `None` when the payload is encrypted and stored only as
    /// ciphertext in the encrypted-body pseudo-attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xml: Option<String>,
    /// Base64 client-wrapped symmetric key; present only for encrypted defs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    /// Name of the pseudo-attachment holding the encrypted payload body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc_data_attachment_name: Option<String>,
    /// Client integrity signature, stored verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SubmissionDef {
    /// Whether this def's payload is envelope-encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.local_key.is_some()
    }
}

/// Attachment join-row, keyed by (def, name) — no surrogate key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionAttachment {
    pub def_id: u64,
    pub name: String,
    /// Ordinal position; feeds the per-file IV derivation for encrypted
    /// submissions.
    pub index: u32,
    /// `None` until binary content is uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
}

// =============================================================================
// Write-path inputs
// =============================================================================

/// Attributes of a submission to be created.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub project_id: String,
    pub form_id: String,
    pub instance_id: String,
    pub submitter_id: String,
    pub submitter_name: String,
    pub device_id: Option<String>,
}

/// Content of a def to be appended.
#[derive(Debug, Clone)]
pub struct NewDef {
    pub form_version: String,
    pub xml: Option<String>,
    pub local_key: Option<String>,
    pub enc_data_attachment_name: Option<String>,
    pub signature: Option<String>,
}

impl NewDef {
    /// Content equality against a stored def, used to recognize byte-identical
    /// resubmissions.
    pub(crate) fn matches(&self, stored: &SubmissionDef) -> bool {
        self.xml == stored.xml
            && self.local_key == stored.local_key
            && self.enc_data_attachment_name == stored.enc_data_attachment_name
            && self.signature == stored.signature
    }

    pub(crate) fn to_row(
        &self,
        id: u64,
        submission_id: SubmissionId,
        created_at: DateTime<Utc>,
    ) -> SubmissionDef {
        SubmissionDef {
            id,
            submission_id,
            form_version: self.form_version.clone(),
            xml: self.xml.clone(),
            local_key: self.local_key.clone(),
            enc_data_attachment_name: self.enc_data_attachment_name.clone(),
            signature: self.signature.clone(),
            created_at,
        }
    }
}

/// An attachment slot to create alongside a def (content arrives later).
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub name: String,
    pub index: u32,
}

/// Result of a submission create: stored fresh, or recognized as a
/// byte-identical resubmission.
#[derive(Debug)]
pub enum CreateOutcome {
    Created {
        submission: Submission,
        def: SubmissionDef,
    },
    Duplicate {
        submission: Submission,
        def: SubmissionDef,
    },
}

impl CreateOutcome {
    pub fn def(&self) -> &SubmissionDef {
        match self {
            CreateOutcome::Created { def, .. } | CreateOutcome::Duplicate { def, .. } => def,
        }
    }

    pub fn submission(&self) -> &Submission {
        match self {
            CreateOutcome::Created { submission, .. }
            | CreateOutcome::Duplicate { submission, .. } => submission,
        }
    }
}

// =============================================================================
// Export row types
// =============================================================================

/// Offset/limit paging for the export row stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paging {
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Decryptability of one export row under the caller's key set.
#[derive(Debug, Clone)]
pub enum RowCrypto {
    /// Plaintext payload on the def itself.
    Plain,
    /// Protecting key is in the caller's set; ciphertext lives in the
    /// encrypted-body pseudo-attachment's blob (when uploaded).
    Decryptable { enc_blob: Option<(String, u32)> },
    /// Protecting key is absent from the caller's set. The row is still
    /// emitted so counts and paging stay stable, but carries no plaintext.
    Undecryptable,
}

/// One export row: a submission joined with its current def.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub submission: Submission,
    pub def: SubmissionDef,
    pub key_id: Option<KeyId>,
    pub crypto: RowCrypto,
}

impl ExportRow {
    /// True when the row carries only the "has encrypted data" flag.
    pub fn has_encrypted_data_only(&self) -> bool {
        matches!(self.crypto, RowCrypto::Undecryptable)
    }
}

/// One media attachment of a submission's current def.
#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub instance_id: String,
    pub name: String,
    pub index: u32,
    pub blob_id: Option<String>,
    /// Wrap material for encrypted attachments: (key id, local key).
    /// `None` for plaintext submissions.
    pub crypto: Option<(KeyId, String)>,
}

// =============================================================================
// SubmissionRepository
// =============================================================================

/// Repository owning the Submission/SubmissionDef/SubmissionAttachment
/// lifecycle.
pub struct SubmissionRepository<'a> {
    db: &'a SubmissionDatabase,
    blobs: &'a BlobStore,
}

impl<'a> SubmissionRepository<'a> {
    pub fn new(db: &'a SubmissionDatabase, blobs: &'a BlobStore) -> Self {
        Self { db, blobs }
    }

    /// Atomically create a submission with its first def and attachment
    /// slots. See [`SubmissionDatabase::create_submission`] for the
    /// duplicate/conflict semantics.
    pub fn create(
        &self,
        new: &NewSubmission,
        def: &NewDef,
        attachment_slots: &[NewAttachment],
    ) -> Result<CreateOutcome> {
        self.db.create_submission(new, def, attachment_slots)
    }

    /// Append a new version to an existing submission.
    pub fn append_version(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
        def: &NewDef,
        attachment_slots: &[NewAttachment],
    ) -> Result<SubmissionDef> {
        self.db
            .append_def(project_id, form_id, instance_id, def, attachment_slots)
    }

    /// Store binary content for an attachment slot and point the slot at it.
    pub fn attach_blob(
        &self,
        def_id: u64,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<SubmissionAttachment> {
        let blob_id = self.blobs.write(content)?;
        let meta = BlobMeta {
            content_type: content_type.to_string(),
            size: content.len() as u64,
        };
        tracing::debug!(def_id, name, blob_id = %blob_id, size = meta.size, "Attachment content stored");
        self.db.set_attachment_blob(def_id, name, Some((&blob_id, &meta)))
    }

    pub fn get_submission(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
    ) -> Result<Option<Submission>> {
        self.db.get_submission(project_id, form_id, instance_id)
    }

    pub fn get_current_def(&self, submission_id: SubmissionId) -> Result<SubmissionDef> {
        self.db.get_current_def(submission_id)
    }

    pub fn get_current_def_by_keys(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
    ) -> Result<SubmissionDef> {
        self.db
            .get_current_def_by_keys(project_id, form_id, instance_id)
    }

    pub fn soft_delete(&self, project_id: &str, form_id: &str, instance_id: &str) -> Result<()> {
        self.db
            .soft_delete_submission(project_id, form_id, instance_id)
    }

    /// Stream export rows for a form: one row per non-deleted submission,
    /// current def only, newest first. Restartable per call, not resumable
    /// mid-stream.
    pub fn stream_export_rows(
        &self,
        project_id: &str,
        form_id: &str,
        decryptable_keys: &HashSet<KeyId>,
        paging: Paging,
        cancel: CancellationToken,
    ) -> ExportRows<'a> {
        ExportRows {
            db: self.db,
            project_id: project_id.to_string(),
            form_id: form_id.to_string(),
            keys: decryptable_keys.clone(),
            cancel,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            skip: paging.offset,
            remaining: paging.limit,
            failed: false,
        }
    }

    /// Stream media attachments of current defs, restricted by the same
    /// decryptable-key filter as the row stream. The encrypted-body
    /// pseudo-attachment is not a media file and is not emitted here.
    pub fn stream_export_attachments(
        &self,
        project_id: &str,
        form_id: &str,
        decryptable_keys: &HashSet<KeyId>,
        cancel: CancellationToken,
    ) -> AttachmentRows<'a> {
        AttachmentRows {
            db: self.db,
            project_id: project_id.to_string(),
            form_id: form_id.to_string(),
            keys: decryptable_keys.clone(),
            cancel,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            failed: false,
        }
    }
}

fn entry_to_row(entry: ExportEntry, keys: &HashSet<KeyId>) -> ExportRow {
    let crypto = match (&entry.def.local_key, entry.key_id) {
        (None, _) => RowCrypto::Plain,
        (Some(_), Some(key_id)) if keys.contains(&key_id) => {
            let enc_blob = entry
                .def
                .enc_data_attachment_name
                .as_deref()
                .and_then(|name| entry.attachments.iter().find(|a| a.name == name))
                .and_then(|slot| slot.blob_id.clone().map(|b| (b, slot.index)));
            RowCrypto::Decryptable { enc_blob }
        }
        // Encrypted but the protecting key is unknown or locked.
        (Some(_), _) => RowCrypto::Undecryptable,
    };

    ExportRow {
        submission: entry.submission,
        def: entry.def,
        key_id: entry.key_id,
        crypto,
    }
}

// =============================================================================
// Row stream
// =============================================================================

/// Lazy, pull-based export row stream. See
/// [`SubmissionRepository::stream_export_rows`].
pub struct ExportRows<'a> {
    db: &'a SubmissionDatabase,
    project_id: String,
    form_id: String,
    keys: HashSet<KeyId>,
    cancel: CancellationToken,
    cursor: Option<SubmissionId>,
    buffer: VecDeque<ExportEntry>,
    exhausted: bool,
    skip: usize,
    remaining: Option<usize>,
    failed: bool,
}

impl Iterator for ExportRows<'_> {
    type Item = Result<ExportRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == Some(0) {
            return None;
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(form_id = %self.form_id, "Export row stream cancelled");
            return None;
        }

        loop {
            if let Some(entry) = self.buffer.pop_front() {
                if self.skip > 0 {
                    self.skip -= 1;
                    continue;
                }
                if let Some(n) = self.remaining.as_mut() {
                    *n -= 1;
                }
                return Some(Ok(entry_to_row(entry, &self.keys)));
            }

            if self.exhausted {
                return None;
            }

            match self
                .db
                .export_page(&self.project_id, &self.form_id, self.cursor, EXPORT_PAGE_SIZE)
            {
                Ok(page) => {
                    self.cursor = page.cursor;
                    self.exhausted = page.exhausted;
                    if page.entries.is_empty() && self.exhausted {
                        return None;
                    }
                    self.buffer.extend(page.entries);
                }
                Err(e) => {
                    // Surface storage failures as a terminal stream error
                    // rather than silently truncating output.
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// =============================================================================
// Attachment stream
// =============================================================================

/// Lazy, pull-based attachment stream. See
/// [`SubmissionRepository::stream_export_attachments`].
pub struct AttachmentRows<'a> {
    db: &'a SubmissionDatabase,
    project_id: String,
    form_id: String,
    keys: HashSet<KeyId>,
    cancel: CancellationToken,
    cursor: Option<SubmissionId>,
    buffer: VecDeque<AttachmentRow>,
    exhausted: bool,
    failed: bool,
}

impl AttachmentRows<'_> {
    fn expand(&mut self, entry: ExportEntry) {
        let encrypted = entry.def.is_encrypted();
        if encrypted {
            let decryptable = entry
                .key_id
                .map(|key_id| self.keys.contains(&key_id))
                .unwrap_or(false);
            if !decryptable {
                // Same key filter as the row stream: nothing to emit that a
                // caller could ever decrypt.
                return;
            }
        }

        let wrap = match (&entry.def.local_key, entry.key_id) {
            (Some(local_key), Some(key_id)) => Some((key_id, local_key.clone())),
            _ => None,
        };

        for attachment in entry.attachments {
            if Some(attachment.name.as_str()) == entry.def.enc_data_attachment_name.as_deref() {
                continue;
            }
            self.buffer.push_back(AttachmentRow {
                instance_id: entry.submission.instance_id.clone(),
                name: attachment.name,
                index: attachment.index,
                blob_id: attachment.blob_id,
                crypto: if encrypted { wrap.clone() } else { None },
            });
        }
    }
}

impl Iterator for AttachmentRows<'_> {
    type Item = Result<AttachmentRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(form_id = %self.form_id, "Export attachment stream cancelled");
            return None;
        }

        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.exhausted {
                return None;
            }

            match self
                .db
                .export_page(&self.project_id, &self.form_id, self.cursor, EXPORT_PAGE_SIZE)
            {
                Ok(page) => {
                    self.cursor = page.cursor;
                    self.exhausted = page.exhausted;
                    for entry in page.entries {
                        self.expand(entry);
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
