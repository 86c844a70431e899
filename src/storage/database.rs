// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded submission database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `submissions`: submission id → serialized Submission
//! - `submission_index`: composite key (project|form|instance) → submission id
//! - `form_submissions`: composite key (project|form|!id_be) → submission id
//! - `submission_defs`: def id → serialized SubmissionDef
//! - `defs_by_submission`: composite key (id_be|!def_id_be) → def id
//! - `submission_attachments`: composite key (def_id_be|name) → serialized attachment
//! - `blobs`: blob id → serialized BlobMeta
//! - `keys`: key id → serialized Key
//! - `keys_by_public`: sha256(public pem) → key id
//! - `forms`: composite key (project|form) → serialized Form
//! - `form_defs`: composite key (project|form|version) → serialized FormDef
//! - `sequences`: sequence name → last assigned value
//!
//! Def ids are assigned from the `sequences` table inside the same write
//! transaction as the def insert, so creation order is an explicit monotonic
//! sequence rather than a property of any storage-engine row identifier.
//! The inverted def id in `defs_by_submission` keys makes the first row of a
//! range scan the current def.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};

use crate::crypto::keyvault::{Key, KeyId};
use crate::error::{Error, Result};

use super::blobs::BlobMeta;
use super::repository::forms::{Form, FormDef};
use super::repository::submissions::{
    CreateOutcome, NewAttachment, NewDef, NewSubmission, Submission, SubmissionAttachment,
    SubmissionDef, SubmissionId,
};

// =============================================================================
// Table Definitions
// =============================================================================

const SUBMISSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("submissions");
const SUBMISSION_INDEX: TableDefinition<&str, u64> = TableDefinition::new("submission_index");
const FORM_SUBMISSIONS: TableDefinition<&[u8], u64> = TableDefinition::new("form_submissions");
const SUBMISSION_DEFS: TableDefinition<u64, &[u8]> = TableDefinition::new("submission_defs");
const DEFS_BY_SUBMISSION: TableDefinition<&[u8], u64> =
    TableDefinition::new("defs_by_submission");
const ATTACHMENTS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("submission_attachments");
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const KEYS: TableDefinition<u64, &[u8]> = TableDefinition::new("keys");
const KEYS_BY_PUBLIC: TableDefinition<&str, u64> = TableDefinition::new("keys_by_public");
const FORMS: TableDefinition<&str, &[u8]> = TableDefinition::new("forms");
const FORM_DEFS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("form_defs");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Sequence names.
const SEQ_SUBMISSIONS: &str = "submissions";
const SEQ_DEFS: &str = "submission_defs";
const SEQ_KEYS: &str = "keys";

// =============================================================================
// Composite Key Helpers
// =============================================================================

fn submission_index_key(project_id: &str, form_id: &str, instance_id: &str) -> String {
    format!("{project_id}|{form_id}|{instance_id}")
}

fn form_key(project_id: &str, form_id: &str) -> String {
    format!("{project_id}|{form_id}")
}

fn form_def_key(project_id: &str, form_id: &str, version: &str) -> Vec<u8> {
    format!("{project_id}|{form_id}|{version}").into_bytes()
}

fn form_def_prefix(project_id: &str) -> Vec<u8> {
    format!("{project_id}|").into_bytes()
}

/// Prefix for all `form_submissions` keys of one form.
fn form_scan_prefix(project_id: &str, form_id: &str) -> Vec<u8> {
    format!("{project_id}|{form_id}|").into_bytes()
}

/// Build a `form_submissions` key. The inverted submission id ensures
/// newest-first ordering when scanning forward.
fn form_submission_key(project_id: &str, form_id: &str, submission_id: SubmissionId) -> Vec<u8> {
    let mut key = form_scan_prefix(project_id, form_id);
    key.extend_from_slice(&(!submission_id).to_be_bytes());
    key
}

/// Build a `defs_by_submission` key. The inverted def id makes the first row
/// of a forward range scan the def with the maximum creation order.
fn def_order_key(submission_id: SubmissionId, def_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&submission_id.to_be_bytes());
    key[8..].copy_from_slice(&(!def_id).to_be_bytes());
    key
}

fn def_scan_bounds(submission_id: SubmissionId) -> ([u8; 16], [u8; 16]) {
    let mut start = [0u8; 16];
    start[..8].copy_from_slice(&submission_id.to_be_bytes());
    let mut end = [0xFFu8; 16];
    end[..8].copy_from_slice(&submission_id.to_be_bytes());
    (start, end)
}

fn attachment_key(def_id: u64, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&def_id.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

fn attachment_scan_bounds(def_id: u64) -> (Vec<u8>, Vec<u8>) {
    (
        def_id.to_be_bytes().to_vec(),
        (def_id + 1).to_be_bytes().to_vec(),
    )
}

fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    end.extend_from_slice(&[0xFF; 24]);
    end
}

// =============================================================================
// Export page types
// =============================================================================

/// One submission joined with its current def, protecting key, and the
/// current def's attachment rows — all read from a single snapshot.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub submission: Submission,
    pub def: SubmissionDef,
    /// Key active for the form version this def was submitted against.
    pub key_id: Option<KeyId>,
    pub attachments: Vec<SubmissionAttachment>,
}

/// One page of export entries plus the cursor state for the next page.
#[derive(Debug)]
pub struct ExportPage {
    pub entries: Vec<ExportEntry>,
    /// Submission id of the last index row visited; start the next page
    /// strictly after it.
    pub cursor: Option<SubmissionId>,
    /// True when the scan ran off the end of the form's submissions.
    pub exhausted: bool,
}

// =============================================================================
// SubmissionDatabase
// =============================================================================

/// Embedded ACID database holding all relational submission state.
pub struct SubmissionDatabase {
    db: Database,
}

impl SubmissionDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SUBMISSIONS)?;
            let _ = write_txn.open_table(SUBMISSION_INDEX)?;
            let _ = write_txn.open_table(FORM_SUBMISSIONS)?;
            let _ = write_txn.open_table(SUBMISSION_DEFS)?;
            let _ = write_txn.open_table(DEFS_BY_SUBMISSION)?;
            let _ = write_txn.open_table(ATTACHMENTS)?;
            let _ = write_txn.open_table(BLOBS)?;
            let _ = write_txn.open_table(KEYS)?;
            let _ = write_txn.open_table(KEYS_BY_PUBLIC)?;
            let _ = write_txn.open_table(FORMS)?;
            let _ = write_txn.open_table(FORM_DEFS)?;
            let _ = write_txn.open_table(SEQUENCES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Allocate the next value of a named monotonic sequence.
    ///
    /// Must be called inside the write transaction that uses the value, so
    /// ordering and visibility commit together.
    fn next_seq(txn: &redb::WriteTransaction, name: &str) -> Result<u64> {
        let mut table = txn.open_table(SEQUENCES)?;
        let next = { table.get(name)?.map(|g| g.value()).unwrap_or(0) } + 1;
        table.insert(name, next)?;
        Ok(next)
    }

    /// Resolve the current def of a submission against already-open tables,
    /// i.e. within the caller's snapshot.
    fn current_def_in(
        order: &impl ReadableTable<&'static [u8], u64>,
        defs: &impl ReadableTable<u64, &'static [u8]>,
        submission_id: SubmissionId,
    ) -> Result<Option<SubmissionDef>> {
        let (start, end) = def_scan_bounds(submission_id);
        let mut range = order.range::<&[u8]>(start.as_slice()..end.as_slice())?;
        match range.next() {
            Some(entry) => {
                let def_id = entry?.1.value();
                let guard = defs.get(def_id)?.ok_or_else(|| {
                    Error::ConsistencyFault(format!("def {def_id} indexed but missing"))
                })?;
                Ok(Some(serde_json::from_slice(guard.value())?))
            }
            None => Ok(None),
        }
    }

    fn attachments_in(
        attachments: &impl ReadableTable<&'static [u8], &'static [u8]>,
        def_id: u64,
    ) -> Result<Vec<SubmissionAttachment>> {
        let (start, end) = attachment_scan_bounds(def_id);
        let mut rows = Vec::new();
        for entry in attachments.range::<&[u8]>(start.as_slice()..end.as_slice())? {
            let entry = entry?;
            rows.push(serde_json::from_slice(entry.1.value())?);
        }
        rows.sort_by_key(|a: &SubmissionAttachment| a.index);
        Ok(rows)
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Atomically create a submission, its first def, and its attachment
    /// slots — or recognize a resubmission.
    ///
    /// Byte-identical resubmission returns [`CreateOutcome::Duplicate`] with
    /// the stored rows and writes nothing; differing content is a
    /// [`Error::Conflict`]. Readers never observe the def without its
    /// complete attachment set.
    pub fn create_submission(
        &self,
        new: &NewSubmission,
        def: &NewDef,
        attachment_slots: &[NewAttachment],
    ) -> Result<CreateOutcome> {
        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let created: (Submission, SubmissionDef);
        {
            let mut submissions = txn.open_table(SUBMISSIONS)?;
            let mut index = txn.open_table(SUBMISSION_INDEX)?;
            let mut by_form = txn.open_table(FORM_SUBMISSIONS)?;
            let mut defs = txn.open_table(SUBMISSION_DEFS)?;
            let mut order = txn.open_table(DEFS_BY_SUBMISSION)?;
            let mut attachments = txn.open_table(ATTACHMENTS)?;

            let idx_key = submission_index_key(&new.project_id, &new.form_id, &new.instance_id);
            let existing = { index.get(idx_key.as_str())?.map(|g| g.value()) };

            if let Some(submission_id) = existing {
                let submission: Submission = {
                    let guard = submissions.get(submission_id)?.ok_or_else(|| {
                        Error::ConsistencyFault(format!(
                            "submission {submission_id} indexed but missing"
                        ))
                    })?;
                    serde_json::from_slice(guard.value())?
                };
                let current = Self::current_def_in(&order, &defs, submission_id)?
                    .ok_or_else(|| zero_defs_fault(submission_id))?;

                return if def.matches(&current) {
                    tracing::debug!(
                        instance_id = %new.instance_id,
                        "Identical resubmission, nothing to store"
                    );
                    Ok(CreateOutcome::Duplicate {
                        submission,
                        def: current,
                    })
                } else {
                    Err(Error::Conflict(format!(
                        "instance {} already exists with different content",
                        new.instance_id
                    )))
                };
            }

            let submission_id = Self::next_seq(&txn, SEQ_SUBMISSIONS)?;
            let submission = Submission {
                id: submission_id,
                project_id: new.project_id.clone(),
                form_id: new.form_id.clone(),
                instance_id: new.instance_id.clone(),
                submitter_id: new.submitter_id.clone(),
                submitter_name: new.submitter_name.clone(),
                device_id: new.device_id.clone(),
                created_at: now,
                deleted_at: None,
            };
            submissions.insert(submission_id, serde_json::to_vec(&submission)?.as_slice())?;
            index.insert(idx_key.as_str(), submission_id)?;
            by_form.insert(
                form_submission_key(&new.project_id, &new.form_id, submission_id).as_slice(),
                submission_id,
            )?;

            let def_id = Self::next_seq(&txn, SEQ_DEFS)?;
            let def_row = def.to_row(def_id, submission_id, now);
            defs.insert(def_id, serde_json::to_vec(&def_row)?.as_slice())?;
            order.insert(def_order_key(submission_id, def_id).as_slice(), def_id)?;

            for slot in attachment_slots {
                let row = SubmissionAttachment {
                    def_id,
                    name: slot.name.clone(),
                    index: slot.index,
                    blob_id: None,
                };
                attachments.insert(
                    attachment_key(def_id, &slot.name).as_slice(),
                    serde_json::to_vec(&row)?.as_slice(),
                )?;
            }

            created = (submission, def_row);
        }
        txn.commit()?;

        Ok(CreateOutcome::Created {
            submission: created.0,
            def: created.1,
        })
    }

    /// Append a new def (a new version) to an existing submission, with its
    /// attachment slots, in one transaction.
    pub fn append_def(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
        def: &NewDef,
        attachment_slots: &[NewAttachment],
    ) -> Result<SubmissionDef> {
        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let def_row: SubmissionDef;
        {
            let submissions = txn.open_table(SUBMISSIONS)?;
            let index = txn.open_table(SUBMISSION_INDEX)?;
            let mut defs = txn.open_table(SUBMISSION_DEFS)?;
            let mut order = txn.open_table(DEFS_BY_SUBMISSION)?;
            let mut attachments = txn.open_table(ATTACHMENTS)?;

            let idx_key = submission_index_key(project_id, form_id, instance_id);
            let submission_id = { index.get(idx_key.as_str())?.map(|g| g.value()) }
                .ok_or_else(|| Error::NotFound(format!("submission {instance_id}")))?;

            let submission: Submission = {
                let guard = submissions.get(submission_id)?.ok_or_else(|| {
                    Error::ConsistencyFault(format!(
                        "submission {submission_id} indexed but missing"
                    ))
                })?;
                serde_json::from_slice(guard.value())?
            };
            if submission.deleted_at.is_some() {
                return Err(Error::NotFound(format!("submission {instance_id}")));
            }

            let def_id = Self::next_seq(&txn, SEQ_DEFS)?;
            def_row = def.to_row(def_id, submission_id, now);
            defs.insert(def_id, serde_json::to_vec(&def_row)?.as_slice())?;
            order.insert(def_order_key(submission_id, def_id).as_slice(), def_id)?;

            for slot in attachment_slots {
                let row = SubmissionAttachment {
                    def_id,
                    name: slot.name.clone(),
                    index: slot.index,
                    blob_id: None,
                };
                attachments.insert(
                    attachment_key(def_id, &slot.name).as_slice(),
                    serde_json::to_vec(&row)?.as_slice(),
                )?;
            }
        }
        txn.commit()?;
        Ok(def_row)
    }

    /// Set (or clear) the blob reference of an attachment slot, recording
    /// blob metadata alongside.
    pub fn set_attachment_blob(
        &self,
        def_id: u64,
        name: &str,
        blob: Option<(&str, &BlobMeta)>,
    ) -> Result<SubmissionAttachment> {
        let txn = self.db.begin_write()?;
        let updated: SubmissionAttachment;
        {
            let mut attachments = txn.open_table(ATTACHMENTS)?;
            let mut blobs = txn.open_table(BLOBS)?;

            let key = attachment_key(def_id, name);
            let mut row: SubmissionAttachment = {
                let guard = attachments.get(key.as_slice())?.ok_or_else(|| {
                    Error::NotFound(format!("attachment {name} of def {def_id}"))
                })?;
                serde_json::from_slice(guard.value())?
            };

            match blob {
                Some((blob_id, meta)) => {
                    row.blob_id = Some(blob_id.to_string());
                    blobs.insert(blob_id, serde_json::to_vec(meta)?.as_slice())?;
                }
                None => row.blob_id = None,
            }
            attachments.insert(key.as_slice(), serde_json::to_vec(&row)?.as_slice())?;
            updated = row;
        }
        txn.commit()?;
        Ok(updated)
    }

    /// Soft-delete a submission. Its defs and attachments are retained.
    pub fn soft_delete_submission(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut submissions = txn.open_table(SUBMISSIONS)?;
            let index = txn.open_table(SUBMISSION_INDEX)?;

            let idx_key = submission_index_key(project_id, form_id, instance_id);
            let submission_id = { index.get(idx_key.as_str())?.map(|g| g.value()) }
                .ok_or_else(|| Error::NotFound(format!("submission {instance_id}")))?;

            let mut submission: Submission = {
                let guard = submissions.get(submission_id)?.ok_or_else(|| {
                    Error::ConsistencyFault(format!(
                        "submission {submission_id} indexed but missing"
                    ))
                })?;
                serde_json::from_slice(guard.value())?
            };
            submission.deleted_at = Some(Utc::now());
            submissions.insert(submission_id, serde_json::to_vec(&submission)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Look up a submission by its natural key.
    pub fn get_submission(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
    ) -> Result<Option<Submission>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SUBMISSION_INDEX)?;
        let submissions = read_txn.open_table(SUBMISSIONS)?;

        let idx_key = submission_index_key(project_id, form_id, instance_id);
        match { index.get(idx_key.as_str())?.map(|g| g.value()) } {
            Some(submission_id) => {
                let guard = submissions.get(submission_id)?.ok_or_else(|| {
                    Error::ConsistencyFault(format!(
                        "submission {submission_id} indexed but missing"
                    ))
                })?;
                Ok(Some(serde_json::from_slice(guard.value())?))
            }
            None => Ok(None),
        }
    }

    /// Return the def with the maximum creation order for a submission.
    ///
    /// Resolved with a single ordered index scan inside one snapshot — never
    /// two round trips — so a concurrent writer can only make the result
    /// newer, never stale or half-written.
    pub fn get_current_def(&self, submission_id: SubmissionId) -> Result<SubmissionDef> {
        let read_txn = self.db.begin_read()?;
        let submissions = read_txn.open_table(SUBMISSIONS)?;
        let defs = read_txn.open_table(SUBMISSION_DEFS)?;
        let order = read_txn.open_table(DEFS_BY_SUBMISSION)?;

        if submissions.get(submission_id)?.is_none() {
            return Err(Error::NotFound(format!("submission {submission_id}")));
        }
        Self::current_def_in(&order, &defs, submission_id)?
            .ok_or_else(|| zero_defs_fault(submission_id))
    }

    /// [`Self::get_current_def`] addressed by natural key, resolved in the
    /// same snapshot as the index lookup.
    pub fn get_current_def_by_keys(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
    ) -> Result<SubmissionDef> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SUBMISSION_INDEX)?;
        let defs = read_txn.open_table(SUBMISSION_DEFS)?;
        let order = read_txn.open_table(DEFS_BY_SUBMISSION)?;

        let idx_key = submission_index_key(project_id, form_id, instance_id);
        let submission_id = { index.get(idx_key.as_str())?.map(|g| g.value()) }
            .ok_or_else(|| Error::NotFound(format!("submission {instance_id}")))?;

        Self::current_def_in(&order, &defs, submission_id)?
            .ok_or_else(|| zero_defs_fault(submission_id))
    }

    /// Fetch one page of export entries for a form, newest submission first,
    /// all joined within a single read snapshot.
    ///
    /// Soft-deleted submissions are skipped without consuming `limit`. The
    /// returned cursor covers skipped rows, so paging always advances.
    pub fn export_page(
        &self,
        project_id: &str,
        form_id: &str,
        after: Option<SubmissionId>,
        limit: usize,
    ) -> Result<ExportPage> {
        let read_txn = self.db.begin_read()?;
        let submissions = read_txn.open_table(SUBMISSIONS)?;
        let by_form = read_txn.open_table(FORM_SUBMISSIONS)?;
        let defs = read_txn.open_table(SUBMISSION_DEFS)?;
        let order = read_txn.open_table(DEFS_BY_SUBMISSION)?;
        let attachments = read_txn.open_table(ATTACHMENTS)?;
        let form_defs = read_txn.open_table(FORM_DEFS)?;

        let prefix = form_scan_prefix(project_id, form_id);
        let start = match after {
            Some(id) => {
                // First key strictly after the cursor's composite key.
                let mut key = form_submission_key(project_id, form_id, id);
                key.push(0x00);
                key
            }
            None => prefix.clone(),
        };
        let end = prefix_end(&prefix);

        let mut entries = Vec::new();
        let mut cursor = None;
        let mut exhausted = true;

        for entry in by_form.range::<&[u8]>(start.as_slice()..end.as_slice())? {
            let entry = entry?;
            let key_bytes = entry.0.value();
            // Guard against a sibling form whose id extends this form's prefix.
            if key_bytes.len() != prefix.len() + 8 {
                continue;
            }
            let submission_id = entry.1.value();
            cursor = Some(submission_id);

            let submission: Submission = {
                let guard = submissions.get(submission_id)?.ok_or_else(|| {
                    Error::ConsistencyFault(format!(
                        "submission {submission_id} indexed but missing"
                    ))
                })?;
                serde_json::from_slice(guard.value())?
            };
            if submission.deleted_at.is_some() {
                continue;
            }

            let def = Self::current_def_in(&order, &defs, submission_id)?
                .ok_or_else(|| zero_defs_fault(submission_id))?;

            let key_id = {
                let fd_key = form_def_key(project_id, form_id, &def.form_version);
                match form_defs.get(fd_key.as_slice())? {
                    Some(guard) => {
                        let form_def: FormDef = serde_json::from_slice(guard.value())?;
                        form_def.key_id
                    }
                    None => None,
                }
            };

            let attachment_rows = Self::attachments_in(&attachments, def.id)?;

            entries.push(ExportEntry {
                submission,
                def,
                key_id,
                attachments: attachment_rows,
            });

            if entries.len() >= limit {
                exhausted = false;
                break;
            }
        }

        Ok(ExportPage {
            entries,
            cursor,
            exhausted,
        })
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Idempotent key registration: a single atomic insert-or-return-existing
    /// keyed by the public material itself. Write transactions are
    /// serialized, so concurrent racers observe exactly one winner.
    pub fn ensure_key(&self, public_key_pem: &str) -> Result<KeyId> {
        self.put_key(public_key_pem, false, None, None)
    }

    /// Insert a managed key (with its sealed private half).
    pub fn insert_managed_key(
        &self,
        public_key_pem: &str,
        hint: Option<String>,
        private: crate::crypto::EncryptedPrivateKey,
    ) -> Result<KeyId> {
        self.put_key(public_key_pem, true, hint, Some(private))
    }

    fn put_key(
        &self,
        public_key_pem: &str,
        managed: bool,
        hint: Option<String>,
        private: Option<crate::crypto::EncryptedPrivateKey>,
    ) -> Result<KeyId> {
        let digest = hex::encode(Sha256::digest(public_key_pem.as_bytes()));

        let txn = self.db.begin_write()?;
        let key_id: KeyId;
        {
            let mut keys = txn.open_table(KEYS)?;
            let mut by_public = txn.open_table(KEYS_BY_PUBLIC)?;

            if let Some(existing) = { by_public.get(digest.as_str())?.map(|g| g.value()) } {
                return Ok(existing);
            }

            key_id = Self::next_seq(&txn, SEQ_KEYS)?;
            let key = Key {
                id: key_id,
                public_key_pem: public_key_pem.to_string(),
                managed,
                hint,
                private,
                created_at: Utc::now(),
            };
            keys.insert(key_id, serde_json::to_vec(&key)?.as_slice())?;
            by_public.insert(digest.as_str(), key_id)?;
        }
        txn.commit()?;
        Ok(key_id)
    }

    /// Look up a key by id.
    pub fn get_key(&self, key_id: KeyId) -> Result<Key> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(KEYS)?;
        let guard = keys
            .get(key_id)?
            .ok_or_else(|| Error::NotFound(format!("key {key_id}")))?;
        Ok(serde_json::from_slice(guard.value())?)
    }

    /// All key ids referenced by a project's published form versions, in
    /// first-use order.
    pub fn project_key_ids(&self, project_id: &str) -> Result<Vec<KeyId>> {
        let read_txn = self.db.begin_read()?;
        let form_defs = read_txn.open_table(FORM_DEFS)?;

        let prefix = form_def_prefix(project_id);
        let end = prefix_end(&prefix);

        let mut seen = BTreeSet::new();
        let mut ids = Vec::new();
        for entry in form_defs.range::<&[u8]>(prefix.as_slice()..end.as_slice())? {
            let entry = entry?;
            let form_def: FormDef = serde_json::from_slice(entry.1.value())?;
            if let Some(key_id) = form_def.key_id {
                if seen.insert(key_id) {
                    ids.push(key_id);
                }
            }
        }
        Ok(ids)
    }

    // =========================================================================
    // Forms
    // =========================================================================

    /// Publish a form version, making it current and recording the key (if
    /// any) active for submissions against it.
    pub fn publish_form(
        &self,
        project_id: &str,
        form_id: &str,
        version: &str,
        key_id: Option<KeyId>,
    ) -> Result<FormDef> {
        let txn = self.db.begin_write()?;
        let form_def = FormDef {
            project_id: project_id.to_string(),
            form_id: form_id.to_string(),
            version: version.to_string(),
            key_id,
        };
        {
            let mut forms = txn.open_table(FORMS)?;
            let mut form_defs = txn.open_table(FORM_DEFS)?;

            let form = Form {
                project_id: project_id.to_string(),
                form_id: form_id.to_string(),
                current_version: version.to_string(),
            };
            forms.insert(
                form_key(project_id, form_id).as_str(),
                serde_json::to_vec(&form)?.as_slice(),
            )?;
            form_defs.insert(
                form_def_key(project_id, form_id, version).as_slice(),
                serde_json::to_vec(&form_def)?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(form_def)
    }

    /// Look up a form (its current version) by natural key.
    pub fn get_form(&self, project_id: &str, form_id: &str) -> Result<Option<Form>> {
        let read_txn = self.db.begin_read()?;
        let forms = read_txn.open_table(FORMS)?;
        match forms.get(form_key(project_id, form_id).as_str())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Look up one published form version.
    pub fn get_form_def(
        &self,
        project_id: &str,
        form_id: &str,
        version: &str,
    ) -> Result<Option<FormDef>> {
        let read_txn = self.db.begin_read()?;
        let form_defs = read_txn.open_table(FORM_DEFS)?;
        match form_defs.get(form_def_key(project_id, form_id, version).as_slice())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Blob metadata
    // =========================================================================

    /// Look up blob metadata by id.
    pub fn get_blob_meta(&self, blob_id: &str) -> Result<Option<BlobMeta>> {
        let read_txn = self.db.begin_read()?;
        let blobs = read_txn.open_table(BLOBS)?;
        match blobs.get(blob_id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }
}

fn zero_defs_fault(submission_id: SubmissionId) -> Error {
    tracing::error!(
        submission_id,
        "Submission has zero defs; append-only invariant violated"
    );
    Error::ConsistencyFault(format!("submission {submission_id} has zero defs"))
}

// =============================================================================
// Tests
// =============================================================================
