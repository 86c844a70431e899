// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crate-wide error taxonomy.
//!
//! Storage-level uniqueness violations are translated into [`Error::Conflict`]
//! before they reach callers. [`Error::ConsistencyFault`] marks an invariant
//! breach (a submission with zero defs) — it is logged and surfaced, never
//! retried.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed envelope or missing required field.
    #[error("validation error: {0}")]
    Validation(String),

    /// The submission's declared form version is stale; the client must
    /// re-fetch the form before resubmitting.
    #[error("form version mismatch: expected {expected:?}, received {received:?}")]
    VersionMismatch { expected: String, received: String },

    /// Same instance id, differing content.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Wrong passphrase or corrupted encryption envelope.
    #[error("cannot decrypt: {0}")]
    Undecryptable(String),

    /// Missing form/submission/attachment/blob reference used structurally.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant breach in stored data. Must never surface to a submitting
    /// client; treated as fatal for the operation that observed it.
    #[error("internal consistency fault: {0}")]
    ConsistencyFault(String),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors a submitting client can correct and retry.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::VersionMismatch { .. }
                | Error::Conflict(_)
                | Error::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let err = Error::VersionMismatch {
            expected: "3".to_string(),
            received: "2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"3\""));
        assert!(msg.contains("\"2\""));
    }

    #[test]
    fn client_error_classification() {
        assert!(Error::Validation("bad".into()).is_client_error());
        assert!(Error::Conflict("dup".into()).is_client_error());
        assert!(!Error::ConsistencyFault("zero defs".into()).is_client_error());
        assert!(!Error::Undecryptable("wrong key".into()).is_client_error());
    }
}
