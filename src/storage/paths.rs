// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the persistent storage layout.

use std::path::{Path, PathBuf};

/// Base directory for all persistent storage.
pub const DATA_ROOT: &str = "/data";

/// Storage path utilities.
///
/// ```text
/// /data/
///   submissions.redb        # embedded database (all relational tables)
///   blobs/{aa}/{sha256}     # content-addressed attachment bodies
///   audit/{date}/events.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the embedded database file.
    pub fn database_file(&self) -> PathBuf {
        self.root.join("submissions.redb")
    }

    // ========== Blob Paths ==========

    /// Directory containing all blob content.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Path to one blob's content, sharded by the first two hex digits.
    pub fn blob_file(&self, blob_id: &str) -> PathBuf {
        let shard = &blob_id[..blob_id.len().min(2)];
        self.blobs_dir().join(shard).join(blob_id)
    }

    // ========== Audit Log Paths ==========

    /// Directory containing audit logs.
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Path to a daily audit events file (JSONL format).
    pub fn audit_events_file(&self, date: &str) -> PathBuf {
        self.audit_dir().join(date).join("events.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_data_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("/data"));
        assert_eq!(
            paths.database_file(),
            PathBuf::from("/data/submissions.redb")
        );
    }

    #[test]
    fn blob_paths_are_sharded() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_eq!(
            paths.blob_file("ab12cd"),
            PathBuf::from("/tmp/test-data/blobs/ab/ab12cd")
        );
    }

    #[test]
    fn audit_paths_are_correct() {
        let paths = StoragePaths::default();
        assert_eq!(
            paths.audit_events_file("2026-08-06"),
            PathBuf::from("/data/audit/2026-08-06/events.jsonl")
        );
    }
}
