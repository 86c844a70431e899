// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Content-addressed blob store for attachment bodies.
//!
//! Content is addressed by its SHA-256 and stored as plain files under
//! `blobs/{aa}/{sha256}`; writing the same bytes twice is a no-op. Content
//! type and size live in the database (`blobs` table), not here — this module
//! only moves bytes.
//!
//! Writes go to a temp file first and are renamed into place, so a reader
//! never observes a half-written blob.

use std::fs::{self, File};
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::StoragePaths;

/// Metadata recorded for each blob in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMeta {
    /// MIME content type as declared at upload time.
    pub content_type: String,
    /// Content length in bytes.
    pub size: u64,
}

/// Filesystem-backed content-addressed blob storage.
#[derive(Debug, Clone)]
pub struct BlobStore {
    paths: StoragePaths,
}

impl BlobStore {
    /// Create a blob store rooted at the given storage paths.
    ///
    /// Creates the blobs directory if missing.
    pub fn open(paths: StoragePaths) -> Result<Self> {
        fs::create_dir_all(paths.blobs_dir())?;
        Ok(Self { paths })
    }

    /// Content-address and persist `content`, returning the blob id.
    ///
    /// Idempotent: identical bytes land at the identical path.
    pub fn write(&self, content: &[u8]) -> Result<String> {
        let blob_id = hex::encode(Sha256::digest(content));
        let path = self.paths.blob_file(&blob_id);

        if path.is_file() {
            return Ok(blob_id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(content)?;
            file.flush()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(blob_id)
    }

    /// Read a blob's content.
    pub fn read(&self, blob_id: &str) -> Result<Vec<u8>> {
        let path = self.paths.blob_file(blob_id);
        let mut file = File::open(&path)
            .map_err(|_| Error::NotFound(format!("blob {blob_id}")))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Whether content for this blob id is present on disk.
    pub fn exists(&self, blob_id: &str) -> bool {
        self.paths.blob_file(blob_id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (BlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(StoragePaths::new(dir.path())).unwrap();
        (store, dir)
    }

    #[test]
    fn write_and_read_roundtrip() {
        let (store, _dir) = test_store();
        let content = b"attachment bytes \x00\x01\x02";

        let blob_id = store.write(content).unwrap();
        assert_eq!(blob_id.len(), 64);
        assert!(store.exists(&blob_id));
        assert_eq!(store.read(&blob_id).unwrap(), content);
    }

    #[test]
    fn write_is_idempotent() {
        let (store, _dir) = test_store();
        let a = store.write(b"same bytes").unwrap();
        let b = store.write(b"same bytes").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_content_distinct_ids() {
        let (store, _dir) = test_store();
        let a = store.write(b"one").unwrap();
        let b = store.write(b"two").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn read_missing_blob_is_not_found() {
        let (store, _dir) = test_store();
        let result = store.read(&"0".repeat(64));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
