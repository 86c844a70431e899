// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key vault: registration and resolution of managed-encryption keys.
//!
//! A project may rotate keys over time; every key ever used by one of its
//! published form versions is kept forever, because historical submissions
//! remain decryptable only under the key that protected them. Resolution
//! therefore returns *all* keys a passphrase unlocks, not just the current
//! one.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::database::SubmissionDatabase;

use super::{
    decrypt_file, open_private_key, seal_private_key, unwrap_submission_key,
    EncryptedPrivateKey, MANAGED_KEY_BITS,
};

pub type KeyId = u64;

/// A registered public-key record. Immutable once created; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    /// SPKI PEM of the RSA public key.
    pub public_key_pem: String,
    /// True for server-generated keys whose private half is held in sealed
    /// form; false for keys registered from client-supplied material only.
    pub managed: bool,
    /// Passphrase hint shown to exporting users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Sealed private half; managed keys only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<EncryptedPrivateKey>,
    pub created_at: DateTime<Utc>,
}

/// Key registration and passphrase resolution for a project scope.
pub struct KeyVault<'a> {
    db: &'a SubmissionDatabase,
}

impl<'a> KeyVault<'a> {
    pub fn new(db: &'a SubmissionDatabase) -> Self {
        Self { db }
    }

    /// Idempotent registration of client-supplied public key material.
    ///
    /// Concurrent first submissions to a newly-encrypted project race to
    /// register the same key; the underlying insert-or-return-existing is a
    /// single atomic operation keyed by the material itself, so exactly one
    /// record wins and every caller gets its id.
    pub fn ensure(&self, public_key_pem: &str) -> Result<KeyId> {
        RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| Error::Validation(format!("not a valid RSA public key: {e}")))?;
        self.db.ensure_key(public_key_pem)
    }

    /// Generate a managed RSA-2048 keypair, sealing the private half under
    /// the given passphrase.
    pub fn generate_managed(&self, passphrase: &str, hint: Option<String>) -> Result<KeyId> {
        let private = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS)
            .map_err(|e| Error::Undecryptable(format!("key generation failed: {e}")))?;

        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Undecryptable(format!("public key encoding failed: {e}")))?;
        let private_der = private
            .to_pkcs8_der()
            .map_err(|e| Error::Undecryptable(format!("private key encoding failed: {e}")))?;

        let sealed = seal_private_key(private_der.as_bytes(), passphrase)?;
        let key_id = self.db.insert_managed_key(&public_pem, hint, sealed)?;
        tracing::info!(key_id, "Managed encryption key created");
        Ok(key_id)
    }

    /// Look up a key record.
    pub fn get(&self, key_id: KeyId) -> Result<Key> {
        self.db.get_key(key_id)
    }

    /// Unlock every historical key of a project that the passphrase opens,
    /// returning the decryptor capability for an export request.
    ///
    /// Keys the passphrase does not open are skipped, not an error: the
    /// caller exports what it can and the row streams flag the rest.
    pub fn resolve_decryptable_keys(
        &self,
        passphrase: &str,
        project_id: &str,
    ) -> Result<Decryptor> {
        let mut unlocked = HashMap::new();
        for key_id in self.db.project_key_ids(project_id)? {
            let key = self.db.get_key(key_id)?;
            let Some(sealed) = key.private.as_ref() else {
                continue;
            };
            match open_private_key(sealed, passphrase) {
                Ok(private) => {
                    unlocked.insert(key_id, private);
                }
                Err(_) => {
                    tracing::debug!(key_id, "Passphrase does not unlock key");
                }
            }
        }
        tracing::info!(
            project_id,
            unlocked = unlocked.len(),
            "Resolved decryptable key set"
        );
        Ok(Decryptor::new(unlocked))
    }
}

// =============================================================================
// Decryptor
// =============================================================================

/// Per-request decryption capability over a set of unlocked private keys.
///
/// Each export request owns one of these for its lifetime; nothing is shared
/// across requests. Unwrapped symmetric keys are cached per
/// `(key, local key)` pair so a submission's body and attachments pay the
/// RSA unwrap only once.
pub struct Decryptor {
    keys: HashMap<KeyId, RsaPrivateKey>,
    unwrapped: Mutex<HashMap<(KeyId, String), Vec<u8>>>,
}

impl Decryptor {
    fn new(keys: HashMap<KeyId, RsaPrivateKey>) -> Self {
        Self {
            keys,
            unwrapped: Mutex::new(HashMap::new()),
        }
    }

    /// Construct an empty capability (no keys unlocked).
    pub fn none() -> Self {
        Self::new(HashMap::new())
    }

    /// The decryptable key set, for filtering export streams.
    pub fn key_ids(&self) -> HashSet<KeyId> {
        self.keys.keys().copied().collect()
    }

    pub fn can_decrypt(&self, key_id: KeyId) -> bool {
        self.keys.contains_key(&key_id)
    }

    /// Decrypt one file of a submission.
    ///
    /// Unwraps the symmetric key from `local_key` under `key_id`, derives the
    /// file key material from `(instance id, symmetric key, index)`, and
    /// decrypts.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: KeyId,
        local_key: &str,
        instance_id: &str,
        index: u32,
    ) -> Result<Vec<u8>> {
        let symmetric_key = self.symmetric_key(key_id, local_key)?;
        decrypt_file(&symmetric_key, instance_id, index, ciphertext)
    }

    fn symmetric_key(&self, key_id: KeyId, local_key: &str) -> Result<Vec<u8>> {
        let cache_key = (key_id, local_key.to_string());
        if let Some(cached) = self.unwrapped.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let private = self.keys.get(&key_id).ok_or_else(|| {
            Error::Undecryptable(format!("key {key_id} is not in the unlocked set"))
        })?;
        let symmetric_key = unwrap_submission_key(private, local_key)?;

        self.unwrapped
            .lock()
            .unwrap()
            .insert(cache_key, symmetric_key.clone());
        Ok(symmetric_key)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_file, generate_symmetric_key, wrap_submission_key};

    fn temp_db() -> (SubmissionDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SubmissionDatabase::open(&dir.path().join("test.redb")).unwrap();
        (db, dir)
    }

    #[test]
    fn ensure_rejects_garbage_material() {
        let (db, _dir) = temp_db();
        let vault = KeyVault::new(&db);
        let result = vault.ensure("not a pem");
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn ensure_is_idempotent_for_identical_material() {
        let (db, _dir) = temp_db();
        let vault = KeyVault::new(&db);

        let private = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let a = vault.ensure(&pem).unwrap();
        let b = vault.ensure(&pem).unwrap();
        assert_eq!(a, b);

        let key = vault.get(a).unwrap();
        assert!(!key.managed);
        assert_eq!(key.public_key_pem, pem);
    }

    #[test]
    fn resolve_unlocks_only_matching_passphrases() {
        let (db, _dir) = temp_db();
        let vault = KeyVault::new(&db);

        let key_a = vault.generate_managed("alpha", None).unwrap();
        let key_b = vault.generate_managed("bravo", Some("nato".to_string())).unwrap();

        // Both keys used by the project across rotations
        db.publish_form("p1", "census", "1", Some(key_a)).unwrap();
        db.publish_form("p1", "census", "2", Some(key_b)).unwrap();

        let decryptor = vault.resolve_decryptable_keys("alpha", "p1").unwrap();
        assert_eq!(decryptor.key_ids(), [key_a].into_iter().collect());
        assert!(decryptor.can_decrypt(key_a));
        assert!(!decryptor.can_decrypt(key_b));

        let nothing = vault.resolve_decryptable_keys("wrong", "p1").unwrap();
        assert!(nothing.key_ids().is_empty());
    }

    #[test]
    fn decryptor_roundtrips_client_encrypted_file() {
        let (db, _dir) = temp_db();
        let vault = KeyVault::new(&db);

        let key_id = vault.generate_managed("open sesame", None).unwrap();
        db.publish_form("p1", "census", "1", Some(key_id)).unwrap();

        // Client side: wrap a fresh symmetric key, encrypt a file with it
        let key = vault.get(key_id).unwrap();
        let public = RsaPublicKey::from_public_key_pem(&key.public_key_pem).unwrap();
        let symmetric = generate_symmetric_key();
        let local_key = wrap_submission_key(&public, &symmetric).unwrap();
        let instance_id = "uuid:round-trip";
        let ciphertext = encrypt_file(&symmetric, instance_id, 0, b"<data>plain</data>").unwrap();

        // Server side
        let decryptor = vault.resolve_decryptable_keys("open sesame", "p1").unwrap();
        let plaintext = decryptor
            .decrypt(&ciphertext, key_id, &local_key, instance_id, 0)
            .unwrap();
        assert_eq!(plaintext, b"<data>plain</data>");

        // Second decrypt under the same local key hits the unwrap cache
        let again = decryptor
            .decrypt(&ciphertext, key_id, &local_key, instance_id, 0)
            .unwrap();
        assert_eq!(again, plaintext);
    }

    #[test]
    fn decrypt_outside_unlocked_set_fails() {
        let decryptor = Decryptor::none();
        let result = decryptor.decrypt(b"0000000000000000", 42, "AAAA", "uuid:x", 0);
        assert!(matches!(result, Err(Error::Undecryptable(_))));
    }
}
