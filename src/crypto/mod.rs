// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Managed-Encryption Envelope Scheme
//!
//! Wire-compatible primitives for the client-side envelope encryption of
//! submissions:
//!
//! 1. The client generates a random 256-bit symmetric key per submission.
//! 2. The submission body and each media file are encrypted with
//!    AES-256-CFB (PKCS#7 padded); the IV for each file is derived from the
//!    submission's instance id, the symmetric key, and the file's positional
//!    index, so no two files share cipher state.
//! 3. The symmetric key itself is wrapped with the project's RSA-2048 public
//!    key (OAEP-SHA256) and transmitted base64-encoded inline in the
//!    envelope (`local_key`).
//!
//! Server-side decryption inverts the steps: unwrap the symmetric key with
//! the passphrase-derived private key, derive the file IV from
//! `(instance id, symmetric key, index)`, decrypt, strip padding.
//!
//! Everything here is a pure function over explicit inputs; nothing captures
//! ambient state. The encrypt direction exists for fixtures and self-tests —
//! production traffic is encrypted by clients.

pub mod keyvault;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Length of the per-submission symmetric key in bytes.
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// AES block length; also the IV length for both cipher modes used here.
pub const IV_LEN: usize = 16;

/// RSA modulus size for managed keys.
pub const MANAGED_KEY_BITS: usize = 2048;

/// PBKDF2-HMAC-SHA256 rounds protecting managed private keys at rest.
const PBKDF2_ROUNDS: u32 = 128_000;

/// Salt length for the passphrase KDF.
const SALT_LEN: usize = 16;

// =============================================================================
// IV derivation
// =============================================================================

/// Derive the IV for the file at positional `index` within a submission.
///
/// Seed = MD5(instance id bytes ‖ symmetric key bytes); then for each
/// `i in 0..=index` the byte at `i % 16` is incremented (wrapping). The
/// per-index increments are what give every file of a submission distinct
/// cipher state.
pub fn file_iv(instance_id: &str, symmetric_key: &[u8], index: u32) -> [u8; IV_LEN] {
    let mut hasher = Md5::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(symmetric_key);
    let digest = hasher.finalize();

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest);
    for i in 0..=index as usize {
        iv[i % IV_LEN] = iv[i % IV_LEN].wrapping_add(1);
    }
    iv
}

// =============================================================================
// File encryption (AES-256-CFB + PKCS#7)
// =============================================================================

/// Decrypt one file (body or media attachment) of a submission.
pub fn decrypt_file(
    symmetric_key: &[u8],
    instance_id: &str,
    index: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
        return Err(Error::Undecryptable(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }

    let iv = file_iv(instance_id, symmetric_key, index);
    let cipher = Aes256CfbDec::new_from_slices(symmetric_key, &iv)
        .map_err(|_| Error::Undecryptable("bad symmetric key length".to_string()))?;

    let mut buf = ciphertext.to_vec();
    cipher.decrypt(&mut buf);
    strip_pkcs7(&mut buf)?;
    Ok(buf)
}

/// Encrypt one file of a submission. Fixture/self-test counterpart of
/// [`decrypt_file`].
pub fn encrypt_file(
    symmetric_key: &[u8],
    instance_id: &str,
    index: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let iv = file_iv(instance_id, symmetric_key, index);
    let cipher = Aes256CfbEnc::new_from_slices(symmetric_key, &iv)
        .map_err(|_| Error::Undecryptable("bad symmetric key length".to_string()))?;

    let mut buf = pad_pkcs7(plaintext);
    cipher.encrypt(&mut buf);
    Ok(buf)
}

fn pad_pkcs7(data: &[u8]) -> Vec<u8> {
    let pad = IV_LEN - (data.len() % IV_LEN);
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

fn strip_pkcs7(buf: &mut Vec<u8>) -> Result<()> {
    let pad = *buf.last().ok_or_else(|| {
        Error::Undecryptable("empty plaintext after decryption".to_string())
    })? as usize;
    if pad == 0 || pad > IV_LEN || pad > buf.len() {
        return Err(Error::Undecryptable("invalid padding".to_string()));
    }
    if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(Error::Undecryptable("invalid padding".to_string()));
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

// =============================================================================
// Symmetric key wrap/unwrap (RSA-OAEP-SHA256)
// =============================================================================

/// Unwrap a submission's symmetric key from its base64 `local_key` material.
pub fn unwrap_submission_key(private_key: &RsaPrivateKey, local_key: &str) -> Result<Vec<u8>> {
    let wrapped = BASE64
        .decode(local_key.trim())
        .map_err(|e| Error::Undecryptable(format!("local key is not valid base64: {e}")))?;

    let symmetric_key = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|e| Error::Undecryptable(format!("key unwrap failed: {e}")))?;

    if symmetric_key.len() != SYMMETRIC_KEY_LEN {
        return Err(Error::Undecryptable(format!(
            "unwrapped key has length {}, expected {SYMMETRIC_KEY_LEN}",
            symmetric_key.len()
        )));
    }
    Ok(symmetric_key)
}

/// Wrap a symmetric key under a project public key, producing the base64
/// `local_key` envelope field. Fixture/self-test counterpart of
/// [`unwrap_submission_key`].
pub fn wrap_submission_key(public_key: &RsaPublicKey, symmetric_key: &[u8]) -> Result<String> {
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), symmetric_key)
        .map_err(|e| Error::Undecryptable(format!("key wrap failed: {e}")))?;
    Ok(BASE64.encode(wrapped))
}

/// Generate a fresh random symmetric key.
pub fn generate_symmetric_key() -> [u8; SYMMETRIC_KEY_LEN] {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

// =============================================================================
// Managed private keys at rest
// =============================================================================

/// A managed private key sealed under a passphrase.
///
/// PKCS#8 DER, AES-256-CBC (PKCS#7), key derived with PBKDF2-HMAC-SHA256.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPrivateKey {
    /// Base64 PBKDF2 salt.
    pub salt: String,
    /// Base64 AES-CBC IV.
    pub iv: String,
    /// Base64 ciphertext of the PKCS#8 DER private key.
    pub ciphertext: String,
}

/// Derive the key-encryption key for a managed private key.
pub fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> [u8; SYMMETRIC_KEY_LEN] {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Seal a private key under a passphrase.
pub fn seal_private_key(private_der: &[u8], passphrase: &str) -> Result<EncryptedPrivateKey> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = derive_passphrase_key(passphrase, &salt);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|_| Error::Undecryptable("bad key-encryption key length".to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(private_der);

    Ok(EncryptedPrivateKey {
        salt: BASE64.encode(salt),
        iv: BASE64.encode(iv),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open a sealed private key with a passphrase.
///
/// A wrong passphrase surfaces as [`Error::Undecryptable`], either from
/// padding validation or from PKCS#8 parsing of the garbage plaintext.
pub fn open_private_key(sealed: &EncryptedPrivateKey, passphrase: &str) -> Result<RsaPrivateKey> {
    let salt = BASE64
        .decode(&sealed.salt)
        .map_err(|e| Error::Undecryptable(format!("bad salt encoding: {e}")))?;
    let iv = BASE64
        .decode(&sealed.iv)
        .map_err(|e| Error::Undecryptable(format!("bad IV encoding: {e}")))?;
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| Error::Undecryptable(format!("bad ciphertext encoding: {e}")))?;

    let key = derive_passphrase_key(passphrase, &salt);
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|_| Error::Undecryptable("bad key-encryption key length".to_string()))?;
    let der = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::Undecryptable("wrong passphrase".to_string()))?;

    use rsa::pkcs8::DecodePrivateKey;
    RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|_| Error::Undecryptable("wrong passphrase".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    const INSTANCE_ID: &str = "uuid:9e0cefb2-5a54-4d9c-9f40-7a63a7b6b777";

    fn fixture_key() -> [u8; SYMMETRIC_KEY_LEN] {
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn file_iv_known_vectors() {
        let key = fixture_key();
        assert_eq!(
            file_iv(INSTANCE_ID, &key, 0),
            [158, 25, 254, 30, 248, 3, 233, 61, 169, 123, 11, 128, 115, 31, 189, 124]
        );
        assert_eq!(
            file_iv(INSTANCE_ID, &key, 1),
            [158, 26, 254, 30, 248, 3, 233, 61, 169, 123, 11, 128, 115, 31, 189, 124]
        );
        // index 17 wraps around the 16-byte seed
        assert_eq!(
            file_iv(INSTANCE_ID, &key, 17),
            [159, 27, 255, 31, 249, 4, 234, 62, 170, 124, 12, 129, 116, 32, 190, 125]
        );
    }

    #[test]
    fn file_ivs_differ_per_index() {
        let key = fixture_key();
        let ivs: Vec<_> = (0..8).map(|i| file_iv(INSTANCE_ID, &key, i)).collect();
        for i in 0..ivs.len() {
            for j in i + 1..ivs.len() {
                assert_ne!(ivs[i], ivs[j], "indices {i} and {j} share an IV");
            }
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = fixture_key();
        let plaintext = b"<data id=\"f\"><meta><instanceID>x</instanceID></meta></data>";

        let ciphertext = encrypt_file(&key, INSTANCE_ID, 2, plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(ciphertext.len() % IV_LEN, 0);

        let decrypted = decrypt_file(&key, INSTANCE_ID, 2, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_index_fails_or_differs() {
        let key = fixture_key();
        let plaintext = b"attachment body";
        let ciphertext = encrypt_file(&key, INSTANCE_ID, 0, plaintext).unwrap();

        match decrypt_file(&key, INSTANCE_ID, 1, &ciphertext) {
            Err(Error::Undecryptable(_)) => {}
            Ok(other) => assert_ne!(other, plaintext.to_vec()),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn decrypt_rejects_truncated_ciphertext() {
        let key = fixture_key();
        let result = decrypt_file(&key, INSTANCE_ID, 0, b"short");
        assert!(matches!(result, Err(Error::Undecryptable(_))));
    }

    #[test]
    fn pad_and_strip_are_inverse() {
        for len in [0usize, 1, 15, 16, 17, 100] {
            let data = vec![0xABu8; len];
            let mut padded = pad_pkcs7(&data);
            assert_eq!(padded.len() % IV_LEN, 0);
            assert!(padded.len() > data.len());
            strip_pkcs7(&mut padded).unwrap();
            assert_eq!(padded, data);
        }
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let private = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();
        let public = private.to_public_key();

        let sym = generate_symmetric_key();
        let local_key = wrap_submission_key(&public, &sym).unwrap();
        let unwrapped = unwrap_submission_key(&private, &local_key).unwrap();
        assert_eq!(unwrapped, sym);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let right = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();
        let wrong = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();

        let sym = generate_symmetric_key();
        let local_key = wrap_submission_key(&right.to_public_key(), &sym).unwrap();

        let result = unwrap_submission_key(&wrong, &local_key);
        assert!(matches!(result, Err(Error::Undecryptable(_))));
    }

    #[test]
    fn seal_open_private_key_roundtrip() {
        let private = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();
        let der = private.to_pkcs8_der().unwrap();

        let sealed = seal_private_key(der.as_bytes(), "correct horse").unwrap();
        let opened = open_private_key(&sealed, "correct horse").unwrap();
        assert_eq!(opened, private);
    }

    #[test]
    fn open_private_key_wrong_passphrase_fails_cleanly() {
        let private = RsaPrivateKey::new(&mut OsRng, MANAGED_KEY_BITS).unwrap();
        let der = private.to_pkcs8_der().unwrap();

        let sealed = seal_private_key(der.as_bytes(), "correct horse").unwrap();
        let result = open_private_key(&sealed, "battery staple");
        assert!(matches!(result, Err(Error::Undecryptable(_))));
    }
}
