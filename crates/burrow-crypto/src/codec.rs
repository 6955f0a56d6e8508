//! Authenticated per-entry encryption.
//!
//! Ciphertext value wire format:
//! ```text
//! versioned (#) keys: [1 byte: value version][16 bytes: extra entropy][ciphertext + 16-byte tag]
//! plain     (_) keys: [ciphertext + 16-byte tag]
//! ```
//!
//! The nonce is never stored. For plain keys it is derived from
//! `sha256(key)` alone, which makes those keys write-once; versioned
//! keys fold fresh extra entropy into the derivation salt because
//! their logical key does not vary across writes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use burrow_core::{VaultError, VaultResult};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::keys::{require_encrypt, CipherKey};
use crate::{
    derive_cipher_nonce, CIPHER_MARKER, EXTRA_ENTROPY_SIZE, NONCE_SIZE, TAG_SIZE, VALUE_VERSION,
    VECTOR_SIZE, VERSIONED_MARKER,
};

/// Nonce and value prefix for a fresh write of `key`.
///
/// Versioned keys get 16 random bytes of extra entropy returned as the
/// value prefix `[VALUE_VERSION] || entropy`; plain keys have no prefix.
pub fn write_nonce_for(
    key: &str,
    vector: &[u8; VECTOR_SIZE],
) -> VaultResult<([u8; NONCE_SIZE], Option<Vec<u8>>)> {
    if key.starts_with(VERSIONED_MARKER) {
        let mut entropy = [0u8; EXTRA_ENTROPY_SIZE];
        rand::thread_rng().fill_bytes(&mut entropy);

        let mut prefix = Vec::with_capacity(1 + EXTRA_ENTROPY_SIZE);
        prefix.push(VALUE_VERSION);
        prefix.extend_from_slice(&entropy);

        Ok((derive_cipher_nonce(vector, &entry_salt(key, &entropy)), Some(prefix)))
    } else if key.starts_with(CIPHER_MARKER) {
        Ok((derive_cipher_nonce(vector, &entry_salt(key, &[])), None))
    } else {
        Err(VaultError::Bug(format!(
            "'{key}' is not a ciphertext storage key"
        )))
    }
}

/// Nonce and ciphertext slice for reading back `key`'s stored value.
///
/// Fails closed on a versioned value whose version byte is above what
/// this build understands: data written by newer software is rejected,
/// never misparsed.
pub fn read_nonce_for<'a>(
    key: &str,
    value: &'a [u8],
    vector: &[u8; VECTOR_SIZE],
) -> VaultResult<([u8; NONCE_SIZE], &'a [u8])> {
    if key.starts_with(VERSIONED_MARKER) {
        if value.len() < 1 + EXTRA_ENTROPY_SIZE + TAG_SIZE {
            return Err(VaultError::Corrupted(format!(
                "versioned entry '{key}' too short: {} bytes",
                value.len()
            )));
        }
        if value[0] > VALUE_VERSION {
            return Err(VaultError::Corrupted(format!(
                "entry '{key}' has value version {} but this build supports up to {VALUE_VERSION}",
                value[0]
            )));
        }

        let entropy = &value[1..1 + EXTRA_ENTROPY_SIZE];
        let ciphertext = &value[1 + EXTRA_ENTROPY_SIZE..];
        Ok((derive_cipher_nonce(vector, &entry_salt(key, entropy)), ciphertext))
    } else if key.starts_with(CIPHER_MARKER) {
        Ok((derive_cipher_nonce(vector, &entry_salt(key, &[])), value))
    } else {
        Err(VaultError::Bug(format!(
            "'{key}' is not a ciphertext storage key"
        )))
    }
}

/// Encrypt `plaintext` for storage under `key`: `prefix || AES-GCM(...)`.
pub fn seal_entry(
    key: &str,
    plaintext: &[u8],
    cipher_key: &CipherKey,
    vector: &[u8; VECTOR_SIZE],
) -> VaultResult<Vec<u8>> {
    let (nonce, prefix) = write_nonce_for(key, vector)?;
    let ciphertext = encrypt_raw(plaintext, cipher_key, &nonce)?;

    match prefix {
        Some(mut value) => {
            value.extend_from_slice(&ciphertext);
            Ok(value)
        }
        None => Ok(ciphertext),
    }
}

/// Decrypt the stored value of `key`. An AEAD tag failure is reported
/// as corruption, never as absent or empty data.
pub fn open_entry(
    key: &str,
    value: &[u8],
    cipher_key: &CipherKey,
    vector: &[u8; VECTOR_SIZE],
) -> VaultResult<Vec<u8>> {
    let (nonce, ciphertext) = read_nonce_for(key, value, vector)?;
    decrypt_raw(ciphertext, cipher_key, &nonce)
        .map_err(|_| VaultError::Corrupted(format!("entry '{key}' failed to decrypt")))
}

/// AES-256-GCM encrypt with an explicit nonce.
pub fn encrypt_raw(
    plaintext: &[u8],
    cipher_key: &CipherKey,
    nonce: &[u8; NONCE_SIZE],
) -> VaultResult<Vec<u8>> {
    require_encrypt(cipher_key)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(cipher_key.as_bytes()));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| VaultError::Bug(format!("AES-GCM encryption failed: {e}")))
}

/// AES-256-GCM decrypt with an explicit nonce.
pub fn decrypt_raw(
    ciphertext: &[u8],
    cipher_key: &CipherKey,
    nonce: &[u8; NONCE_SIZE],
) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(cipher_key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::Corrupted("AES-GCM decryption failed".into()))
}

/// Encrypt, serialize, deserialize, decrypt, byte-compare.
///
/// Used to validate a rotation candidate key before any real entry is
/// touched; a failure here means an implementation defect.
pub fn test_round_trip(
    data: &[u8],
    cipher_key: &CipherKey,
    nonce: &[u8; NONCE_SIZE],
) -> VaultResult<()> {
    let sealed = encrypt_raw(data, cipher_key, nonce)?;

    // Simulate the storage boundary: bytes out, bytes back in.
    let stored: Vec<u8> = sealed.clone();
    drop(sealed);

    let reopened = decrypt_raw(&stored, cipher_key, nonce)
        .map_err(|e| VaultError::IntegrityCheck(format!("round-trip decrypt failed: {e}")))?;

    if reopened != data {
        return Err(VaultError::IntegrityCheck(
            "round-trip produced different plaintext".into(),
        ));
    }
    Ok(())
}

fn entry_salt(key: &str, extra_entropy: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(extra_entropy);
    hasher.finalize().into()
}
