//! Root-key derivation: Argon2id over passphrase + entropy || nonce vector.
//!
//! Two root generations exist side by side during unlock: `old`
//! matches the ciphertext currently in storage, `new` is derived under
//! nonce+1 and becomes current once rotation completes.

use argon2::{Algorithm, Argon2, Params, Version};
use burrow_core::{VaultError, VaultResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::{ENTROPY_SIZE, KEY_SIZE, VECTOR_SIZE};

/// Argon2id parameters, persisted alongside the vault so unlock can
/// re-derive under exactly the costs used at register time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            algorithm: "argon2id".into(),
            iterations: 3,
            memory: 65536,
            parallelism: 4,
        }
    }
}

impl HashParams {
    pub fn from_config(cfg: &burrow_core::config::CryptoConfig) -> Self {
        Self {
            algorithm: "argon2id".into(),
            iterations: cfg.argon2_time_cost,
            memory: cfg.argon2_mem_cost_kib,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// A root-key generation. Never encrypts anything directly; only feeds
/// HKDF. Raw bytes are zeroized on drop.
#[derive(Clone)]
pub struct RootKey {
    bytes: [u8; KEY_SIZE],
    vector: [u8; VECTOR_SIZE],
    nonce: u128,
    params: HashParams,
}

impl RootKey {
    pub fn from_bytes(
        bytes: [u8; KEY_SIZE],
        vector: [u8; VECTOR_SIZE],
        nonce: u128,
        params: HashParams,
    ) -> Self {
        Self {
            bytes,
            vector,
            nonce,
            params,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// The 32-byte entropy || nonce vector seeding nonce derivation.
    pub fn vector(&self) -> &[u8; VECTOR_SIZE] {
        &self.vector
    }

    pub fn nonce(&self) -> u128 {
        self.nonce
    }

    pub fn params(&self) -> &HashParams {
        &self.params
    }

    /// Export the raw key bytes for the session cache. The returned
    /// buffer wipes itself on drop; callers must not copy it out of a
    /// non-zeroizing container.
    pub fn export_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.bytes.to_vec())
    }
}

impl Drop for RootKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey")
            .field("bytes", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// The old/new generation pair produced on every unlock.
pub struct RootPair {
    pub old: RootKey,
    pub new: RootKey,
}

/// Build the 32-byte vector: entropy(16) || nonce big-endian(16).
pub fn build_vector(entropy: &[u8; ENTROPY_SIZE], nonce: u128) -> [u8; VECTOR_SIZE] {
    let mut vector = [0u8; VECTOR_SIZE];
    vector[..ENTROPY_SIZE].copy_from_slice(entropy);
    vector[ENTROPY_SIZE..].copy_from_slice(&nonce.to_be_bytes());
    vector
}

/// Derive the tandem old/new root pair from a passphrase.
///
/// The new nonce is `old_nonce + 1 (mod 2^128)`. The two generations
/// share no state, so they hash in parallel; the call still blocks the
/// current thread and async callers should run it on a blocking pool.
/// The passphrase is consumed: its buffer is zeroized when the
/// `SecretString` drops at the end of this call, on success or failure.
pub fn derive_root_pair(
    passphrase: SecretString,
    entropy: &[u8; ENTROPY_SIZE],
    old_nonce: u128,
    params: &HashParams,
) -> VaultResult<RootPair> {
    if params.algorithm != "argon2id" {
        return Err(VaultError::Corrupted(format!(
            "unsupported hash algorithm '{}'",
            params.algorithm
        )));
    }

    let new_nonce = old_nonce.wrapping_add(1);
    let old_vector = build_vector(entropy, old_nonce);
    let new_vector = build_vector(entropy, new_nonce);

    let pass = passphrase.expose_secret().as_bytes();
    let (old_bytes, new_bytes) = std::thread::scope(|scope| {
        let old_task = scope.spawn(|| argon2id(pass, &old_vector, params));
        let new_bytes = argon2id(pass, &new_vector, params);
        (old_task.join(), new_bytes)
    });
    let old_bytes = old_bytes
        .map_err(|_| VaultError::Bug("root derivation thread panicked".into()))??;
    let new_bytes = new_bytes?;

    Ok(RootPair {
        old: RootKey::from_bytes(*old_bytes, old_vector, old_nonce, params.clone()),
        new: RootKey::from_bytes(*new_bytes, new_vector, new_nonce, params.clone()),
    })
}

fn argon2id(
    passphrase: &[u8],
    vector: &[u8; VECTOR_SIZE],
    params: &HashParams,
) -> VaultResult<Zeroizing<[u8; KEY_SIZE]>> {
    let argon2_params = Params::new(
        params.memory,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| VaultError::Bug(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase, vector, key.as_mut())
        .map_err(|e| VaultError::Bug(format!("Argon2id KDF failed: {e}")))?;

    Ok(key)
}

/// Fresh 16 bytes of per-installation entropy (register time).
pub fn random_entropy() -> [u8; ENTROPY_SIZE] {
    let mut entropy = [0u8; ENTROPY_SIZE];
    rand::thread_rng().fill_bytes(&mut entropy);
    entropy
}

/// Random initial 128-bit root nonce (register time).
pub fn random_nonce() -> u128 {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    u128::from_be_bytes(bytes)
}
