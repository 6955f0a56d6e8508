//! The vault base entry: plaintext root metadata.
//!
//! Stored unencrypted under a fixed key. It carries no secrets, only
//! what unlock needs to re-derive and check the root key: the
//! installation entropy, the current root nonce, a signature over a
//! fixed constant under the current root, the HKDF salt, and the
//! Argon2id parameters. Loss or corruption of this entry is fatal.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use burrow_core::{VaultError, VaultResult};
use burrow_crypto::kdf::HashParams;
use burrow_crypto::ENTROPY_SIZE;
use burrow_kv::KvStore;
use serde::{Deserialize, Serialize};

/// Plaintext storage key of the base entry. No class marker: this is
/// the one entry rotation must never touch.
pub const BASE_KEY: &str = "base";

/// Layout version of the base entry itself.
pub const BASE_VERSION: u32 = 1;

/// Byte length of the per-vault HKDF salt.
pub const SALT_SIZE: usize = 16;

/// JSON form: binary fields are base64, the 128-bit nonce is a decimal
/// string (it does not fit a JSON number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBase {
    pub version: u32,
    entropy: String,
    nonce: String,
    signature: String,
    salt: String,
    pub params: HashParams,
}

impl VaultBase {
    pub fn new(
        entropy: &[u8; ENTROPY_SIZE],
        nonce: u128,
        signature: &[u8],
        salt: &[u8],
        params: HashParams,
    ) -> Self {
        Self {
            version: BASE_VERSION,
            entropy: BASE64.encode(entropy),
            nonce: nonce.to_string(),
            signature: BASE64.encode(signature),
            salt: BASE64.encode(salt),
            params,
        }
    }

    pub fn entropy(&self) -> VaultResult<[u8; ENTROPY_SIZE]> {
        let bytes = BASE64
            .decode(&self.entropy)
            .map_err(|e| VaultError::corrupt("decoding base entropy", e))?;
        bytes
            .try_into()
            .map_err(|_| VaultError::Corrupted("base entropy has the wrong length".into()))
    }

    pub fn nonce(&self) -> VaultResult<u128> {
        self.nonce
            .parse()
            .map_err(|e| VaultError::corrupt("decoding base nonce", e))
    }

    pub fn signature(&self) -> VaultResult<Vec<u8>> {
        BASE64
            .decode(&self.signature)
            .map_err(|e| VaultError::corrupt("decoding base signature", e))
    }

    pub fn salt(&self) -> VaultResult<Vec<u8>> {
        BASE64
            .decode(&self.salt)
            .map_err(|e| VaultError::corrupt("decoding base salt", e))
    }

    /// Advance to a new root generation: nonce and signature move
    /// together, everything else is immutable after register.
    pub fn set_generation(&mut self, nonce: u128, signature: &[u8]) {
        self.nonce = nonce.to_string();
        self.signature = BASE64.encode(signature);
    }

    pub async fn load(store: &KvStore) -> VaultResult<Option<Self>> {
        match store.get(BASE_KEY).await? {
            Some(bytes) => Self::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &KvStore) -> VaultResult<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| VaultError::Bug(format!("encoding vault base: {e}")))?;
        store.set(BASE_KEY, bytes).await
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| VaultError::corrupt("decoding vault base", e))
    }
}

/// Fresh random HKDF salt (register time).
pub fn random_salt() -> [u8; SALT_SIZE] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
