//! Encrypted, padded bucket read/write path.
//!
//! A bucket's plaintext is a JSON object mapping item codes to item
//! tuples, padded with trailing spaces to at least the target size so
//! ciphertext length does not fingerprint content size. The hub itself
//! is written through the same path under the reserved `#hub` key,
//! padded to a floor and grown in fixed increments.

use std::collections::BTreeMap;

use burrow_core::{ItemTuple, VaultError, VaultResult};
use burrow_crypto::{open_entry, seal_entry, CipherKey, VECTOR_SIZE};
use burrow_kv::KvStore;
use tracing::debug;

/// Reserved storage key for the encrypted hub entry. Versioned class:
/// the key never varies, so every write carries fresh extra entropy.
pub const HUB_KEY: &str = "#hub";

/// Bucket plaintext form: item code → item tuple.
pub type BucketContents = BTreeMap<u64, ItemTuple>;

/// Everything needed to read and write encrypted entries: the backing
/// store, the session cipher key, and the nonce-derivation vector.
#[derive(Clone)]
pub struct BucketIo {
    store: KvStore,
    cipher: CipherKey,
    vector: [u8; VECTOR_SIZE],
}

impl BucketIo {
    pub fn new(store: KvStore, cipher: CipherKey, vector: [u8; VECTOR_SIZE]) -> Self {
        Self {
            store,
            cipher,
            vector,
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Fetch and decrypt a bucket. Any failure — missing entry, AEAD
    /// failure, undecodable JSON — is vault corruption, never empty
    /// data.
    pub async fn read_bucket(&self, key: &str) -> VaultResult<BucketContents> {
        let value = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| VaultError::Corrupted(format!("bucket '{key}' is missing")))?;
        let plaintext = open_entry(key, &value, &self.cipher, &self.vector)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::corrupt(&format!("decoding bucket '{key}'"), e))
    }

    /// Encode, pad to `target_size`, encrypt, and persist a bucket.
    ///
    /// Returns the true pre-padding plaintext length so the hub can
    /// track real occupancy distinctly from on-disk size.
    pub async fn write_bucket(
        &self,
        key: &str,
        contents: &BucketContents,
        target_size: usize,
    ) -> VaultResult<usize> {
        let mut plaintext = serde_json::to_vec(contents)
            .map_err(|e| VaultError::Bug(format!("encoding bucket '{key}': {e}")))?;
        let true_len = plaintext.len();

        if plaintext.len() < target_size {
            plaintext.resize(target_size, b' ');
        }

        let sealed = seal_entry(key, &plaintext, &self.cipher, &self.vector)?;
        self.store.set(key, sealed).await?;

        debug!(key, true_len, padded = plaintext.len(), "bucket written");
        Ok(true_len)
    }

    /// Persist the serialized hub, padded to a floor and then grown in
    /// fixed increments so its ciphertext length leaks as little as
    /// possible about index growth.
    pub async fn write_hub(
        &self,
        serialized: Vec<u8>,
        pad_floor: usize,
        pad_increment: usize,
    ) -> VaultResult<()> {
        let mut plaintext = serialized;
        let padded_len = padded_hub_len(plaintext.len(), pad_floor, pad_increment);
        plaintext.resize(padded_len, b' ');

        let sealed = seal_entry(HUB_KEY, &plaintext, &self.cipher, &self.vector)?;
        self.store.set(HUB_KEY, sealed).await
    }

    /// Fetch and decrypt the raw hub plaintext, or `None` when no hub
    /// has been written yet (fresh vault).
    pub async fn read_hub_bytes(&self) -> VaultResult<Option<Vec<u8>>> {
        match self.store.get(HUB_KEY).await? {
            Some(value) => Ok(Some(open_entry(
                HUB_KEY,
                &value,
                &self.cipher,
                &self.vector,
            )?)),
            None => Ok(None),
        }
    }

    /// Bulk-delete pruned storage keys. Called strictly after the hub
    /// rewrite that stopped referencing them.
    pub async fn prune_keys(&self, keys: &[String]) -> VaultResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(count = keys.len(), "pruning stale bucket keys");
        self.store.remove_many(keys).await
    }
}

fn padded_hub_len(len: usize, floor: usize, increment: usize) -> usize {
    if len <= floor {
        return floor;
    }
    let over = len - floor;
    let steps = over.div_ceil(increment.max(1));
    floor + steps * increment
}
