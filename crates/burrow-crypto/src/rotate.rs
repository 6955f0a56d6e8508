//! Root-key rotation: transcrypt every ciphertext entry from the old
//! root-derived cipher key to the new one.
//!
//! Rotation flow:
//!   1. Derive a decrypt-only old key and an encrypt-capable new key
//!   2. Self-test the new key round-trip under both generations' nonces
//!   3. Enumerate ciphertext keys, bulk-read their values
//!   4. Per entry: decrypt under old, re-encrypt under new, write back
//!      immediately (an entry that only decrypts under new was migrated
//!      by a previous interrupted run and is skipped)
//!   5. Gather in-flight work whenever pending bytes exceed the flush
//!      threshold, bounding peak plaintext held in memory
//!
//! An unexpected failure aborts and leaves storage in a mixed state
//! that the next unlock resumes from; entries are never lost, only
//! re-attempted.

use burrow_core::{VaultError, VaultResult};
use burrow_kv::KvStore;
use tracing::{debug, info};

use crate::codec::{decrypt_raw, read_nonce_for, seal_entry, test_round_trip};
use crate::kdf::RootKey;
use crate::keys::{derive_cipher_key, derive_cipher_nonce, CipherKey};
use crate::is_cipher_key;

const SELF_TEST_PLAINTEXT: &[u8] = b"burrow rotation self-test payload";
const SELF_TEST_SALT: &[u8] = b"rotation-self-test";

/// Re-encrypt all ciphertext entries under the new root generation.
///
/// Idempotent and resumable: re-running after a crash migrates only
/// the entries the interrupted run did not reach. Returns the new
/// encrypt-capable cipher key for the caller to install.
pub async fn rotate_root_key(
    store: &KvStore,
    old_root: &RootKey,
    new_root: &RootKey,
    salt: &[u8],
    flush_batch_bytes: usize,
    progress: Option<&(dyn Fn(usize, usize) + Sync)>,
) -> VaultResult<CipherKey> {
    let cipher_old = derive_cipher_key(old_root, salt, false);
    let cipher_new = derive_cipher_key(new_root, salt, true);

    // Sanity gate before touching real data. A failure here is an
    // implementation defect, not a user error.
    let nonce_old = derive_cipher_nonce(old_root.vector(), SELF_TEST_SALT);
    let nonce_new = derive_cipher_nonce(new_root.vector(), SELF_TEST_SALT);
    test_round_trip(SELF_TEST_PLAINTEXT, &cipher_new, &nonce_old)?;
    test_round_trip(SELF_TEST_PLAINTEXT, &cipher_new, &nonce_new)?;

    let keys: Vec<String> = store
        .all_keys()
        .await?
        .into_iter()
        .filter(|k| is_cipher_key(k))
        .collect();
    let values = store.get_many(&keys).await?;
    let total = keys.len();

    info!(entries = total, "starting root-key rotation");

    let mut pending = Vec::new();
    let mut pending_bytes = 0usize;
    let mut done = 0usize;

    for (key, value) in keys.iter().zip(values) {
        // Removed between enumeration and read: nothing to migrate.
        let Some(value) = value else { continue };

        pending_bytes += value.len();
        pending.push(Box::pin(transcrypt_entry(
            store,
            key,
            value,
            &cipher_old,
            &cipher_new,
            old_root,
            new_root,
        )) as TranscryptFuture<'_>);

        if pending_bytes >= flush_batch_bytes {
            done += flush(&mut pending).await?;
            pending_bytes = 0;
            if let Some(report) = progress {
                report(done, total);
            }
        }
    }

    done += flush(&mut pending).await?;
    if let Some(report) = progress {
        report(done, total);
    }
    // The drained vec still borrows the keys; release it before the
    // new key moves out.
    drop(pending);

    info!(entries = done, "root-key rotation complete");
    Ok(cipher_new)
}

type TranscryptFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = VaultResult<bool>> + 'a>>;

async fn flush(pending: &mut Vec<TranscryptFuture<'_>>) -> VaultResult<usize> {
    let results = futures::future::join_all(pending.drain(..)).await;
    let mut migrated = 0;
    for result in results {
        if result? {
            migrated += 1;
        }
    }
    Ok(migrated)
}

/// Migrate one entry. Returns true when the entry was re-encrypted,
/// false when it was already under the new key.
async fn transcrypt_entry(
    store: &KvStore,
    key: &str,
    value: Vec<u8>,
    cipher_old: &CipherKey,
    cipher_new: &CipherKey,
    old_root: &RootKey,
    new_root: &RootKey,
) -> VaultResult<bool> {
    let old_attempt = read_nonce_for(key, &value, old_root.vector())
        .and_then(|(nonce, ciphertext)| decrypt_raw(ciphertext, cipher_old, &nonce));

    match old_attempt {
        Ok(plaintext) => {
            let sealed = seal_entry(key, &plaintext, cipher_new, new_root.vector())?;
            // Written back immediately, one entry at a time. This is
            // what makes an interrupted rotation resumable.
            store.set(key, sealed).await?;
            debug!(key, "entry migrated to new root generation");
            Ok(true)
        }
        Err(_) => {
            // Assume a prior interrupted run already migrated it.
            let (nonce, ciphertext) = read_nonce_for(key, &value, new_root.vector())?;
            decrypt_raw(ciphertext, cipher_new, &nonce).map_err(|_| {
                VaultError::Corrupted(format!(
                    "entry '{key}' decrypts under neither root generation"
                ))
            })?;
            debug!(key, "entry already under new root generation");
            Ok(false)
        }
    }
}
