//! Key-value store over an OpenDAL operator.
//!
//! Values are raw bytes keyed by string. Every mutation emits a
//! `ChangeEvent` carrying the old and new value, so a session can keep
//! in-memory metadata current when another writer in the same process
//! touches an entry.

use std::sync::Arc;

use burrow_core::{VaultError, VaultResult};
use opendal::Operator;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::trace;

/// Old/new value pair emitted on every set or remove.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// Exclusive advisory lock over the whole store.
///
/// Held for the guard's lifetime; released on drop on every exit path.
pub struct KvLock {
    _guard: OwnedMutexGuard<()>,
}

/// The backing store: an OpenDAL medium plus in-process change
/// broadcast and advisory locking.
#[derive(Clone)]
pub struct KvStore {
    op: Operator,
    changes: broadcast::Sender<ChangeEvent>,
    lock: Arc<Mutex<()>>,
}

impl KvStore {
    pub fn new(op: Operator) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            op,
            changes,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// In-memory store, used by tests and ephemeral vaults.
    pub fn memory() -> Self {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        Self::new(op)
    }

    /// Filesystem-backed store rooted at `root`.
    pub fn fs(root: &str) -> VaultResult<Self> {
        let builder = opendal::services::Fs::default().root(root);
        let op = Operator::new(builder)
            .map_err(|e| VaultError::Storage(format!("creating fs operator: {e}")))?
            .finish();
        Ok(Self::new(op))
    }

    /// Acquire the store-wide exclusive lock.
    ///
    /// All structural mutations (hub, buckets, base rewrite during
    /// unlock) happen while holding this.
    pub async fn acquire(&self) -> KvLock {
        KvLock {
            _guard: self.lock.clone().lock_owned().await,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// List every key in the store.
    pub async fn all_keys(&self) -> VaultResult<Vec<String>> {
        let entries = self
            .op
            .list("")
            .await
            .map_err(|e| VaultError::Storage(format!("listing keys: {e}")))?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.metadata().is_dir())
            .map(|e| e.name().to_string())
            .collect())
    }

    pub async fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VaultError::Storage(format!("reading '{key}': {e}"))),
        }
    }

    /// Bulk read; each slot is `None` when the key is absent.
    pub async fn get_many(&self, keys: &[String]) -> VaultResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> VaultResult<()> {
        let old = self.get(key).await?;
        self.op
            .write(key, value.clone())
            .await
            .map_err(|e| VaultError::Storage(format!("writing '{key}': {e}")))?;
        trace!(key, bytes = value.len(), "entry written");
        self.notify(key, old, Some(value));
        Ok(())
    }

    pub async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> VaultResult<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> VaultResult<()> {
        let old = self.get(key).await?;
        self.op
            .delete(key)
            .await
            .map_err(|e| VaultError::Storage(format!("removing '{key}': {e}")))?;
        trace!(key, "entry removed");
        if old.is_some() {
            self.notify(key, old, None);
        }
        Ok(())
    }

    pub async fn remove_many(&self, keys: &[String]) -> VaultResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    fn notify(&self, key: &str, old: Option<Vec<u8>>, new: Option<Vec<u8>>) {
        // No receivers is fine; send only fails in that case.
        let _ = self.changes.send(ChangeEvent {
            key: key.to_string(),
            old,
            new,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove_roundtrip() {
        let store = KvStore::memory();

        store.set("alpha", b"one".to_vec()).await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(b"one".to_vec()));

        store.remove("alpha").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_absent_key_is_none() {
        let store = KvStore::memory();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_keys_lists_entries() {
        let store = KvStore::memory();
        store.set("_a", b"1".to_vec()).await.unwrap();
        store.set("_b", b"2".to_vec()).await.unwrap();
        store.set("base", b"3".to_vec()).await.unwrap();

        let mut keys = store.all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["_a", "_b", "base"]);
    }

    #[tokio::test]
    async fn test_change_events_carry_old_and_new() {
        let store = KvStore::memory();
        let mut rx = store.subscribe();

        store.set("k", b"v1".to_vec()).await.unwrap();
        store.set("k", b"v2".to_vec()).await.unwrap();
        store.remove("k").await.unwrap();

        let e1 = rx.recv().await.unwrap();
        assert_eq!(e1.old, None);
        assert_eq!(e1.new, Some(b"v1".to_vec()));

        let e2 = rx.recv().await.unwrap();
        assert_eq!(e2.old, Some(b"v1".to_vec()));
        assert_eq!(e2.new, Some(b"v2".to_vec()));

        let e3 = rx.recv().await.unwrap();
        assert_eq!(e3.old, Some(b"v2".to_vec()));
        assert_eq!(e3.new, None);
    }

    #[tokio::test]
    async fn test_remove_absent_key_emits_nothing() {
        let store = KvStore::memory();
        let mut rx = store.subscribe();

        store.remove("never-set").await.unwrap();
        store.set("marker", b"x".to_vec()).await.unwrap();

        // The first event we see must be the marker, not the no-op remove.
        let e = rx.recv().await.unwrap();
        assert_eq!(e.key, "marker");
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = KvStore::memory();
        let guard = store.acquire().await;

        let mut contender = tokio_test::task::spawn(store.acquire());
        assert!(contender.poll().is_pending());

        drop(guard);
        assert!(contender.poll().is_ready());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::fs(dir.path().to_str().unwrap()).unwrap();

        store.set("_bucket1", b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(
            store.get("_bucket1").await.unwrap(),
            Some(b"ciphertext".to_vec())
        );
        assert_eq!(store.all_keys().await.unwrap(), vec!["_bucket1"]);
    }
}
