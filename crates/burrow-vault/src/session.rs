//! Vault session lifecycle: connect, register, unlock, open.
//!
//! Connection state is explicit; unlocked-ness is the presence of an
//! in-memory root key; opened-ness is the presence of a live hub. All
//! item operations take the store's exclusive lock first and the hub
//! lock second, the same order the background rotation task uses.

use std::sync::{Arc, Mutex as StdMutex};

use burrow_core::config::VaultConfig;
use burrow_core::{DomainSpec, ItemTuple, Migrations, VaultError, VaultResult};
use burrow_crypto::kdf::{
    derive_root_pair, random_entropy, random_nonce, HashParams, RootKey, RootPair,
};
use burrow_crypto::{
    derive_cipher_key, root_signature, rotate_root_key, verify_root, CipherKey, ENTROPY_SIZE,
    KEY_SIZE,
};
use burrow_hub::{spawn_rotation_task, BucketIo, Hub, IdentPattern, RotationHandle};
use burrow_kv::KvStore;
use secrecy::SecretString;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::base::{random_salt, VaultBase, BASE_KEY};
use crate::cache::{CachedSession, SessionCache};

/// Callback reporting `(entries done, entries total)` during root-key
/// rotation.
pub type Progress<'a> = Option<&'a (dyn Fn(usize, usize) + Sync)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    /// Connected to storage that holds no vault.
    NoVault,
    Connected,
}

struct SessionKeys {
    root: RootKey,
    cipher: CipherKey,
}

/// One caller's handle on a vault.
pub struct VaultSession {
    store: KvStore,
    config: VaultConfig,
    cache: Arc<dyn SessionCache>,
    state: ConnectionState,
    base: Arc<StdMutex<Option<VaultBase>>>,
    keys: Option<SessionKeys>,
    hub: Arc<Mutex<Option<Hub>>>,
    io: Option<BucketIo>,
    rotation: Option<RotationHandle>,
    open_waiters: Arc<StdMutex<Vec<oneshot::Sender<()>>>>,
    watcher: Option<JoinHandle<()>>,
}

impl VaultSession {
    pub fn new(store: KvStore, config: VaultConfig, cache: Arc<dyn SessionCache>) -> Self {
        Self {
            store,
            config,
            cache,
            state: ConnectionState::NotConnected,
            base: Arc::new(StdMutex::new(None)),
            keys: None,
            hub: Arc::new(Mutex::new(None)),
            io: None,
            rotation: None,
            open_waiters: Arc::new(StdMutex::new(Vec::new())),
            watcher: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_unlocked(&self) -> bool {
        self.keys.is_some()
    }

    pub async fn is_open(&self) -> bool {
        self.hub.lock().await.is_some()
    }

    /// Load the base entry, try a cached session key, and start
    /// watching the base entry for concurrent writers.
    pub async fn connect(&mut self) -> VaultResult<ConnectionState> {
        self.state = ConnectionState::Connecting;

        let base = VaultBase::load(&self.store).await?;
        self.set_base(base.clone())?;

        if self.watcher.is_none() {
            self.watcher = Some(self.spawn_base_watcher());
        }

        self.state = match base {
            None => ConnectionState::NoVault,
            Some(base) => {
                if self.keys.is_none() {
                    self.try_resume(&base)?;
                }
                ConnectionState::Connected
            }
        };
        Ok(self.state)
    }

    fn spawn_base_watcher(&self) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        let base = self.base.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.key == BASE_KEY => {
                        let parsed = event.new.as_deref().map(VaultBase::from_bytes);
                        match parsed {
                            Some(Ok(updated)) => {
                                if let Ok(mut slot) = base.lock() {
                                    *slot = Some(updated);
                                }
                            }
                            Some(Err(e)) => warn!("ignoring undecodable base update: {e}"),
                            None => {
                                if let Ok(mut slot) = base.lock() {
                                    *slot = None;
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Rebuild the root key from the session cache, if the cached
    /// generation still matches the stored signature.
    fn try_resume(&mut self, base: &VaultBase) -> VaultResult<()> {
        let Some(cached) = self.cache.take() else {
            return Ok(());
        };

        let signature = base.signature()?;
        let salt = base.salt()?;
        let Ok(bytes) = <[u8; KEY_SIZE]>::try_from(cached.key_bytes.as_slice()) else {
            return Ok(());
        };
        if cached.token != signature || cached.nonce != base.nonce()? {
            debug!("cached session key is stale, discarding");
            return Ok(());
        }

        let root = RootKey::from_bytes(bytes, cached.vector, cached.nonce, base.params.clone());
        if !verify_root(&root, &salt, &signature) {
            debug!("cached session key fails verification, discarding");
            return Ok(());
        }

        info!("session resumed from cached root key");
        self.install_keys(root, &salt, signature);
        Ok(())
    }

    /// Create a fresh vault. Refuses when one already exists.
    pub async fn register(&mut self, passphrase: SecretString) -> VaultResult<()> {
        match self.state {
            ConnectionState::NoVault => {}
            ConnectionState::Connected => return Err(VaultError::VaultExists),
            _ => return Err(VaultError::Bug("register before connect".into())),
        }

        let _lock = self.store.acquire().await;
        if VaultBase::load(&self.store).await?.is_some() {
            return Err(VaultError::VaultExists);
        }

        let entropy = random_entropy();
        let nonce = random_nonce();
        let params = HashParams::from_config(&self.config.crypto);
        let pair = derive_pair_blocking(passphrase, entropy, nonce, params.clone()).await?;

        // Nothing is encrypted yet, so the new generation is current
        // from the start.
        let salt = random_salt();
        let signature = root_signature(&pair.new, &salt);
        let base = VaultBase::new(&entropy, pair.new.nonce(), &signature, &salt, params);
        base.save(&self.store).await?;
        self.set_base(Some(base))?;

        self.install_keys(pair.new, &salt, signature);
        self.state = ConnectionState::Connected;
        info!("vault registered");
        Ok(())
    }

    /// Derive the tandem root pair, check it against the stored
    /// signature, and rotate every ciphertext entry to the new
    /// generation.
    ///
    /// A signature that only verifies under the *new* generation means
    /// a previous rotation advanced storage but the caller's metadata
    /// had not caught up; proceeding silently on that ambiguity is
    /// refused unless `recovering` is set.
    ///
    /// On an already-unlocked session the passphrase is still checked
    /// against the stored signature, but nothing rotates and the base
    /// entry is left alone.
    pub async fn unlock(
        &mut self,
        passphrase: SecretString,
        recovering: bool,
        progress: Progress<'_>,
    ) -> VaultResult<()> {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::NoVault => return Err(VaultError::NoVault),
            _ => return Err(VaultError::Bug("unlock before connect".into())),
        }

        let base = self.base_snapshot()?.ok_or(VaultError::NoVault)?;
        let entropy = base.entropy()?;
        let nonce = base.nonce()?;
        let salt = base.salt()?;
        let signature = base.signature()?;

        let _lock = self.store.acquire().await;
        let pair = derive_pair_blocking(passphrase, entropy, nonce, base.params.clone()).await?;

        let under_old = verify_root(&pair.old, &salt, &signature);
        let under_new = !under_old && verify_root(&pair.new, &salt, &signature);

        if self.keys.is_some() {
            // Already unlocked: nothing to rotate, but a wrong
            // passphrase is still an error, not a silent success.
            if under_old || under_new {
                return Ok(());
            }
            return Err(VaultError::InvalidPassphrase);
        }

        if under_old {
            // Normal path: storage is under the old generation.
        } else if under_new {
            if !recovering {
                return Err(VaultError::Recoverable);
            }
            info!("resuming interrupted root-key rotation");
        } else {
            return Err(VaultError::InvalidPassphrase);
        }

        let cipher = rotate_root_key(
            &self.store,
            &pair.old,
            &pair.new,
            &salt,
            self.config.rotation.flush_batch_bytes,
            progress,
        )
        .await?;

        let new_signature = root_signature(&pair.new, &salt);
        let mut updated = base;
        updated.set_generation(pair.new.nonce(), &new_signature);
        updated.save(&self.store).await?;
        self.set_base(Some(updated))?;

        self.keys = Some(SessionKeys {
            cipher,
            root: pair.new.clone(),
        });
        self.cache_keys(&pair.new, new_signature);
        info!("vault unlocked");
        Ok(())
    }

    /// Load or bootstrap the hub, reconcile the declared domains, and
    /// start the background bucket-rotation task.
    pub async fn open(&mut self, specs: &[DomainSpec], migrations: &Migrations) -> VaultResult<()> {
        let keys = self.keys.as_ref().ok_or(VaultError::Locked)?;
        let io = BucketIo::new(
            self.store.clone(),
            keys.cipher.clone(),
            *keys.root.vector(),
        );

        let _lock = self.store.acquire().await;
        let mut hub = match io.read_hub_bytes().await? {
            Some(bytes) => Hub::load(&bytes, migrations, self.config.hub.clone())?,
            None => Hub::empty(self.config.hub.clone()),
        };
        hub.reconcile(specs, migrations, &io).await?;
        hub.persist(&io).await?;

        *self.hub.lock().await = Some(hub);
        self.io = Some(io.clone());
        if self.rotation.is_none() {
            self.rotation = Some(spawn_rotation_task(
                self.hub.clone(),
                io,
                self.config.rotation.clone(),
            ));
        }

        // Copy before clearing so a waiter that re-subscribes from its
        // callback lands in the next round.
        let waiters = {
            let mut slot = self
                .open_waiters
                .lock()
                .map_err(|_| VaultError::Bug("open waiter list poisoned".into()))?;
            std::mem::take(&mut *slot)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }

        info!("vault open");
        Ok(())
    }

    /// Resolve once the vault is open. Already-open resolves
    /// immediately.
    pub async fn wait_until_open(&self) -> VaultResult<()> {
        if self.hub.lock().await.is_some() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self
                .open_waiters
                .lock()
                .map_err(|_| VaultError::Bug("open waiter list poisoned".into()))?;
            slot.push(tx);
        }
        // Re-check: open may have fired between the first check and
        // registration.
        if self.hub.lock().await.is_some() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Drop key material and the live hub; the background task flushes
    /// its pending rotation first.
    pub async fn lock(&mut self) {
        if let Some(handle) = self.rotation.take() {
            handle.shutdown().await;
        }
        *self.hub.lock().await = None;
        self.io = None;
        self.keys = None;
        self.cache.clear();
        info!("vault locked");
    }

    /// Lock and stop watching storage.
    pub async fn close(&mut self) {
        self.lock().await;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.state = ConnectionState::NotConnected;
    }

    // ------------------------------------------------------------------
    // Item operations
    // ------------------------------------------------------------------

    pub async fn put(&self, domain: &str, path: &str, tuple: ItemTuple) -> VaultResult<u64> {
        let io = self.io.as_ref().ok_or(VaultError::NotOpen)?;
        let _lock = self.store.acquire().await;
        let mut slot = self.hub.lock().await;
        let hub = slot.as_mut().ok_or(VaultError::NotOpen)?;

        let code = hub.put_item(domain, path, tuple, io).await?;
        if let Some(rotation) = &self.rotation {
            rotation.notify();
        }
        Ok(code)
    }

    pub async fn get(&self, domain: &str, path: &str) -> VaultResult<Option<ItemTuple>> {
        let io = self.io.as_ref().ok_or(VaultError::NotOpen)?;
        let _lock = self.store.acquire().await;
        let slot = self.hub.lock().await;
        let hub = slot.as_ref().ok_or(VaultError::NotOpen)?;
        hub.get_item(domain, path, io).await
    }

    pub async fn remove(&self, domain: &str, path: &str) -> VaultResult<bool> {
        let io = self.io.as_ref().ok_or(VaultError::NotOpen)?;
        let _lock = self.store.acquire().await;
        let mut slot = self.hub.lock().await;
        let hub = slot.as_mut().ok_or(VaultError::NotOpen)?;

        let removed = hub.remove_item(domain, path, io).await?;
        if removed {
            if let Some(rotation) = &self.rotation {
                rotation.notify();
            }
        }
        Ok(removed)
    }

    /// Every stored item as `(ident, code, tuple)`.
    pub async fn item_entries(&self) -> VaultResult<Vec<(String, u64, ItemTuple)>> {
        let io = self.io.as_ref().ok_or(VaultError::NotOpen)?;
        let _lock = self.store.acquire().await;
        let slot = self.hub.lock().await;
        let hub = slot.as_ref().ok_or(VaultError::NotOpen)?;
        hub.item_entries(io).await
    }

    /// Tracked `(storage key, true byte size)` of every bucket.
    pub async fn bucket_stats(&self) -> VaultResult<Vec<(String, usize)>> {
        let slot = self.hub.lock().await;
        let hub = slot.as_ref().ok_or(VaultError::NotOpen)?;
        Ok(hub
            .bucket_slots()
            .iter()
            .map(|s| (s.key.clone(), s.size))
            .collect())
    }

    /// Idents recorded under an index value, optionally filtered.
    pub async fn find_idents(
        &self,
        label: &str,
        value: &str,
        pattern: Option<&IdentPattern>,
    ) -> VaultResult<Vec<String>> {
        let slot = self.hub.lock().await;
        let hub = slot.as_ref().ok_or(VaultError::NotOpen)?;
        Ok(hub.find_idents_in_index(label, value, pattern))
    }

    // ------------------------------------------------------------------

    fn install_keys(&mut self, root: RootKey, salt: &[u8], token: Vec<u8>) {
        let cipher = derive_cipher_key(&root, salt, true);
        self.cache_keys(&root, token);
        self.keys = Some(SessionKeys { root, cipher });
    }

    fn cache_keys(&self, root: &RootKey, token: Vec<u8>) {
        self.cache.put(CachedSession {
            key_bytes: root.export_bytes(),
            vector: *root.vector(),
            nonce: root.nonce(),
            token,
        });
    }

    fn set_base(&self, base: Option<VaultBase>) -> VaultResult<()> {
        let mut slot = self
            .base
            .lock()
            .map_err(|_| VaultError::Bug("base slot poisoned".into()))?;
        *slot = base;
        Ok(())
    }

    fn base_snapshot(&self) -> VaultResult<Option<VaultBase>> {
        Ok(self
            .base
            .lock()
            .map_err(|_| VaultError::Bug("base slot poisoned".into()))?
            .clone())
    }
}

/// Argon2id pins a core for a noticeable stretch even at modest
/// costs; hash on the blocking pool instead of an async worker.
async fn derive_pair_blocking(
    passphrase: SecretString,
    entropy: [u8; ENTROPY_SIZE],
    nonce: u128,
    params: HashParams,
) -> VaultResult<RootPair> {
    tokio::task::spawn_blocking(move || derive_root_pair(passphrase, &entropy, nonce, &params))
        .await
        .map_err(|e| VaultError::Bug(format!("root derivation task failed: {e}")))?
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
