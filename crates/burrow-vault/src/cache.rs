//! Session key cache: stay unlocked across reconnects without
//! re-entering the passphrase.
//!
//! The cache lives in a separate, possibly less durable medium than
//! the vault itself. It holds raw root-key bytes, the nonce-derivation
//! vector, and the base signature current at cache time; a resume that
//! finds a different signature in storage discards the entry instead
//! of trusting a stale generation.

use std::sync::Mutex;

use burrow_crypto::VECTOR_SIZE;
use zeroize::Zeroizing;

/// One cached root generation.
pub struct CachedSession {
    /// Raw root-key bytes; wiped on drop.
    pub key_bytes: Zeroizing<Vec<u8>>,
    /// The entropy || nonce vector of the cached generation.
    pub vector: [u8; VECTOR_SIZE],
    /// Root nonce of the cached generation.
    pub nonce: u128,
    /// Base signature at cache time, used as a staleness token.
    pub token: Vec<u8>,
}

/// Where a session parks its root key between connects.
pub trait SessionCache: Send + Sync {
    fn put(&self, entry: CachedSession);
    fn take(&self) -> Option<CachedSession>;
    fn clear(&self);
}

/// In-process cache. Survives reconnects within one process, nothing
/// more.
#[derive(Default)]
pub struct MemorySessionCache {
    slot: Mutex<Option<CachedSession>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionCache for MemorySessionCache {
    fn put(&self, entry: CachedSession) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(entry);
        }
    }

    fn take(&self) -> Option<CachedSession> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fill: u8) -> CachedSession {
        CachedSession {
            key_bytes: Zeroizing::new(vec![fill; 32]),
            vector: [fill; VECTOR_SIZE],
            nonce: u128::from(fill),
            token: vec![fill; 32],
        }
    }

    #[test]
    fn test_take_consumes_the_entry() {
        let cache = MemorySessionCache::new();
        cache.put(entry(1));

        assert!(cache.take().is_some());
        assert!(cache.take().is_none());
    }

    #[test]
    fn test_put_replaces() {
        let cache = MemorySessionCache::new();
        cache.put(entry(1));
        cache.put(entry(2));

        assert_eq!(cache.take().unwrap().nonce, 2);
    }

    #[test]
    fn test_clear_drops_the_entry() {
        let cache = MemorySessionCache::new();
        cache.put(entry(1));
        cache.clear();

        assert!(cache.take().is_none());
    }
}
