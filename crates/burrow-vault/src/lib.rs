//! burrow-vault: the session layer over the encrypted object store.
//!
//! A `VaultSession` connects to a backing key-value store, registers
//! or unlocks a vault with a passphrase, opens the hub, and exposes
//! put/get/remove over schema-declared domains. Root-key rotation runs
//! on every unlock; bucket storage keys rotate in the background after
//! writes.

pub mod base;
pub mod cache;
pub mod session;

pub use base::{VaultBase, BASE_KEY};
pub use cache::{CachedSession, MemorySessionCache, SessionCache};
pub use session::{ConnectionState, Progress, VaultSession};

pub use burrow_core::config::VaultConfig;
pub use burrow_core::{
    DomainSpec, ItemCodec, ItemTuple, Migrations, SchemaDescriptor, StorageStrategy, VaultError,
    VaultResult,
};
pub use burrow_hub::IdentPattern;
pub use burrow_kv::KvStore;
pub use secrecy::SecretString;
