//! burrow-crypto: the encrypted storage engine's key and cipher layer.
//!
//! Key hierarchy:
//! ```text
//! Root Key (256-bit, Argon2id over entropy(16) || nonce_be(16) with the passphrase)
//!   ├── Cipher Key  (HKDF-SHA256, per-vault salt, info="burrow-cipher", AES-256-GCM)
//!   ├── Signing Key (HKDF-SHA256, per-vault salt, info="burrow-signing", HMAC-SHA256)
//!   └── Nonce derivation (HKDF keyed by the 32-byte vector, salted per entry)
//! ```
//!
//! Nonces are never stored. They are re-derived deterministically from
//! the storage key (and, for versioned `#` entries, extra entropy kept
//! in the value prefix), so the same `(vector, salt)` always yields the
//! same nonce and plain `_` keys are strictly write-once.

pub mod codec;
pub mod kdf;
pub mod keys;
pub mod rotate;

pub use codec::{open_entry, read_nonce_for, seal_entry, test_round_trip, write_nonce_for};
pub use kdf::{derive_root_pair, random_entropy, random_nonce, HashParams, RootKey, RootPair};
pub use keys::{
    derive_cipher_key, derive_cipher_nonce, derive_signing_key, root_signature, verify_root,
    CipherKey, SigningKey,
};
pub use rotate::rotate_root_key;

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the per-installation entropy half of a vector
pub const ENTROPY_SIZE: usize = 16;

/// Size of the 32-byte entropy || nonce vector
pub const VECTOR_SIZE: usize = 32;

/// Extra entropy prepended to versioned (`#`) ciphertext values
pub const EXTRA_ENTROPY_SIZE: usize = 16;

/// Leading marker for versioned ciphertext keys (fresh entropy per write)
pub const VERSIONED_MARKER: char = '#';

/// Leading marker for plain ciphertext keys (write-once, key-derived nonce)
pub const CIPHER_MARKER: char = '_';

/// Version byte written at the head of versioned ciphertext values
pub const VALUE_VERSION: u8 = 1;

/// Returns true when `key` names a ciphertext entry of either class.
pub fn is_cipher_key(key: &str) -> bool {
    key.starts_with(VERSIONED_MARKER) || key.starts_with(CIPHER_MARKER)
}
