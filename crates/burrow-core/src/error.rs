use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Failure taxonomy for the storage engine.
///
/// Cryptographic and structural failures are never downgraded to empty
/// results: a ciphertext that does not authenticate, or a persisted
/// structure that does not decode, surfaces as `Corrupted`.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault corrupted: {0}")]
    Corrupted(String),

    #[error("invalid passphrase")]
    InvalidPassphrase,

    /// Storage verifies under the *new* root-key generation only, which
    /// means a previous unlock was interrupted mid-rotation. Unlocking
    /// from this state requires the caller to pass `recovering = true`.
    #[error("vault is in a recoverable mid-rotation state; retry with recovering set")]
    Recoverable,

    #[error("schema mismatch for domain '{domain}': {detail}")]
    Schema { domain: String, detail: String },

    #[error("no migration registered from version {from} to {to}")]
    MissingMigration { from: u32, to: u32 },

    #[error("migration from version {from} failed: {detail}")]
    Migration { from: u32, detail: String },

    /// Persisted data was written by a newer client than this one.
    #[error("storage is at db version {storage}, client only understands {client}")]
    ClientBehind { storage: u32, client: u32 },

    /// The encrypt/decrypt self-test failed. This signals a defect in
    /// the algorithm or its integration, never a user error.
    #[error("integrity self-test failed: {0}")]
    IntegrityCheck(String),

    #[error("internal invariant violated: {0}")]
    Bug(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no vault exists in this store")]
    NoVault,

    #[error("a vault already exists in this store")]
    VaultExists,

    #[error("vault is locked")]
    Locked,

    #[error("vault is not open")]
    NotOpen,
}

impl VaultError {
    /// Wrap a serde failure on *persisted* data. Undecodable stored
    /// structures are corruption, not I/O.
    pub fn corrupt(context: &str, err: impl std::fmt::Display) -> Self {
        VaultError::Corrupted(format!("{context}: {err}"))
    }
}
