use serde::{Deserialize, Serialize};

/// Top-level engine configuration (loadable from burrow.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub crypto: CryptoConfig,
    pub hub: HubConfig,
    pub rotation: RotationConfig,
}

/// Argon2id cost parameters for root-key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub argon2_time_cost: u32,
    /// Parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

/// Hub and bucket layout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Target bucket byte-size cap (default: 4096)
    pub bucket_length: usize,
    /// Minimum padded size of the serialized hub entry (default: 2048)
    pub hub_pad_floor: usize,
    /// Hub padding growth increment once the floor is exceeded (default: 1024)
    pub hub_pad_increment: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bucket_length: 4096,
            hub_pad_floor: 2048,
            hub_pad_increment: 1024,
        }
    }
}

/// Background rotation and root-key rotation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Debounce delay before a bucket-rotation pass fires (default: 2000 ms)
    pub debounce_ms: u64,
    /// Hard ceiling on total postponement under sustained writes (default: 30000 ms)
    pub max_delay_ms: u64,
    /// Pending-plaintext byte threshold that flushes in-flight
    /// re-encryptions during root-key rotation (default: 32 KiB)
    pub flush_batch_bytes: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_delay_ms: 30000,
            flush_batch_bytes: 32 * 1024,
        }
    }
}

impl VaultConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
