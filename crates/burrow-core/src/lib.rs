pub mod config;
pub mod error;
pub mod types;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use types::{
    DomainSpec, IndexSpec, ItemCodec, ItemTuple, Migrations, SchemaDescriptor, StorageStrategy,
};
