use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::VaultResult;

/// An item crosses the engine boundary as an ordered tuple of JSON
/// values plus a path string. How callers project tuple positions onto
/// typed fields is outside the engine.
pub type ItemTuple = Vec<serde_json::Value>;

/// Placement policy for a domain's items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageStrategy {
    /// First-fit over the domain's existing buckets.
    Default,
    /// Same placement as `Default`; buckets are kept as full as possible.
    Minimize,
    /// Only the most recently created bucket is considered; a full
    /// bucket forces a new one.
    Append,
}

/// Translates between a caller's typed item and the engine's
/// `(path, tuple)` contract.
pub trait ItemCodec {
    type Item;

    fn encode(&self, item: &Self::Item) -> VaultResult<(String, ItemTuple)>;
    fn decode(&self, path: &str, tuple: ItemTuple) -> VaultResult<Self::Item>;
}

/// A secondary index over one tuple position.
///
/// The indexed value is the JSON value at `position`, rendered to its
/// canonical string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    pub label: String,
    pub position: usize,
}

/// Versioned structural description of a domain's tuple layout.
///
/// Compared by structural equality of `shape`; the version number
/// exists so migrations can be keyed to the gap they bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub shape: serde_json::Value,
}

impl SchemaDescriptor {
    pub fn matches(&self, other: &SchemaDescriptor) -> bool {
        self.shape == other.shape
    }
}

/// Declaration an item controller registers for its domain on open.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub strategy: StorageStrategy,
    pub schema: SchemaDescriptor,
    pub indexes: Vec<IndexSpec>,
}

impl DomainSpec {
    pub fn new(name: impl Into<String>, strategy: StorageStrategy, schema: SchemaDescriptor) -> Self {
        Self {
            name: name.into(),
            strategy,
            schema,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, label: impl Into<String>, position: usize) -> Self {
        self.indexes.push(IndexSpec {
            label: label.into(),
            position,
        });
        self
    }
}

/// Rewrites one item tuple from a schema version to the next.
pub type SchemaMigrationFn = Box<dyn Fn(ItemTuple) -> VaultResult<ItemTuple> + Send + Sync>;

/// Rewrites the hub's persisted JSON form from one db version to the next.
pub type DbMigrationFn = Box<dyn Fn(&mut serde_json::Value) -> VaultResult<()> + Send + Sync>;

/// Registered migration handlers, passed to `open`.
///
/// Db migrations are keyed by the version they migrate *from* and are
/// replayed sequentially; every gap between the stored version and the
/// client version must be covered. Schema migrations are keyed by
/// `(domain, from_version)` and rewrite item tuples bucket by bucket.
#[derive(Default)]
pub struct Migrations {
    db: HashMap<u32, DbMigrationFn>,
    schema: HashMap<(String, u32), SchemaMigrationFn>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_db(&mut self, from_version: u32, f: DbMigrationFn) {
        self.db.insert(from_version, f);
    }

    pub fn register_schema(&mut self, domain: impl Into<String>, from_version: u32, f: SchemaMigrationFn) {
        self.schema.insert((domain.into(), from_version), f);
    }

    pub fn db_migration(&self, from_version: u32) -> Option<&DbMigrationFn> {
        self.db.get(&from_version)
    }

    pub fn schema_migration(&self, domain: &str, from_version: u32) -> Option<&SchemaMigrationFn> {
        self.schema.get(&(domain.to_string(), from_version))
    }
}

impl std::fmt::Debug for Migrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrations")
            .field("db", &self.db.keys().collect::<Vec<_>>())
            .field("schema", &self.schema.keys().collect::<Vec<_>>())
            .finish()
    }
}
