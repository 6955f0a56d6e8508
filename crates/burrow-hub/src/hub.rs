//! The hub: domains, items, buckets, indexes, locations.
//!
//! Persisted shape (JSON, one encrypted entry under `#hub`):
//! - `domains`: ordered labels; a domain's code is its index, base-92
//! - `items`: sparse slot table of idents (`domainCode:path`); an
//!   item's code is its slot index, slot 0 is reserved so 0 never
//!   denotes a real item
//! - `next_item`: lowest empty slot, 0 when none (gap free-pointer)
//! - `indexes`: label → value → ordered item codes
//! - `buckets`: `[storage key, true byte size]` slots; bucket code is
//!   the index
//! - `locations`: item code → bucket code
//! - `buckets_to_schemas` / `schemas`: which schema version encoded
//!   each bucket's contents
//!
//! Codes are stable for the life of an item or domain; emptied item
//! slots are reused lowest-first before the table grows.

use std::collections::{HashMap, HashSet};

use burrow_core::config::HubConfig;
use burrow_core::{
    DomainSpec, ItemTuple, Migrations, SchemaDescriptor, StorageStrategy, VaultError, VaultResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bucket::{BucketContents, BucketIo};
use crate::code::{encode_code, random_bucket_key, IdentPattern};

/// Highest persisted hub layout version this build understands.
pub const DB_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSlot {
    pub key: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HubState {
    db_version: u32,
    bucket_length: usize,
    domains: Vec<String>,
    strategies: Vec<StorageStrategy>,
    domain_buckets: Vec<Vec<usize>>,
    items: Vec<Option<String>>,
    next_item: usize,
    indexes: HashMap<String, HashMap<String, Vec<u64>>>,
    buckets: Vec<BucketSlot>,
    locations: Vec<Option<usize>>,
    buckets_to_schemas: Vec<usize>,
    schemas: Vec<SchemaDescriptor>,
}

/// The authoritative in-memory index. Mutated in place, then the whole
/// hub is re-serialized and rewritten on every structural change.
#[derive(Debug)]
pub struct Hub {
    state: HubState,
    config: HubConfig,
    specs: HashMap<usize, DomainSpec>,
    ident_lookup: HashMap<String, u64>,
    rotation_bypass: HashSet<usize>,
}

impl Hub {
    pub fn empty(config: HubConfig) -> Self {
        let state = HubState {
            db_version: DB_VERSION,
            bucket_length: config.bucket_length,
            domains: Vec::new(),
            strategies: Vec::new(),
            domain_buckets: Vec::new(),
            items: vec![None],
            next_item: 0,
            indexes: HashMap::new(),
            buckets: Vec::new(),
            locations: vec![None],
            buckets_to_schemas: Vec::new(),
            schemas: Vec::new(),
        };
        Self {
            state,
            config,
            specs: HashMap::new(),
            ident_lookup: HashMap::new(),
            rotation_bypass: HashSet::new(),
        }
    }

    /// Decode a stored hub, replaying db-version migrations first.
    ///
    /// Storage ahead of the client is fatal: future-version data is
    /// refused, never silently truncated.
    pub fn load(bytes: &[u8], migrations: &Migrations, config: HubConfig) -> VaultResult<Self> {
        let mut value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| VaultError::corrupt("decoding hub", e))?;

        let mut version = value
            .get("db_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| VaultError::Corrupted("hub has no db_version".into()))?
            as u32;

        if version > DB_VERSION {
            return Err(VaultError::ClientBehind {
                storage: version,
                client: DB_VERSION,
            });
        }

        while version < DB_VERSION {
            let migrate = migrations
                .db_migration(version)
                .ok_or(VaultError::MissingMigration {
                    from: version,
                    to: version + 1,
                })?;
            migrate(&mut value).map_err(|e| VaultError::Migration {
                from: version,
                detail: e.to_string(),
            })?;
            version += 1;
            value["db_version"] = serde_json::json!(version);
            info!(version, "hub db migration applied");
        }

        let state: HubState = serde_json::from_value(value)
            .map_err(|e| VaultError::corrupt("decoding hub state", e))?;
        check_consistency(&state)?;

        let mut ident_lookup = HashMap::new();
        for (code, slot) in state.items.iter().enumerate() {
            if let Some(ident) = slot {
                ident_lookup.insert(ident.clone(), code as u64);
            }
        }

        Ok(Self {
            state,
            config,
            specs: HashMap::new(),
            ident_lookup,
            rotation_bypass: HashSet::new(),
        })
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(&self.state).map_err(|e| VaultError::Bug(format!("encoding hub: {e}")))
    }

    /// Rewrite the full hub entry. Every mutation path calls this
    /// before releasing the store lock.
    pub async fn persist(&self, io: &BucketIo) -> VaultResult<()> {
        io.write_hub(
            self.to_bytes()?,
            self.config.hub_pad_floor,
            self.config.hub_pad_increment,
        )
        .await
    }

    pub fn bucket_length(&self) -> usize {
        self.state.bucket_length
    }

    pub fn domains(&self) -> &[String] {
        &self.state.domains
    }

    pub fn bucket_slots(&self) -> &[BucketSlot] {
        &self.state.buckets
    }

    /// Number of live items (reserved slot 0 excluded).
    pub fn item_count(&self) -> usize {
        self.ident_lookup.len()
    }

    // ------------------------------------------------------------------
    // Codes and idents
    // ------------------------------------------------------------------

    pub fn domain_index(&self, name: &str) -> Option<usize> {
        self.state.domains.iter().position(|d| d == name)
    }

    pub fn domain_code(&self, name: &str) -> Option<String> {
        self.domain_index(name).map(|i| encode_code(i as u64))
    }

    fn ident(&self, domain_idx: usize, path: &str) -> String {
        format!("{}:{}", encode_code(domain_idx as u64), path)
    }

    pub fn item_code(&self, domain: &str, path: &str) -> Option<u64> {
        let d = self.domain_index(domain)?;
        self.ident_lookup.get(&self.ident(d, path)).copied()
    }

    pub fn item_ident(&self, code: u64) -> Option<&str> {
        self.state
            .items
            .get(code as usize)
            .and_then(|s| s.as_deref())
    }

    /// Look up or allocate the code for an ident. Reuses the lowest
    /// tracked gap before growing the table; once a gap is filled, the
    /// pointer rescans forward for the next empty slot (gaps are rare,
    /// bounded by churn rather than item count).
    pub fn add_item_key(&mut self, domain_idx: usize, path: &str) -> (u64, bool) {
        let ident = self.ident(domain_idx, path);
        if let Some(&code) = self.ident_lookup.get(&ident) {
            return (code, true);
        }

        let code = if self.state.next_item != 0
            && self
                .state
                .items
                .get(self.state.next_item)
                .is_some_and(|s| s.is_none())
        {
            let gap = self.state.next_item;
            self.state.items[gap] = Some(ident.clone());
            self.state.next_item = self
                .state
                .items
                .iter()
                .enumerate()
                .skip(gap + 1)
                .find(|(_, s)| s.is_none())
                .map(|(i, _)| i)
                .unwrap_or(0);
            gap as u64
        } else {
            self.state.items.push(Some(ident.clone()));
            self.state.locations.push(None);
            (self.state.items.len() - 1) as u64
        };

        self.ident_lookup.insert(ident, code);
        (code, false)
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Pick the bucket a new entry of `item_size` bytes goes into,
    /// creating one when nothing has room. Returns `(bucket code,
    /// created)`.
    ///
    /// DEFAULT and MINIMIZE are first-fit over the domain's buckets in
    /// creation order; APPEND only ever considers the newest bucket.
    pub fn select_bucket_for_insert(
        &mut self,
        domain_idx: usize,
        item_size: usize,
    ) -> VaultResult<(usize, bool)> {
        let strategy = *self
            .state
            .strategies
            .get(domain_idx)
            .ok_or_else(|| VaultError::Bug(format!("no such domain index {domain_idx}")))?;
        let target = self.state.bucket_length;

        let candidates = &self.state.domain_buckets[domain_idx];
        let found = match strategy {
            StorageStrategy::Default | StorageStrategy::Minimize => candidates
                .iter()
                .copied()
                .find(|&b| has_room(&self.state.buckets[b], target, item_size)),
            StorageStrategy::Append => candidates
                .last()
                .copied()
                .filter(|&b| has_room(&self.state.buckets[b], target, item_size)),
        };

        if let Some(code) = found {
            return Ok((code, false));
        }

        let schema_idx = self.domain_schema_index(domain_idx)?;
        self.state.buckets.push(BucketSlot {
            key: random_bucket_key(),
            size: 2, // "{}"
        });
        let code = self.state.buckets.len() - 1;
        self.state.domain_buckets[domain_idx].push(code);
        self.state.buckets_to_schemas.push(schema_idx);

        debug!(domain = %self.state.domains[domain_idx], bucket = code, "new bucket allocated");
        Ok((code, true))
    }

    fn domain_schema_index(&mut self, domain_idx: usize) -> VaultResult<usize> {
        let spec = self
            .specs
            .get(&domain_idx)
            .ok_or_else(|| VaultError::Bug(format!("domain index {domain_idx} not registered")))?;
        Ok(intern_schema(&mut self.state.schemas, &spec.schema))
    }

    // ------------------------------------------------------------------
    // Item operations (caller holds the store's exclusive lock)
    // ------------------------------------------------------------------

    /// Store an item tuple under `domain`/`path`.
    ///
    /// Ordering: bucket writes happen before the hub rewrite that
    /// references them, and stale storage keys are pruned strictly
    /// after it. A crash in between leaves an orphaned unreferenced
    /// bucket, never a dangling reference.
    pub async fn put_item(
        &mut self,
        domain: &str,
        path: &str,
        tuple: ItemTuple,
        io: &BucketIo,
    ) -> VaultResult<u64> {
        let domain_idx = self
            .domain_index(domain)
            .ok_or_else(|| VaultError::Bug(format!("domain '{domain}' was never registered")))?;

        let (code, existed) = self.add_item_key(domain_idx, path);
        let entry_sz = entry_size(code, &tuple)?;
        let target = self.state.bucket_length;

        if entry_sz + 2 > target {
            // Accepted, but a single entry dominating its bucket makes
            // the ciphertext length track this one item.
            warn!(
                domain,
                path,
                size = entry_sz,
                bucket_length = target,
                "item exceeds bucket capacity on its own"
            );
        }

        let mut stale: Vec<String> = Vec::new();
        let old_tuple = if existed {
            self.update_existing(code, entry_sz, tuple.clone(), io, &mut stale)
                .await?
        } else {
            self.insert_new(domain_idx, code, entry_sz, tuple.clone(), io, &mut stale)
                .await?;
            None
        };

        self.reindex_item(domain_idx, code, old_tuple.as_ref(), Some(&tuple));

        self.persist(io).await?;
        io.prune_keys(&stale).await?;
        Ok(code)
    }

    /// In-place update when the entry still fits its current bucket,
    /// relocation otherwise. A bucket already over target forces
    /// relocation even when the entry shrank.
    async fn update_existing(
        &mut self,
        code: u64,
        entry_sz: usize,
        tuple: ItemTuple,
        io: &BucketIo,
        stale: &mut Vec<String>,
    ) -> VaultResult<Option<ItemTuple>> {
        let bucket = self.state.locations[code as usize]
            .ok_or_else(|| VaultError::Corrupted(format!("item {code} has no location")))?;
        let old_key = self.state.buckets[bucket].key.clone();
        let mut contents = io.read_bucket(&old_key).await?;

        let old_tuple = contents
            .get(&code)
            .cloned()
            .ok_or_else(|| VaultError::Corrupted(format!("item {code} missing from its bucket")))?;
        let old_entry_sz = entry_size(code, &old_tuple)?;

        let target = self.state.bucket_length;
        let current = self.state.buckets[bucket].size;
        let over_target = current > target;
        let projected = current.saturating_sub(old_entry_sz) + entry_sz;
        let fits = !over_target && (projected <= target || entry_sz + 1 <= old_entry_sz);

        if fits {
            contents.insert(code, tuple);
            self.rewrite_bucket(bucket, &contents, io, stale).await?;
        } else {
            contents.remove(&code);
            self.rewrite_bucket(bucket, &contents, io, stale).await?;

            let domain_idx = self.domain_of_bucket(bucket)?;
            self.insert_new(domain_idx, code, entry_sz, tuple, io, stale)
                .await?;
        }

        Ok(Some(old_tuple))
    }

    async fn insert_new(
        &mut self,
        domain_idx: usize,
        code: u64,
        entry_sz: usize,
        tuple: ItemTuple,
        io: &BucketIo,
        stale: &mut Vec<String>,
    ) -> VaultResult<()> {
        let (bucket, created) = self.select_bucket_for_insert(domain_idx, entry_sz)?;

        let mut contents = if created {
            BucketContents::new()
        } else {
            io.read_bucket(&self.state.buckets[bucket].key).await?
        };
        contents.insert(code, tuple);

        if created {
            // First write: the fresh key has nothing stored under it.
            let key = self.state.buckets[bucket].key.clone();
            let true_len = io
                .write_bucket(&key, &contents, self.state.bucket_length)
                .await?;
            self.state.buckets[bucket].size = true_len;
        } else {
            self.rewrite_bucket(bucket, &contents, io, stale).await?;
        }

        self.state.locations[code as usize] = Some(bucket);
        Ok(())
    }

    /// Rewrite a bucket's contents under a fresh storage key. Plain
    /// `_` keys are write-once: their nonce is derived from the key
    /// alone, so a content change must change the key.
    async fn rewrite_bucket(
        &mut self,
        bucket: usize,
        contents: &BucketContents,
        io: &BucketIo,
        stale: &mut Vec<String>,
    ) -> VaultResult<()> {
        let new_key = random_bucket_key();
        let true_len = io
            .write_bucket(&new_key, contents, self.state.bucket_length)
            .await?;

        let slot = &mut self.state.buckets[bucket];
        stale.push(std::mem::replace(&mut slot.key, new_key));
        slot.size = true_len;
        Ok(())
    }

    fn domain_of_bucket(&self, bucket: usize) -> VaultResult<usize> {
        self.state
            .domain_buckets
            .iter()
            .position(|list| list.contains(&bucket))
            .ok_or_else(|| VaultError::Bug(format!("bucket {bucket} belongs to no domain")))
    }

    /// Fetch one item's tuple, or `None` when it was never stored.
    pub async fn get_item(
        &self,
        domain: &str,
        path: &str,
        io: &BucketIo,
    ) -> VaultResult<Option<ItemTuple>> {
        let Some(code) = self.item_code(domain, path) else {
            return Ok(None);
        };
        let bucket = self.state.locations[code as usize]
            .ok_or_else(|| VaultError::Corrupted(format!("item {code} has no location")))?;
        let contents = io.read_bucket(&self.state.buckets[bucket].key).await?;
        contents
            .get(&code)
            .cloned()
            .map(Some)
            .ok_or_else(|| VaultError::Corrupted(format!("item {code} missing from its bucket")))
    }

    /// Remove an item, freeing its slot for reuse.
    pub async fn remove_item(&mut self, domain: &str, path: &str, io: &BucketIo) -> VaultResult<bool> {
        let Some(code) = self.item_code(domain, path) else {
            return Ok(false);
        };
        let domain_idx = self
            .domain_index(domain)
            .ok_or_else(|| VaultError::Bug(format!("domain '{domain}' was never registered")))?;

        let mut stale = Vec::new();
        let bucket = self.state.locations[code as usize]
            .ok_or_else(|| VaultError::Corrupted(format!("item {code} has no location")))?;
        let mut contents = io.read_bucket(&self.state.buckets[bucket].key).await?;
        let old_tuple = contents.remove(&code);
        self.rewrite_bucket(bucket, &contents, io, &mut stale).await?;

        let ident = self.state.items[code as usize]
            .take()
            .ok_or_else(|| VaultError::Bug(format!("item {code} slot already empty")))?;
        self.ident_lookup.remove(&ident);
        self.state.locations[code as usize] = None;
        if self.state.next_item == 0 || (code as usize) < self.state.next_item {
            self.state.next_item = code as usize;
        }

        self.reindex_item(domain_idx, code, old_tuple.as_ref(), None);

        self.persist(io).await?;
        io.prune_keys(&stale).await?;
        Ok(true)
    }

    /// Iterate every stored item as `(ident, code, tuple)`.
    pub async fn item_entries(
        &self,
        io: &BucketIo,
    ) -> VaultResult<Vec<(String, u64, ItemTuple)>> {
        let mut by_bucket: HashMap<usize, Vec<u64>> = HashMap::new();
        for (code, slot) in self.state.items.iter().enumerate() {
            if slot.is_some() {
                if let Some(bucket) = self.state.locations[code] {
                    by_bucket.entry(bucket).or_default().push(code as u64);
                }
            }
        }

        let mut entries = Vec::new();
        for (bucket, codes) in by_bucket {
            let contents = io.read_bucket(&self.state.buckets[bucket].key).await?;
            for code in codes {
                let tuple = contents.get(&code).cloned().ok_or_else(|| {
                    VaultError::Corrupted(format!("item {code} missing from bucket {bucket}"))
                })?;
                if let Some(ident) = self.state.items[code as usize].clone() {
                    entries.push((ident, code, tuple));
                }
            }
        }
        entries.sort_by_key(|(_, code, _)| *code);
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Secondary indexes
    // ------------------------------------------------------------------

    fn reindex_item(
        &mut self,
        domain_idx: usize,
        code: u64,
        old_tuple: Option<&ItemTuple>,
        new_tuple: Option<&ItemTuple>,
    ) {
        let Some(spec) = self.specs.get(&domain_idx) else {
            return;
        };
        let index_specs = spec.indexes.clone();

        for index in &index_specs {
            if let Some(old) = old_tuple.and_then(|t| t.get(index.position)) {
                if let Some(values) = self.state.indexes.get_mut(&index.label) {
                    let key = index_value_string(old);
                    if let Some(codes) = values.get_mut(&key) {
                        codes.retain(|&c| c != code);
                        if codes.is_empty() {
                            values.remove(&key);
                        }
                    }
                }
            }

            if let Some(new) = new_tuple.and_then(|t| t.get(index.position)) {
                let codes = self
                    .state
                    .indexes
                    .entry(index.label.clone())
                    .or_default()
                    .entry(index_value_string(new))
                    .or_default();
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
    }

    /// The full value map of an index, or `None` when no such index
    /// exists (distinct from an existing index with no entries for a
    /// value).
    pub fn get_index(&self, label: &str) -> Option<&HashMap<String, Vec<u64>>> {
        self.state.indexes.get(label)
    }

    /// Codes recorded under `label` = `value`.
    pub fn scan_index(&self, label: &str, value: &str) -> Option<&[u64]> {
        self.state
            .indexes
            .get(label)?
            .get(value)
            .map(|v| v.as_slice())
    }

    /// Codes under `label` = `value`, optionally filtered by an ident
    /// pattern.
    pub fn find_codes_in_index(
        &self,
        label: &str,
        value: &str,
        pattern: Option<&IdentPattern>,
    ) -> Vec<u64> {
        self.scan_index(label, value)
            .map(|codes| {
                codes
                    .iter()
                    .copied()
                    .filter(|&code| match (pattern, self.item_ident(code)) {
                        (None, _) => true,
                        (Some(p), Some(ident)) => p.matches(ident),
                        (Some(_), None) => false,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Like `find_codes_in_index`, but resolving codes to idents.
    pub fn find_idents_in_index(
        &self,
        label: &str,
        value: &str,
        pattern: Option<&IdentPattern>,
    ) -> Vec<String> {
        self.find_codes_in_index(label, value, pattern)
            .into_iter()
            .filter_map(|code| self.item_ident(code).map(str::to_string))
            .collect()
    }

    // ------------------------------------------------------------------
    // Open-time reconciliation
    // ------------------------------------------------------------------

    /// Reconcile the declared controller set against the stored hub:
    /// append unknown domains, compare bucket schemas structurally, and
    /// replay schema migrations across any version gap. A mismatch no
    /// registered migration bridges is fatal schema drift.
    pub async fn reconcile(
        &mut self,
        specs: &[DomainSpec],
        migrations: &Migrations,
        io: &BucketIo,
    ) -> VaultResult<()> {
        let mut stale = Vec::new();
        let mut dirty = false;

        for spec in specs {
            let domain_idx = match self.domain_index(&spec.name) {
                Some(idx) => idx,
                None => {
                    self.state.domains.push(spec.name.clone());
                    self.state.strategies.push(spec.strategy);
                    self.state.domain_buckets.push(Vec::new());
                    dirty = true;
                    info!(domain = %spec.name, "domain registered");
                    self.state.domains.len() - 1
                }
            };

            if self.state.strategies[domain_idx] != spec.strategy {
                self.state.strategies[domain_idx] = spec.strategy;
                dirty = true;
            }

            dirty |= self
                .migrate_domain_schemas(domain_idx, spec, migrations, io, &mut stale)
                .await?;

            self.specs.insert(domain_idx, spec.clone());
        }

        if dirty {
            self.persist(io).await?;
            io.prune_keys(&stale).await?;
        }
        Ok(())
    }

    async fn migrate_domain_schemas(
        &mut self,
        domain_idx: usize,
        spec: &DomainSpec,
        migrations: &Migrations,
        io: &BucketIo,
        stale: &mut Vec<String>,
    ) -> VaultResult<bool> {
        let mut dirty = false;

        for bucket in self.state.domain_buckets[domain_idx].clone() {
            let schema_idx = self.state.buckets_to_schemas[bucket];
            let stored = self.state.schemas[schema_idx].clone();
            if stored.matches(&spec.schema) {
                continue;
            }

            if stored.version >= spec.schema.version {
                return Err(VaultError::Schema {
                    domain: spec.name.clone(),
                    detail: format!(
                        "stored schema v{} differs structurally from declared v{}",
                        stored.version, spec.schema.version
                    ),
                });
            }

            // Collect the full handler chain before touching data.
            let mut chain = Vec::new();
            for from in stored.version..spec.schema.version {
                let step = migrations.schema_migration(&spec.name, from).ok_or_else(|| {
                    VaultError::Schema {
                        domain: spec.name.clone(),
                        detail: format!("no schema migration from v{from} to v{}", from + 1),
                    }
                })?;
                chain.push(step);
            }

            let contents = io.read_bucket(&self.state.buckets[bucket].key).await?;
            let mut migrated = BucketContents::new();
            for (code, tuple) in contents {
                let mut tuple = tuple;
                for step in &chain {
                    tuple = step(tuple).map_err(|e| VaultError::Migration {
                        from: stored.version,
                        detail: e.to_string(),
                    })?;
                }
                migrated.insert(code, tuple);
            }

            self.rewrite_bucket(bucket, &migrated, io, stale).await?;
            let new_schema_idx = intern_schema(&mut self.state.schemas, &spec.schema);
            self.state.buckets_to_schemas[bucket] = new_schema_idx;
            dirty = true;
            info!(
                domain = %spec.name,
                bucket,
                from = stored.version,
                to = spec.schema.version,
                "bucket schema migrated"
            );
        }

        Ok(dirty)
    }

    // ------------------------------------------------------------------
    // Bucket key rotation
    // ------------------------------------------------------------------

    /// Exclude a bucket from background key rotation.
    pub fn bypass_rotation(&mut self, bucket: usize) {
        self.rotation_bypass.insert(bucket);
    }

    /// Re-key every live bucket under a fresh random storage key, then
    /// rewrite the hub once and bulk-delete the replaced keys. Content
    /// is unchanged; this only breaks long-term linkability between a
    /// storage key and its ciphertext history.
    pub async fn rotate_buckets(&mut self, io: &BucketIo) -> VaultResult<usize> {
        let mut stale = Vec::new();
        let mut rotated = 0;

        for bucket in 0..self.state.buckets.len() {
            if self.rotation_bypass.contains(&bucket) {
                continue;
            }
            let contents = io.read_bucket(&self.state.buckets[bucket].key).await?;
            self.rewrite_bucket(bucket, &contents, io, &mut stale).await?;
            rotated += 1;
        }

        if rotated > 0 {
            self.persist(io).await?;
            io.prune_keys(&stale).await?;
            debug!(rotated, "bucket storage keys rotated");
        }
        Ok(rotated)
    }
}

/// Cross-check the parallel tables of a freshly decoded hub. A state
/// that parses but references slots that do not exist is corruption
/// and must be refused here, before any lookup can index out of
/// bounds.
fn check_consistency(state: &HubState) -> VaultResult<()> {
    if state.items.is_empty() {
        return Err(VaultError::Corrupted(
            "hub item table is empty; slot 0 must exist".into(),
        ));
    }
    if state.items.len() != state.locations.len() {
        return Err(VaultError::Corrupted(format!(
            "hub tracks {} item slots but {} locations",
            state.items.len(),
            state.locations.len()
        )));
    }
    if state.strategies.len() != state.domains.len()
        || state.domain_buckets.len() != state.domains.len()
    {
        return Err(VaultError::Corrupted(format!(
            "hub tracks {} domains but {} strategies and {} bucket lists",
            state.domains.len(),
            state.strategies.len(),
            state.domain_buckets.len()
        )));
    }
    if state.buckets_to_schemas.len() != state.buckets.len() {
        return Err(VaultError::Corrupted(format!(
            "hub tracks {} buckets but {} schema links",
            state.buckets.len(),
            state.buckets_to_schemas.len()
        )));
    }
    for (code, location) in state.locations.iter().enumerate() {
        if let Some(bucket) = location {
            if *bucket >= state.buckets.len() {
                return Err(VaultError::Corrupted(format!(
                    "item {code} placed in bucket {bucket}, but only {} buckets exist",
                    state.buckets.len()
                )));
            }
        }
    }
    for schema in &state.buckets_to_schemas {
        if *schema >= state.schemas.len() {
            return Err(VaultError::Corrupted(format!(
                "bucket schema link {schema} out of range; {} schemas known",
                state.schemas.len()
            )));
        }
    }
    for list in &state.domain_buckets {
        for bucket in list {
            if *bucket >= state.buckets.len() {
                return Err(VaultError::Corrupted(format!(
                    "domain bucket list names bucket {bucket}, but only {} buckets exist",
                    state.buckets.len()
                )));
            }
        }
    }
    Ok(())
}

fn has_room(slot: &BucketSlot, target: usize, item_size: usize) -> bool {
    target > slot.size && target - slot.size > item_size
}

/// Serialized size of one bucket entry: `"code":tuple,`.
fn entry_size(code: u64, tuple: &ItemTuple) -> VaultResult<usize> {
    let tuple_len = serde_json::to_vec(tuple)
        .map_err(|e| VaultError::Bug(format!("encoding item tuple: {e}")))?
        .len();
    Ok(tuple_len + code.to_string().len() + 4)
}

fn index_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn intern_schema(schemas: &mut Vec<SchemaDescriptor>, schema: &SchemaDescriptor) -> usize {
    if let Some(idx) = schemas.iter().position(|s| s == schema) {
        return idx;
    }
    schemas.push(schema.clone());
    schemas.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_crypto::derive_cipher_key;
    use burrow_crypto::kdf::{build_vector, HashParams, RootKey};
    use burrow_kv::KvStore;
    use serde_json::json;

    fn test_io() -> BucketIo {
        let vector = build_vector(&[0x33u8; 16], 3);
        let root = RootKey::from_bytes([0x44u8; 32], vector, 3, HashParams::default());
        let cipher = derive_cipher_key(&root, b"salt", true);
        BucketIo::new(KvStore::memory(), cipher, vector)
    }

    fn chain_spec() -> DomainSpec {
        DomainSpec::new(
            "chains",
            StorageStrategy::Default,
            SchemaDescriptor {
                version: 1,
                shape: json!(["name", "coin_type"]),
            },
        )
        .with_index("by_coin", 1)
    }

    fn small_config() -> HubConfig {
        HubConfig {
            bucket_length: 256,
            hub_pad_floor: 512,
            hub_pad_increment: 256,
        }
    }

    async fn fresh_hub(io: &BucketIo) -> Hub {
        let mut hub = Hub::empty(small_config());
        hub.reconcile(&[chain_spec()], &Migrations::new(), io)
            .await
            .unwrap();
        hub
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        let tuple = vec![json!("cosmoshub"), json!(118)];
        let code = hub.put_item("chains", "cosmoshub", tuple.clone(), &io).await.unwrap();

        assert!(code > 0, "slot 0 is reserved");
        assert_eq!(hub.get_item("chains", "cosmoshub", &io).await.unwrap(), Some(tuple));
        assert_eq!(hub.get_item("chains", "missing", &io).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_codes_are_stable_across_updates() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        let a = hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        let b = hub.put_item("chains", "a", vec![json!("a"), json!(2)], &io).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_removed_slot_is_reused_lowest_first() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        let a = hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        let b = hub.put_item("chains", "b", vec![json!("b"), json!(2)], &io).await.unwrap();
        let c = hub.put_item("chains", "c", vec![json!("c"), json!(3)], &io).await.unwrap();
        assert!(a < b && b < c);

        assert!(hub.remove_item("chains", "a", &io).await.unwrap());
        assert!(hub.remove_item("chains", "b", &io).await.unwrap());

        // Lowest gap first, then the next one, then fresh growth.
        let d = hub.put_item("chains", "d", vec![json!("d"), json!(4)], &io).await.unwrap();
        let e = hub.put_item("chains", "e", vec![json!("e"), json!(5)], &io).await.unwrap();
        let f = hub.put_item("chains", "f", vec![json!("f"), json!(6)], &io).await.unwrap();
        assert_eq!(d, a);
        assert_eq!(e, b);
        assert_eq!(f, c + 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_on_missing() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        assert!(!hub.remove_item("chains", "ghost", &io).await.unwrap());
    }

    #[tokio::test]
    async fn test_every_rewrite_uses_a_fresh_storage_key() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        let key_before = hub.bucket_slots()[0].key.clone();
        hub.put_item("chains", "a", vec![json!("a"), json!(2)], &io).await.unwrap();
        let key_after = hub.bucket_slots()[0].key.clone();

        assert_ne!(key_before, key_after);
        assert!(io.store().get(&key_before).await.unwrap().is_none(), "stale key pruned");
    }

    #[tokio::test]
    async fn test_buckets_stay_under_target() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        for i in 0..40 {
            let path = format!("chain-{i}");
            hub.put_item("chains", &path, vec![json!(path.clone()), json!(i)], &io)
                .await
                .unwrap();
        }

        assert!(hub.bucket_slots().len() > 1, "spilled into multiple buckets");
        for slot in hub.bucket_slots() {
            assert!(
                slot.size <= hub.bucket_length(),
                "bucket size {} over target {}",
                slot.size,
                hub.bucket_length()
            );
            let contents = io.read_bucket(&slot.key).await.unwrap();
            assert!(!contents.is_empty() || hub.bucket_slots().len() == 1);
        }
    }

    #[tokio::test]
    async fn test_append_strategy_never_backfills() {
        let io = test_io();
        let mut hub = Hub::empty(small_config());
        let spec = DomainSpec::new(
            "events",
            StorageStrategy::Append,
            SchemaDescriptor { version: 1, shape: json!(["payload"]) },
        );
        hub.reconcile(&[spec], &Migrations::new(), &io).await.unwrap();

        // Fill past one bucket, then shrink an early item; the freed
        // space must not attract new inserts.
        for i in 0..20 {
            let payload = "x".repeat(40);
            hub.put_item("events", &format!("e{i}"), vec![json!(payload)], &io)
                .await
                .unwrap();
        }
        let buckets_before = hub.bucket_slots().len();
        assert!(buckets_before > 1);

        hub.put_item("events", "e0", vec![json!("tiny")], &io).await.unwrap();
        hub.put_item("events", "new", vec![json!("y".repeat(40))], &io).await.unwrap();

        let last = *hub.state.domain_buckets[0].last().unwrap();
        let code = hub.item_code("events", "new").unwrap();
        assert_eq!(hub.state.locations[code as usize], Some(last));
    }

    #[tokio::test]
    async fn test_index_tracks_puts_updates_and_removes() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        let a = hub.put_item("chains", "hub", vec![json!("hub"), json!(118)], &io).await.unwrap();
        let b = hub.put_item("chains", "osmo", vec![json!("osmo"), json!(118)], &io).await.unwrap();
        hub.put_item("chains", "eth", vec![json!("eth"), json!(60)], &io).await.unwrap();

        assert_eq!(hub.scan_index("by_coin", "118"), Some(&[a, b][..]));

        // Update moves the entry between values.
        hub.put_item("chains", "osmo", vec![json!("osmo"), json!(60)], &io).await.unwrap();
        assert_eq!(hub.scan_index("by_coin", "118"), Some(&[a][..]));
        assert!(hub.scan_index("by_coin", "60").unwrap().contains(&b));

        hub.remove_item("chains", "hub", &io).await.unwrap();
        assert_eq!(hub.scan_index("by_coin", "118"), None);
        assert!(hub.get_index("by_coin").is_some());
        assert!(hub.get_index("no_such_index").is_none());
    }

    #[tokio::test]
    async fn test_index_lookup_with_ident_pattern() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;

        hub.put_item("chains", "cosmos/main", vec![json!("a"), json!(7)], &io).await.unwrap();
        hub.put_item("chains", "cosmos/test", vec![json!("b"), json!(7)], &io).await.unwrap();
        hub.put_item("chains", "other", vec![json!("c"), json!(7)], &io).await.unwrap();

        let all = hub.find_codes_in_index("by_coin", "7", None);
        assert_eq!(all.len(), 3);

        let pattern = IdentPattern::regex(":cosmos/").unwrap();
        let idents = hub.find_idents_in_index("by_coin", "7", Some(&pattern));
        assert_eq!(idents.len(), 2);
        assert!(idents.iter().all(|i| i.contains(":cosmos/")));
    }

    #[tokio::test]
    async fn test_hub_survives_serialization() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        hub.put_item("chains", "b", vec![json!("b"), json!(2)], &io).await.unwrap();
        hub.remove_item("chains", "a", &io).await.unwrap();

        let bytes = hub.to_bytes().unwrap();
        let mut reloaded = Hub::load(&bytes, &Migrations::new(), small_config()).unwrap();
        reloaded
            .reconcile(&[chain_spec()], &Migrations::new(), &io)
            .await
            .unwrap();

        assert_eq!(reloaded.item_count(), 1);
        assert_eq!(
            reloaded.get_item("chains", "b", &io).await.unwrap(),
            Some(vec![json!("b"), json!(2)])
        );
        // The freed slot is still the reuse target after reload.
        let code_a = hub
            .state
            .items
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .unwrap();
        let (reused, existed) = reloaded.add_item_key(0, "c");
        assert!(!existed);
        assert_eq!(reused as usize, code_a);
    }

    #[tokio::test]
    async fn test_future_db_version_is_refused() {
        let bytes = serde_json::to_vec(&json!({ "db_version": DB_VERSION + 1 })).unwrap();
        let err = Hub::load(&bytes, &Migrations::new(), small_config()).unwrap_err();
        assert!(matches!(
            err,
            VaultError::ClientBehind { storage, client }
                if storage == DB_VERSION + 1 && client == DB_VERSION
        ));
    }

    #[tokio::test]
    async fn test_db_migration_gap_requires_handler() {
        let mut hub = Hub::empty(small_config());
        hub.state.db_version = 0;
        let bytes = hub.to_bytes().unwrap();

        let err = Hub::load(&bytes, &Migrations::new(), small_config()).unwrap_err();
        assert!(matches!(err, VaultError::MissingMigration { from: 0, to: 1 }));

        let mut migrations = Migrations::new();
        migrations.register_db(0, Box::new(|_value| Ok(())));
        let hub = Hub::load(&bytes, &migrations, small_config()).unwrap();
        assert_eq!(hub.state.db_version, DB_VERSION);
    }

    #[tokio::test]
    async fn test_misaligned_hub_tables_are_corruption() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();

        // An item slot with no matching location entry must be refused
        // at load time, not crash the first lookup.
        hub.state.items.push(Some("!:stray".into()));
        let bytes = hub.to_bytes().unwrap();

        let err = Hub::load(&bytes, &Migrations::new(), small_config()).unwrap_err();
        assert!(matches!(err, VaultError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_dangling_bucket_reference_is_corruption() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        let code = hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();

        hub.state.locations[code as usize] = Some(hub.state.buckets.len() + 5);
        let bytes = hub.to_bytes().unwrap();

        let err = Hub::load(&bytes, &Migrations::new(), small_config()).unwrap_err();
        assert!(matches!(err, VaultError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_schema_migration_rewrites_buckets() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        hub.put_item("chains", "b", vec![json!("b"), json!(2)], &io).await.unwrap();

        let v2 = DomainSpec::new(
            "chains",
            StorageStrategy::Default,
            SchemaDescriptor {
                version: 2,
                shape: json!(["name", "coin_type", "testnet"]),
            },
        )
        .with_index("by_coin", 1);

        let mut migrations = Migrations::new();
        migrations.register_schema(
            "chains",
            1,
            Box::new(|mut tuple| {
                tuple.push(json!(false));
                Ok(tuple)
            }),
        );

        hub.reconcile(&[v2], &migrations, &io).await.unwrap();
        assert_eq!(
            hub.get_item("chains", "a", &io).await.unwrap(),
            Some(vec![json!("a"), json!(1), json!(false)])
        );
    }

    #[tokio::test]
    async fn test_schema_drift_without_migration_is_fatal() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();

        let v2 = DomainSpec::new(
            "chains",
            StorageStrategy::Default,
            SchemaDescriptor { version: 2, shape: json!(["name", "coin_type", "testnet"]) },
        );
        let err = hub.reconcile(&[v2], &Migrations::new(), &io).await.unwrap_err();
        assert!(matches!(err, VaultError::Schema { .. }));

        // Same version, different shape: no gap to bridge.
        let drifted = DomainSpec::new(
            "chains",
            StorageStrategy::Default,
            SchemaDescriptor { version: 1, shape: json!(["renamed"]) },
        );
        let err = hub.reconcile(&[drifted], &Migrations::new(), &io).await.unwrap_err();
        assert!(matches!(err, VaultError::Schema { .. }));
    }

    #[tokio::test]
    async fn test_rotate_buckets_keeps_content() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        hub.put_item("chains", "a", vec![json!("a"), json!(1)], &io).await.unwrap();
        hub.put_item("chains", "b", vec![json!("b"), json!(2)], &io).await.unwrap();

        let keys_before: Vec<String> =
            hub.bucket_slots().iter().map(|s| s.key.clone()).collect();
        let rotated = hub.rotate_buckets(&io).await.unwrap();
        assert_eq!(rotated, keys_before.len());

        for (slot, old) in hub.bucket_slots().iter().zip(&keys_before) {
            assert_ne!(&slot.key, old);
            assert!(io.store().get(old).await.unwrap().is_none());
        }
        assert_eq!(
            hub.get_item("chains", "a", &io).await.unwrap(),
            Some(vec![json!("a"), json!(1)])
        );
    }

    #[tokio::test]
    async fn test_item_entries_lists_everything_once() {
        let io = test_io();
        let mut hub = fresh_hub(&io).await;
        for i in 0..10 {
            hub.put_item("chains", &format!("c{i}"), vec![json!(i), json!(i)], &io)
                .await
                .unwrap();
        }
        let entries = hub.item_entries(&io).await.unwrap();
        assert_eq!(entries.len(), 10);
        let codes: std::collections::HashSet<u64> = entries.iter().map(|(_, c, _)| *c).collect();
        assert_eq!(codes.len(), 10);
    }
}
