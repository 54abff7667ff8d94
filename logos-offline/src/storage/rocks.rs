//! RocksDB-backed Structured backend.
//!
//! Column families:
//! - `records`: entities as JSON, keyed by `<collection>\0<id>`
//! - `indexes`: secondary index entries, keyed by
//!   `<collection>\0<attribute>\0<json value>\0<id>` with empty values
//! - `blobs`  : raw binary attachments keyed by id
//! - `meta`   : schema metadata (bincode)
//!
//! Every coalesced batch becomes one `WriteBatch`, so a flush commits or
//! fails as a unit. Index entries are rewritten in the same batch as the
//! records they describe.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::SystemTime;

use crate::catalog::{Catalog, CollectionDef};
use crate::entity::Entity;
use crate::storage::backend::{
    matches_any, Backend, BackendStats, CollectionWrite, CommitCounters, WriteOp,
};
use crate::storage::config::{BackendMode, StoreConfig};
use crate::storage::error::{StoreError, StoreResult};

/// Column family names.
const CF_RECORDS: &str = "records";
const CF_INDEXES: &str = "indexes";
const CF_BLOBS: &str = "blobs";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_INDEXES, CF_BLOBS, CF_META];

/// Key of the schema record in `meta`.
const SCHEMA_KEY: &[u8] = b"schema";

/// On-disk layout version understood by this build.
pub const STORE_FORMAT_VERSION: u32 = 1;

const SEP: u8 = 0;

/// Schema stored alongside the data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaMetadata {
    /// Layout version that wrote this database
    pub format_version: u32,
    /// Bumped whenever collections or indexes are added
    pub schema_version: u64,
    /// `(collection, indexed attributes)` pairs known to the database
    pub collections: Vec<(String, Vec<String>)>,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last upgrade timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SchemaMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            format_version: STORE_FORMAT_VERSION,
            schema_version: 0,
            collections: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DecodeCorruption(e.to_string()))?;
        Ok(meta)
    }

    fn indexes_of(&self, collection: &str) -> Option<&[String]> {
        self.collections
            .iter()
            .find(|(name, _)| name == collection)
            .map(|(_, indexes)| indexes.as_slice())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed Structured backend.
pub struct RocksBackend {
    /// RocksDB instance (single-threaded mode, writes serialized by the store)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    schema: SchemaMetadata,
    counters: CommitCounters,
}

impl RocksBackend {
    /// Open the database, creating column families and upgrading the schema.
    ///
    /// Any failure is reported as [`StoreError::BackendUnavailable`] so the
    /// store can fall back to Flat.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let path = config.structured_path();
        let db = Self::open_db(&path, &config)
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        let mut backend = Self {
            db,
            config,
            schema: SchemaMetadata::new(),
            counters: CommitCounters::default(),
        };
        backend.schema = backend
            .ensure_schema()
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        log::info!(
            "Structured backend open at {} (schema v{}, {} collections)",
            path.display(),
            backend.schema.schema_version,
            backend.schema.collections.len()
        );
        Ok(backend)
    }

    fn open_db(path: &Path, config: &StoreConfig) -> StoreResult<DBWithThreadMode<SingleThreaded>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        // One cache shared by every column family
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, config, &cache)))
            .collect();

        Ok(DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            path,
            cf_descriptors,
        )?)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS | CF_INDEXES => {
                // Many small writes, prefix-scanned per collection
                opts.set_max_write_buffer_number(4);
            }
            CF_BLOBS => {
                // Large opaque values, point lookups only
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Load the stored schema and bring it up to the configured catalog.
    ///
    /// Collections and indexes are only ever added: new indexes are
    /// back-filled from existing records, nothing is dropped.
    fn ensure_schema(&self) -> StoreResult<SchemaMetadata> {
        let cf_meta = self.cf(CF_META)?;
        let mut schema = match self.db.get_cf(cf_meta, SCHEMA_KEY)? {
            Some(bytes) => SchemaMetadata::decode(&bytes)?,
            None => SchemaMetadata::new(),
        };

        if schema.format_version > STORE_FORMAT_VERSION {
            return Err(StoreError::BackendUnavailable(format!(
                "database format v{} is newer than supported v{STORE_FORMAT_VERSION}",
                schema.format_version
            )));
        }

        let mut changed = false;
        let mut batch = WriteBatch::default();
        for def in self.config.catalog.collections() {
            let known: Vec<String> = schema
                .indexes_of(&def.name)
                .map(<[String]>::to_vec)
                .unwrap_or_default();
            let missing: Vec<&String> =
                def.indexes.iter().filter(|i| !known.contains(i)).collect();

            if schema.indexes_of(&def.name).is_none() {
                schema.collections.push((def.name.clone(), Vec::new()));
                changed = true;
            }
            if missing.is_empty() {
                continue;
            }

            let backfilled = self.backfill_indexes(&mut batch, &def.name, &missing)?;
            log::info!(
                "Back-filled {backfilled} index entries for '{}' ({} new indexes)",
                def.name,
                missing.len()
            );
            if let Some((_, indexes)) = schema.collections.iter_mut().find(|(n, _)| *n == def.name)
            {
                indexes.extend(missing.into_iter().cloned());
            }
            changed = true;
        }

        if changed {
            schema.schema_version += 1;
            schema.updated_at = now_secs();
            batch.put_cf(cf_meta, SCHEMA_KEY, schema.encode()?);
            self.db.write(batch)?;
        }
        Ok(schema)
    }

    fn backfill_indexes(
        &self,
        batch: &mut WriteBatch,
        collection: &str,
        attributes: &[&String],
    ) -> StoreResult<usize> {
        let cf_indexes = self.cf(CF_INDEXES)?;
        let mut written = 0;
        for entity in self.scan(collection)? {
            for attribute in attributes {
                if let Some(value) = indexable(&entity, attribute) {
                    batch.put_cf(cf_indexes, index_key(collection, attribute, &value, &entity.id), b"");
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    /// Current schema metadata.
    pub fn schema(&self) -> &SchemaMetadata {
        &self.schema
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn def(&self, collection: &str) -> StoreResult<&CollectionDef> {
        self.config
            .catalog
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    /// Visit every `(key, value)` in `cf` whose key starts with `prefix`.
    fn for_each_prefixed<F>(&self, cf_name: &str, prefix: &[u8], mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// All records of a collection in key order; corrupted rows are skipped.
    fn scan(&self, collection: &str) -> StoreResult<Vec<Entity>> {
        let mut out = Vec::new();
        self.for_each_prefixed(CF_RECORDS, &collection_prefix(collection), |key, value| {
            if let Some(entity) = decode_record(key, value) {
                out.push(entity);
            }
            true
        })?;
        Ok(out)
    }

    fn read(&self, collection: &str, id: &str) -> StoreResult<Option<Entity>> {
        let key = record_key(collection, id);
        Ok(self
            .db
            .get_cf(self.cf(CF_RECORDS)?, &key)?
            .and_then(|value| decode_record(&key, &value)))
    }
}

impl Backend for RocksBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Structured
    }

    fn buffers_writes(&self) -> bool {
        true
    }

    fn get_all(&self, collection: &str) -> StoreResult<Vec<Entity>> {
        self.def(collection)?;
        self.scan(collection)
    }

    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Entity>> {
        self.def(collection)?;
        self.read(collection, id)
    }

    fn get_by_index(
        &self,
        collection: &str,
        attribute: &str,
        values: &[Value],
    ) -> StoreResult<Vec<Entity>> {
        let def = self.def(collection)?;
        if !def.has_index(attribute) {
            return Ok(self
                .scan(collection)?
                .into_iter()
                .filter(|e| matches_any(e, attribute, values))
                .collect());
        }

        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut out = Vec::new();
        for value in values {
            let prefix = index_value_prefix(collection, attribute, value);
            let mut ids = Vec::new();
            self.for_each_prefixed(CF_INDEXES, &prefix, |key, _| {
                if let Ok(id) = std::str::from_utf8(&key[prefix.len()..]) {
                    ids.push(id.to_string());
                }
                true
            })?;
            for id in ids {
                if seen.insert(id.clone()) {
                    if let Some(entity) = self.read(collection, &id)? {
                        out.push(entity);
                    }
                }
            }
        }
        Ok(out)
    }

    fn get_page(&self, collection: &str, offset: usize, limit: usize) -> StoreResult<Vec<Entity>> {
        self.def(collection)?;
        let mut out = Vec::with_capacity(limit.min(1024));
        let mut skipped = 0;
        if limit == 0 {
            return Ok(out);
        }
        self.for_each_prefixed(CF_RECORDS, &collection_prefix(collection), |key, value| {
            if skipped < offset {
                skipped += 1;
                return true;
            }
            if let Some(entity) = decode_record(key, value) {
                out.push(entity);
            }
            out.len() < limit
        })?;
        Ok(out)
    }

    fn count(&self, collection: &str) -> StoreResult<usize> {
        self.def(collection)?;
        let mut count = 0;
        self.for_each_prefixed(CF_RECORDS, &collection_prefix(collection), |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    fn commit(&self, writes: &[CollectionWrite]) -> StoreResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_indexes = self.cf(CF_INDEXES)?;

        // Latest state per record within this batch, so repeated writes to
        // one id clean up each other's index entries.
        let mut overlay: FxHashMap<(&str, &str), Option<&Entity>> = FxHashMap::default();
        let mut stored: FxHashMap<(&str, &str), Option<Entity>> = FxHashMap::default();
        let mut batch = WriteBatch::default();

        for write in writes {
            let collection = write.collection.as_str();
            let def = self.def(collection)?;
            let id = write.op.id();
            let slot = (collection, id);

            let previous: Option<Entity> = match overlay.get(&slot) {
                Some(latest) => latest.cloned(),
                None => {
                    if !stored.contains_key(&slot) {
                        stored.insert(slot, self.read(collection, id)?);
                    }
                    stored.get(&slot).cloned().flatten()
                }
            };
            if let Some(previous) = &previous {
                for attribute in &def.indexes {
                    if let Some(value) = indexable(previous, attribute) {
                        batch.delete_cf(cf_indexes, index_key(collection, attribute, &value, id));
                    }
                }
            }

            let key = record_key(collection, id);
            match &write.op {
                WriteOp::Put(entity) => {
                    batch.put_cf(cf_records, &key, serde_json::to_vec(entity)?);
                    for attribute in &def.indexes {
                        if let Some(value) = indexable(entity, attribute) {
                            batch.put_cf(cf_indexes, index_key(collection, attribute, &value, id), b"");
                        }
                    }
                    overlay.insert(slot, Some(entity));
                }
                WriteOp::Delete(_) => {
                    batch.delete_cf(cf_records, &key);
                    overlay.insert(slot, None);
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        self.counters.record(writes.len());
        Ok(())
    }

    fn put_blob(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.db.put_cf(self.cf(CF_BLOBS)?, id.as_bytes(), data)?;
        Ok(())
    }

    fn get_blob(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(CF_BLOBS)?, id.as_bytes())?)
    }

    fn delete_blob(&self, id: &str) -> StoreResult<()> {
        self.db.delete_cf(self.cf(CF_BLOBS)?, id.as_bytes())?;
        Ok(())
    }

    fn blob_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        self.for_each_prefixed(CF_BLOBS, &[], |key, _| {
            if let Ok(id) = std::str::from_utf8(key) {
                ids.push(id.to_string());
            }
            true
        })?;
        Ok(ids)
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}

impl RocksBackend {
    /// Collections present in the stored schema, for diagnostics.
    pub fn known_collections(&self) -> Catalog {
        Catalog::new(
            self.schema
                .collections
                .iter()
                .map(|(name, indexes)| CollectionDef {
                    name: name.clone(),
                    indexes: indexes.clone(),
                })
                .collect(),
        )
    }
}

// ─── Key encoding ─────────────────────────────────────────────────────────

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + 1);
    key.extend_from_slice(collection.as_bytes());
    key.push(SEP);
    key
}

/// Record key: `<collection>\0<id>`.
fn record_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = collection_prefix(collection);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Index prefix for one value: `<collection>\0<attribute>\0<json>\0`.
///
/// JSON text never contains a raw NUL, so the separator is unambiguous.
fn index_value_prefix(collection: &str, attribute: &str, value: &Value) -> Vec<u8> {
    let mut key = collection_prefix(collection);
    key.extend_from_slice(attribute.as_bytes());
    key.push(SEP);
    key.extend_from_slice(value.to_string().as_bytes());
    key.push(SEP);
    key
}

fn index_key(collection: &str, attribute: &str, value: &Value, id: &str) -> Vec<u8> {
    let mut key = index_value_prefix(collection, attribute, value);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Null and missing attributes are not indexed.
fn indexable(entity: &Entity, attribute: &str) -> Option<Value> {
    entity.get(attribute).filter(|v| !v.is_null())
}

fn decode_record(key: &[u8], value: &[u8]) -> Option<Entity> {
    match serde_json::from_slice(value) {
        Ok(entity) => Some(entity),
        Err(e) => {
            log::error!(
                "Skipping corrupted record '{}': {e}",
                String::from_utf8_lossy(key).replace('\0', "/")
            );
            None
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
