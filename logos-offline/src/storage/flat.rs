//! Flat backend: one serialized container per collection.
//!
//! Layout inside the [`KeyValueStore`]:
//! - `<ns>:<collection>` : JSON array of entities (compressed above threshold)
//! - `<ns>:__blob:<id>`  : base64 blob bytes, never compressed
//!
//! There is no native secondary index: every filtered read deserializes the
//! whole container and filters in memory. Writes rewrite the container
//! synchronously and are not rolled back on partial failure. Commits hold
//! `commit_lock` across load, apply and save.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::codec::ValueCodec;
use crate::entity::Entity;
use crate::storage::backend::{
    matches_any, Backend, BackendStats, CollectionWrite, CommitCounters, WriteOp,
};
use crate::storage::config::{BackendMode, StoreConfig};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::kv::{FlatError, KeyValueStore};

pub struct FlatBackend {
    kv: Arc<dyn KeyValueStore>,
    config: StoreConfig,
    codec: ValueCodec,
    counters: CommitCounters,
    commit_lock: Mutex<()>,
}

impl FlatBackend {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: StoreConfig) -> Self {
        let codec = ValueCodec::new(config.compression_threshold);
        Self {
            kv,
            config,
            codec,
            counters: CommitCounters::default(),
            commit_lock: Mutex::new(()),
        }
    }

    fn check(&self, collection: &str) -> StoreResult<()> {
        if self.config.catalog.contains(collection) {
            Ok(())
        } else {
            Err(StoreError::UnknownCollection(collection.to_string()))
        }
    }

    /// Deserialize a whole collection; corruption degrades to empty.
    fn load(&self, collection: &str) -> StoreResult<Vec<Entity>> {
        let key = self.config.collection_key(collection);
        match self.kv.get(&key)? {
            Some(stored) => Ok(self.codec.decode_or(&key, &stored, Vec::new())),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, collection: &str, entities: &[Entity]) -> StoreResult<()> {
        let key = self.config.collection_key(collection);
        let encoded = self.codec.encode(entities)?;
        self.kv.set(&key, &encoded)?;
        Ok(())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.config.catalog
    }
}

fn apply(entities: &mut Vec<Entity>, op: &WriteOp) {
    match op {
        WriteOp::Put(entity) => match entities.iter_mut().find(|e| e.id == entity.id) {
            Some(slot) => *slot = entity.clone(),
            None => entities.push(entity.clone()),
        },
        WriteOp::Delete(id) => entities.retain(|e| &e.id != id),
    }
}

impl Backend for FlatBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Flat
    }

    fn buffers_writes(&self) -> bool {
        false
    }

    fn get_all(&self, collection: &str) -> StoreResult<Vec<Entity>> {
        self.check(collection)?;
        self.load(collection)
    }

    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Entity>> {
        self.check(collection)?;
        Ok(self.load(collection)?.into_iter().find(|e| e.id == id))
    }

    fn get_by_index(
        &self,
        collection: &str,
        attribute: &str,
        values: &[Value],
    ) -> StoreResult<Vec<Entity>> {
        self.check(collection)?;
        Ok(self
            .load(collection)?
            .into_iter()
            .filter(|e| matches_any(e, attribute, values))
            .collect())
    }

    fn get_page(&self, collection: &str, offset: usize, limit: usize) -> StoreResult<Vec<Entity>> {
        self.check(collection)?;
        Ok(self
            .load(collection)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn count(&self, collection: &str) -> StoreResult<usize> {
        self.check(collection)?;
        Ok(self.load(collection)?.len())
    }

    fn commit(&self, writes: &[CollectionWrite]) -> StoreResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.commit_lock.lock().map_err(|_| FlatError::Poisoned)?;
        // Touched collections in first-touch order, each loaded once
        let mut order: Vec<&str> = Vec::new();
        let mut loaded: FxHashMap<&str, Vec<Entity>> = FxHashMap::default();
        for write in writes {
            let name = write.collection.as_str();
            if !loaded.contains_key(name) {
                self.check(name)?;
                loaded.insert(name, self.load(name)?);
                order.push(name);
            }
            if let Some(entities) = loaded.get_mut(name) {
                apply(entities, &write.op);
            }
        }
        for name in order {
            if let Some(entities) = loaded.get(name) {
                self.save(name, entities)?;
            }
        }
        self.counters.record(writes.len());
        Ok(())
    }

    fn put_blob(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.kv.set(&self.config.blob_key(id), &STANDARD.encode(data))?;
        Ok(())
    }

    fn get_blob(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = self.config.blob_key(id);
        match self.kv.get(&key)? {
            Some(text) => match STANDARD.decode(text.as_bytes()) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) => {
                    log::error!("Discarding corrupted blob at '{key}': {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn delete_blob(&self, id: &str) -> StoreResult<()> {
        self.kv.remove(&self.config.blob_key(id))?;
        Ok(())
    }

    fn blob_ids(&self) -> StoreResult<Vec<String>> {
        let prefix = self.config.blob_prefix();
        Ok(self
            .kv
            .keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CollectionDef;
    use crate::storage::kv::MemoryKv;
    use serde_json::json;

    fn backend() -> (Arc<MemoryKv>, FlatBackend) {
        let kv = Arc::new(MemoryKv::new());
        let config = StoreConfig {
            catalog: Catalog::new(vec![
                CollectionDef::new("cases").with_index("status"),
                CollectionDef::new("motions"),
            ]),
            ..StoreConfig::for_testing("/unused")
        };
        (kv.clone(), FlatBackend::new(kv, config))
    }

    #[test]
    fn test_put_get_delete() {
        let (_, flat) = backend();
        let c1 = Entity::new("c1").with("title", "Smith v. Jones");
        flat.commit(&[CollectionWrite::put("cases", c1.clone())]).unwrap();
        assert_eq!(flat.get("cases", "c1").unwrap(), Some(c1));
        assert_eq!(flat.count("cases").unwrap(), 1);

        flat.commit(&[CollectionWrite::delete("cases", "c1")]).unwrap();
        assert_eq!(flat.get("cases", "c1").unwrap(), None);
        assert_eq!(flat.count("cases").unwrap(), 0);
    }

    #[test]
    fn test_put_replaces_in_place() {
        let (_, flat) = backend();
        flat.commit(&[
            CollectionWrite::put("cases", Entity::new("a").with("v", 1)),
            CollectionWrite::put("cases", Entity::new("b").with("v", 1)),
            CollectionWrite::put("cases", Entity::new("a").with("v", 2)),
        ])
        .unwrap();
        let all = flat.get_all("cases").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].get("v"), Some(json!(2)));
    }

    #[test]
    fn test_filter_by_index_in_memory() {
        let (_, flat) = backend();
        flat.commit(&[
            CollectionWrite::put("cases", Entity::new("a").with("status", "open")),
            CollectionWrite::put("cases", Entity::new("b").with("status", "closed")),
            CollectionWrite::put("cases", Entity::new("c").with("status", "open")),
        ])
        .unwrap();
        let open = flat.get_by_index("cases", "status", &[json!("open")]).unwrap();
        assert_eq!(open.len(), 2);
        let both = flat
            .get_by_index("cases", "status", &[json!("open"), json!("closed")])
            .unwrap();
        assert_eq!(both.len(), 3);
    }

    #[test]
    fn test_one_commit_per_batch() {
        let (_, flat) = backend();
        let writes: Vec<_> = (0..10)
            .map(|i| CollectionWrite::put("motions", Entity::new(format!("m{i}"))))
            .collect();
        flat.commit(&writes).unwrap();
        assert_eq!(flat.stats().transactions_committed, 1);
        assert_eq!(flat.stats().operations_committed, 10);
    }

    #[test]
    fn test_unknown_collection() {
        let (_, flat) = backend();
        assert!(matches!(
            flat.get_all("nope"),
            Err(StoreError::UnknownCollection(_))
        ));
        assert!(flat
            .commit(&[CollectionWrite::put("nope", Entity::new("x"))])
            .is_err());
    }

    #[test]
    fn test_corrupted_container_reads_empty() {
        let (kv, flat) = backend();
        kv.set("logos:cases", "not json and not compressed").unwrap();
        assert!(flat.get_all("cases").unwrap().is_empty());
        assert_eq!(flat.get("cases", "x").unwrap(), None);
    }

    #[test]
    fn test_page_slices() {
        let (_, flat) = backend();
        let writes: Vec<_> = (0..7)
            .map(|i| CollectionWrite::put("cases", Entity::new(format!("c{i}"))))
            .collect();
        flat.commit(&writes).unwrap();
        let page = flat.get_page("cases", 5, 5).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "c5");
    }

    #[test]
    fn test_concurrent_commits_keep_every_write() {
        let (_, flat) = backend();
        let flat = Arc::new(flat);
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let flat = Arc::clone(&flat);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("c{t}-{i}");
                        flat.commit(&[CollectionWrite::put("cases", Entity::new(id))])
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(flat.count("cases").unwrap(), 200);
        assert_eq!(flat.stats().transactions_committed, 200);
    }

    #[test]
    fn test_blobs() {
        let (_, flat) = backend();
        flat.put_blob("f1", &[0, 159, 146, 150]).unwrap();
        assert_eq!(flat.get_blob("f1").unwrap(), Some(vec![0, 159, 146, 150]));
        assert_eq!(flat.blob_ids().unwrap(), vec!["f1".to_string()]);
        flat.delete_blob("f1").unwrap();
        assert_eq!(flat.get_blob("f1").unwrap(), None);
    }
}
