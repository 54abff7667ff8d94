//! `PersistentStore`: one CRUD surface over whichever backend is usable.
//!
//! Lifecycle:
//! ```text
//!   first call ──► initialize()
//!                    │
//!                    ├─ flat marker says "flat"? ──────────► FlatBackend
//!                    ├─ preferred Structured ─► RocksBackend::open
//!                    │                            ├─ ok ───► RocksBackend + WriteBuffer
//!                    │                            └─ err ──► record marker, FlatBackend
//!                    └─ preferred Flat ────────────────────► FlatBackend
//!
//!   then, in the background: one deferred build per configured SortedIndex
//! ```
//!
//! Initialization is shared: concurrent first callers wait on the same lock
//! and all observe the same backend. The handle can later be rebuilt in place
//! with [`PersistentStore::switch_mode`] or [`PersistentStore::downgrade`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::entity::Entity;
use crate::index::{fold_key, SortedIndex};
use crate::storage::backend::{Backend, BackendStats, CollectionWrite};
use crate::storage::buffer::WriteBuffer;
use crate::storage::config::{BackendMode, SortedIndexSpec, StoreConfig};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::flat::FlatBackend;
use crate::storage::kv::{DirectoryKv, KeyValueStore};
use crate::storage::rocks::RocksBackend;

/// The backend in use plus its write buffer, if it buffers.
#[derive(Clone)]
struct Active {
    backend: Arc<dyn Backend>,
    buffer: Option<WriteBuffer>,
}

impl Active {
    fn new(backend: Arc<dyn Backend>, config: &StoreConfig) -> Self {
        let buffer = backend
            .buffers_writes()
            .then(|| WriteBuffer::new(Arc::clone(&backend), config.flush_delay));
        Self { backend, buffer }
    }

    async fn flush(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.flush().await;
        }
    }
}

/// Mode preference persisted in flat storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeRecord {
    mode: String,
    #[serde(default)]
    reason: Option<String>,
}

// ─── Sorted indexes ──────────────────────────────────────────────────────

enum SortedState {
    /// Build scheduled; puts seen meanwhile are replayed once it lands
    Building { pending: Vec<(String, String)> },
    Ready(SortedIndex),
}

struct SortedSlot {
    spec: SortedIndexSpec,
    state: RwLock<SortedState>,
    /// Bumped on every rebuild so stale builds don't overwrite newer ones
    generation: AtomicU64,
}

/// Key an entity is filed under, if its attribute is a string or number.
fn sort_key(entity: &Entity, attribute: &str) -> Option<String> {
    match entity.get(attribute)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn matches_key(entity: &Entity, attribute: &str, folded: &str) -> bool {
    sort_key(entity, attribute).is_some_and(|k| fold_key(&k) == folded)
}

// ─── Store ───────────────────────────────────────────────────────────────

/// Persistent record store over the Structured or Flat backend.
pub struct PersistentStore {
    config: StoreConfig,
    flat_kv: Arc<dyn KeyValueStore>,
    active: Mutex<Option<Active>>,
    sorted: Vec<Arc<SortedSlot>>,
}

impl PersistentStore {
    /// Store rooted at `config.path`; flat data goes to `config.flat_path()`.
    ///
    /// Nothing is probed until the first operation.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let kv = DirectoryKv::open(config.flat_path())?;
        Ok(Self::with_flat_storage(config, Arc::new(kv)))
    }

    /// Store using `kv` as its flat storage.
    pub fn with_flat_storage(config: StoreConfig, kv: Arc<dyn KeyValueStore>) -> Self {
        let sorted = config
            .sorted_indexes
            .iter()
            .map(|spec| {
                Arc::new(SortedSlot {
                    spec: spec.clone(),
                    state: RwLock::new(SortedState::Building {
                        pending: Vec::new(),
                    }),
                    generation: AtomicU64::new(0),
                })
            })
            .collect();
        Self {
            config,
            flat_kv: kv,
            active: Mutex::new(None),
            sorted,
        }
    }

    /// Store already bound to `backend`, skipping detection.
    pub async fn with_backend(
        config: StoreConfig,
        kv: Arc<dyn KeyValueStore>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let store = Self::with_flat_storage(config, kv);
        let active = Active::new(backend, &store.config);
        *store.active.lock().await = Some(active.clone());
        store.schedule_sorted_builds(&active).await;
        store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Flat storage shared with the mutation queue.
    pub fn flat_storage(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.flat_kv)
    }

    /// Select a backend if none is active yet. Safe to call repeatedly.
    pub async fn initialize(&self) -> StoreResult<BackendMode> {
        Ok(self.active().await?.backend.mode())
    }

    /// Backend in use, initializing on first call.
    pub async fn mode(&self) -> StoreResult<BackendMode> {
        self.initialize().await
    }

    async fn active(&self) -> StoreResult<Active> {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            return Ok(active.clone());
        }
        let active = self.build_active(self.remembered_mode())?;
        *guard = Some(active.clone());
        drop(guard);

        self.schedule_sorted_builds(&active).await;
        Ok(active)
    }

    fn remembered_mode(&self) -> BackendMode {
        let key = self.config.mode_key();
        match self.flat_kv.get(&key) {
            Ok(Some(text)) => match serde_json::from_str::<ModeRecord>(&text) {
                Ok(record) if record.mode == BackendMode::Flat.to_string() => BackendMode::Flat,
                Ok(record) if record.mode == BackendMode::Structured.to_string() => {
                    BackendMode::Structured
                }
                Ok(_) | Err(_) => {
                    log::warn!("Ignoring unreadable backend preference at '{key}'");
                    self.config.preferred_mode
                }
            },
            Ok(None) => self.config.preferred_mode,
            Err(e) => {
                log::warn!("Could not read backend preference: {e}");
                self.config.preferred_mode
            }
        }
    }

    fn remember_mode(&self, mode: BackendMode, reason: Option<&str>) -> StoreResult<()> {
        let record = ModeRecord {
            mode: mode.to_string(),
            reason: reason.map(str::to_string),
        };
        self.flat_kv
            .set(&self.config.mode_key(), &serde_json::to_string(&record)?)?;
        Ok(())
    }

    fn flat_backend(&self) -> Arc<dyn Backend> {
        Arc::new(FlatBackend::new(
            Arc::clone(&self.flat_kv),
            self.config.clone(),
        ))
    }

    /// Construct the handle for `mode`; a Structured open failure falls
    /// back to Flat and is remembered for later sessions.
    fn build_active(&self, mode: BackendMode) -> StoreResult<Active> {
        let backend: Arc<dyn Backend> = match mode {
            BackendMode::Flat => self.flat_backend(),
            BackendMode::Structured => match RocksBackend::open(self.config.clone()) {
                Ok(rocks) => Arc::new(rocks),
                Err(e) => {
                    log::warn!("Structured backend unavailable, continuing on flat storage: {e}");
                    self.remember_mode(BackendMode::Flat, Some(&e.to_string()))?;
                    self.flat_backend()
                }
            },
        };
        log::info!("Persistent store using {} backend", backend.mode());
        Ok(Active::new(backend, &self.config))
    }

    /// Commit buffered writes and rebuild the handle on `mode`.
    ///
    /// Records are not migrated between backends. Returns the mode actually
    /// in use, which is Flat if Structured cannot be opened.
    pub async fn switch_mode(&self, mode: BackendMode) -> StoreResult<BackendMode> {
        let mut guard = self.active.lock().await;
        if let Some(current) = guard.as_ref() {
            if current.backend.mode() == mode {
                current.flush().await;
                self.remember_mode(mode, None)?;
                return Ok(mode);
            }
        }
        if let Some(current) = guard.take() {
            current.flush().await;
        }
        self.remember_mode(mode, None)?;

        let active = self.build_active(mode)?;
        let in_use = active.backend.mode();
        *guard = Some(active.clone());
        drop(guard);

        log::info!("Switched persistent store to {in_use} (requested {mode})");
        self.schedule_sorted_builds(&active).await;
        Ok(in_use)
    }

    /// Move the session onto flat storage, carrying every record and blob
    /// across so nothing written before the downgrade is lost.
    pub async fn downgrade(&self, reason: &str) -> StoreResult<()> {
        let mut guard = self.active.lock().await;
        if let Some(current) = guard.as_ref() {
            if current.backend.mode() == BackendMode::Flat {
                return Ok(());
            }
        }

        let flat = self.flat_backend();
        if let Some(current) = guard.take() {
            current.flush().await;
            self.export(current.backend.as_ref(), flat.as_ref());
        }
        self.remember_mode(BackendMode::Flat, Some(reason))?;
        log::warn!("Persistent store downgraded to flat storage: {reason}");

        let active = Active::new(flat, &self.config);
        *guard = Some(active.clone());
        drop(guard);

        self.schedule_sorted_builds(&active).await;
        Ok(())
    }

    /// Best-effort copy of every catalog collection and blob.
    fn export(&self, from: &dyn Backend, to: &dyn Backend) {
        let mut records = 0;
        for name in self.config.catalog.names() {
            match from.get_all(name) {
                Ok(entities) if entities.is_empty() => {}
                Ok(entities) => {
                    records += entities.len();
                    let writes: Vec<_> = entities
                        .into_iter()
                        .map(|e| CollectionWrite::put(name, e))
                        .collect();
                    if let Err(e) = to.commit(&writes) {
                        log::error!("Could not export '{name}' during downgrade: {e}");
                    }
                }
                Err(e) => log::error!("Could not read '{name}' during downgrade: {e}"),
            }
        }

        let mut blobs = 0;
        match from.blob_ids() {
            Ok(ids) => {
                for id in ids {
                    let copied = from
                        .get_blob(&id)
                        .and_then(|data| match data {
                            Some(data) => to.put_blob(&id, &data).map(|_| true),
                            None => Ok(false),
                        });
                    match copied {
                        Ok(true) => blobs += 1,
                        Ok(false) => {}
                        Err(e) => log::error!("Could not export blob '{id}' during downgrade: {e}"),
                    }
                }
            }
            Err(e) => log::error!("Could not list blobs during downgrade: {e}"),
        }
        log::info!("Exported {records} records and {blobs} blobs to flat storage");
    }

    /// Commit everything currently buffered.
    pub async fn flush(&self) -> StoreResult<()> {
        self.active().await?.flush().await;
        Ok(())
    }

    // ─── Reads ───────────────────────────────────────────────────────

    fn check_collection(&self, collection: &str) -> StoreResult<()> {
        if self.config.catalog.contains(collection) {
            Ok(())
        } else {
            Err(StoreError::UnknownCollection(collection.to_string()))
        }
    }

    pub async fn get_all(&self, collection: &str) -> StoreResult<Vec<Entity>> {
        self.active().await?.backend.get_all(collection)
    }

    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Entity>> {
        self.active().await?.backend.get(collection, id)
    }

    /// Records whose `attribute` equals any of `values`.
    pub async fn get_by_index(
        &self,
        collection: &str,
        attribute: &str,
        values: &[Value],
    ) -> StoreResult<Vec<Entity>> {
        self.active()
            .await?
            .backend
            .get_by_index(collection, attribute, values)
    }

    /// Single-value form of [`get_by_index`](Self::get_by_index).
    pub async fn get_by_value(
        &self,
        collection: &str,
        attribute: &str,
        value: impl Into<Value>,
    ) -> StoreResult<Vec<Entity>> {
        self.get_by_index(collection, attribute, &[value.into()]).await
    }

    pub async fn get_page(
        &self,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        self.active()
            .await?
            .backend
            .get_page(collection, offset, limit)
    }

    pub async fn count(&self, collection: &str) -> StoreResult<usize> {
        self.active().await?.backend.count(collection)
    }

    /// Record whose `attribute` equals `key`, ignoring case.
    ///
    /// A built index answers misses directly, since every put is filed in
    /// it. The collection is scanned while the index is building, when no
    /// index is configured, or when the index hit is stale.
    pub async fn find_by_sorted_key(
        &self,
        collection: &str,
        attribute: &str,
        key: &str,
    ) -> StoreResult<Option<Entity>> {
        self.check_collection(collection)?;
        let active = self.active().await?;
        let folded = fold_key(key);

        if let Some(slot) = self.slot(collection, attribute) {
            let hit = match &*slot.state.read().await {
                SortedState::Ready(index) => Some(index.search(&folded).map(str::to_string)),
                SortedState::Building { .. } => None,
            };
            match hit {
                Some(None) => return Ok(None),
                Some(Some(id)) => {
                    if let Some(entity) = active.backend.get(collection, &id)? {
                        if matches_key(&entity, attribute, &folded) {
                            return Ok(Some(entity));
                        }
                    }
                }
                None => {}
            }
        }

        log::debug!("Sorted lookup on {collection}.{attribute} falling back to scan");
        Ok(active
            .backend
            .get_all(collection)?
            .into_iter()
            .find(|e| matches_key(e, attribute, &folded)))
    }

    /// Whether the sorted index on `collection.attribute` has finished building.
    pub async fn sorted_index_ready(&self, collection: &str, attribute: &str) -> bool {
        match self.slot(collection, attribute) {
            Some(slot) => matches!(&*slot.state.read().await, SortedState::Ready(_)),
            None => false,
        }
    }

    // ─── Writes ──────────────────────────────────────────────────────

    /// Store `entity`; resolves once its batch has committed.
    pub async fn put(&self, collection: &str, entity: Entity) -> StoreResult<()> {
        self.check_collection(collection)?;
        let active = self.active().await?;
        // Filed before the write: a Ready index holds every stored key
        self.note_put(collection, &entity).await;
        self.write(&active, CollectionWrite::put(collection, entity))
            .await
    }

    /// Store a JSON object, which must carry a string `id`.
    pub async fn put_value(&self, collection: &str, value: Value) -> StoreResult<()> {
        self.put(collection, Entity::from_value(value)?).await
    }

    /// Store many entities in one pass.
    ///
    /// Buffered backends coalesce them into the same window; flat storage
    /// rewrites the collection once.
    pub async fn bulk_put(&self, collection: &str, entities: Vec<Entity>) -> StoreResult<()> {
        self.check_collection(collection)?;
        if entities.is_empty() {
            return Ok(());
        }
        let active = self.active().await?;
        for entity in &entities {
            self.note_put(collection, entity).await;
        }
        let writes: Vec<_> = entities
            .into_iter()
            .map(|e| CollectionWrite::put(collection, e))
            .collect();

        match &active.buffer {
            Some(buffer) => {
                let completions: Vec<_> = writes.into_iter().map(|w| buffer.enqueue(w)).collect();
                for result in futures_util::future::join_all(completions).await {
                    result.map_err(|_| {
                        StoreError::FlushTransactionFailed("write buffer dropped".into())
                    })??;
                }
            }
            None => active.backend.commit(&writes)?,
        }
        Ok(())
    }

    pub async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.check_collection(collection)?;
        let active = self.active().await?;
        self.write(&active, CollectionWrite::delete(collection, id))
            .await
    }

    async fn write(&self, active: &Active, write: CollectionWrite) -> StoreResult<()> {
        match &active.buffer {
            Some(buffer) => buffer.enqueue(write).await.map_err(|_| {
                StoreError::FlushTransactionFailed("write buffer dropped".into())
            })?,
            None => active.backend.commit(std::slice::from_ref(&write)),
        }
    }

    // ─── Blobs ───────────────────────────────────────────────────────

    /// Store binary content under `id`. Not buffered.
    pub async fn put_file(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.active().await?.backend.put_blob(id, data)
    }

    pub async fn get_file(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.active().await?.backend.get_blob(id)
    }

    pub async fn delete_file(&self, id: &str) -> StoreResult<()> {
        self.active().await?.backend.delete_blob(id)
    }

    // ─── Diagnostics ─────────────────────────────────────────────────

    pub async fn stats(&self) -> StoreResult<BackendStats> {
        Ok(self.active().await?.backend.stats())
    }

    /// Writes waiting in the coalescing buffer.
    pub async fn pending_writes(&self) -> usize {
        match self.active.lock().await.as_ref() {
            Some(Active {
                buffer: Some(buffer),
                ..
            }) => buffer.pending_len(),
            _ => 0,
        }
    }

    // ─── Sorted index maintenance ────────────────────────────────────

    fn slot(&self, collection: &str, attribute: &str) -> Option<&Arc<SortedSlot>> {
        self.sorted
            .iter()
            .find(|s| s.spec.collection == collection && s.spec.attribute == attribute)
    }

    async fn note_put(&self, collection: &str, entity: &Entity) {
        for slot in self.sorted.iter().filter(|s| s.spec.collection == collection) {
            let Some(key) = sort_key(entity, &slot.spec.attribute) else {
                continue;
            };
            match &mut *slot.state.write().await {
                SortedState::Building { pending } => pending.push((key, entity.id.clone())),
                SortedState::Ready(index) => index.insert(&key, entity.id.clone()),
            }
        }
    }

    /// Reset every sorted index and build it off the caller's path.
    async fn schedule_sorted_builds(&self, active: &Active) {
        for slot in &self.sorted {
            let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *slot.state.write().await = SortedState::Building {
                pending: Vec::new(),
            };

            let slot = Arc::clone(slot);
            let backend = Arc::clone(&active.backend);
            tokio::spawn(async move {
                // Let the initializing caller proceed first
                tokio::task::yield_now().await;
                build_sorted(slot, backend, generation).await;
            });
        }
    }
}

async fn build_sorted(slot: Arc<SortedSlot>, backend: Arc<dyn Backend>, generation: u64) {
    let SortedIndexSpec {
        collection,
        attribute,
    } = &slot.spec;

    let entities = match backend.get_all(collection) {
        Ok(entities) => entities,
        Err(e) => {
            log::warn!("Sorted index on {collection}.{attribute} not built: {e}");
            return;
        }
    };

    let mut index = SortedIndex::new();
    for entity in &entities {
        if let Some(key) = sort_key(entity, attribute) {
            index.insert(&key, entity.id.clone());
        }
    }

    let mut state = slot.state.write().await;
    if slot.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    if let SortedState::Building { pending } = &mut *state {
        for (key, id) in pending.drain(..) {
            index.insert(&key, id);
        }
    }
    log::info!(
        "Sorted index on {collection}.{attribute} ready ({} keys)",
        index.len()
    );
    *state = SortedState::Ready(index);
}
