//! Durable FIFO of local mutations awaiting remote sync.
//!
//! The queue lives under one flat key (`<ns>:__mutation_queue`) as a JSON
//! array, compressed above the codec threshold. It never talks to the
//! network: a sync driver `peek`s, attempts transport, then calls
//! `update` or `dequeue`.
//!
//! Every operation loads, edits and saves the list under one async lock,
//! so interleaved callers never lose each other's writes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::codec::{CodecError, ValueCodec};
use crate::storage::{FlatError, KeyValueStore, PersistentStore, StoreConfig};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Mutation queue full ({capacity} entries)")]
    Full { capacity: usize },

    #[error("Queue storage error: {0}")]
    Storage(#[from] FlatError),

    #[error("Queue encoding error: {0}")]
    Codec(#[from] CodecError),
}

/// Sync state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
}

/// One logged local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: Uuid,
    /// Caller-defined operation name, e.g. `UPDATE_CASE`
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    /// Changed fields only, for updates with a known previous version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub status: MutationStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Fields merged into a mutation by [`MutationQueue::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationUpdate {
    pub status: Option<MutationStatus>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the error
    pub last_error: Option<Option<String>>,
}

impl MutationUpdate {
    /// Mark a failed attempt.
    pub fn failed(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            status: Some(MutationStatus::Failed),
            retry_count: Some(retry_count),
            last_error: Some(Some(error.into())),
        }
    }

    pub fn status(status: MutationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Flat key holding the list
    pub key: String,
    /// Serialized lists at or above this length are compressed (default: 1KB)
    pub compression_threshold: usize,
    /// Entries accepted before `enqueue` refuses (default: 10,000)
    pub max_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::for_store(&StoreConfig::default())
    }
}

impl QueueConfig {
    /// Queue sharing a store's namespace and compression threshold.
    pub fn for_store(store: &StoreConfig) -> Self {
        Self {
            key: store.queue_key(),
            compression_threshold: store.compression_threshold,
            max_len: 10_000,
        }
    }
}

pub struct MutationQueue {
    kv: Arc<dyn KeyValueStore>,
    config: QueueConfig,
    codec: ValueCodec,
    lock: Mutex<()>,
}

impl MutationQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        let codec = ValueCodec::new(config.compression_threshold);
        Self {
            kv,
            config,
            codec,
            lock: Mutex::new(()),
        }
    }

    /// Queue persisted in the store's flat storage, whichever backend is active.
    pub fn for_store(store: &PersistentStore) -> Self {
        Self::new(store.flat_storage(), QueueConfig::for_store(store.config()))
    }

    fn load(&self) -> Result<Vec<Mutation>, QueueError> {
        match self.kv.get(&self.config.key)? {
            Some(stored) => Ok(self.codec.decode_or(&self.config.key, &stored, Vec::new())),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, mutations: &[Mutation]) -> Result<(), QueueError> {
        if mutations.is_empty() {
            self.kv.remove(&self.config.key)?;
        } else {
            self.kv.set(&self.config.key, &self.codec.encode(mutations)?)?;
        }
        Ok(())
    }

    /// Append a pending mutation.
    ///
    /// For update kinds with a `previous` payload only the changed fields
    /// are kept as the patch; if nothing changed, nothing is queued and
    /// `None` is returned.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        previous: Option<&Value>,
    ) -> Result<Option<Uuid>, QueueError> {
        let mut patch = None;
        if let Some(previous) = previous.filter(|_| is_update(kind)) {
            match shallow_patch(previous, &payload) {
                Some(fields) if fields.is_empty() => {
                    log::debug!("Skipping {kind}: no fields changed");
                    return Ok(None);
                }
                Some(fields) => patch = Some(Value::Object(fields)),
                None if *previous == payload => {
                    log::debug!("Skipping {kind}: payload unchanged");
                    return Ok(None);
                }
                None => {}
            }
        }

        let _guard = self.lock.lock().await;
        let mut mutations = self.load()?;
        if mutations.len() >= self.config.max_len {
            return Err(QueueError::Full {
                capacity: self.config.max_len,
            });
        }

        let id = Uuid::new_v4();
        mutations.push(Mutation {
            id,
            kind: kind.to_string(),
            payload,
            patch,
            timestamp: now_millis(),
            status: MutationStatus::Pending,
            retry_count: 0,
            last_error: None,
        });
        self.save(&mutations)?;
        Ok(Some(id))
    }

    /// Remove and return the oldest mutation.
    pub async fn dequeue(&self) -> Result<Option<Mutation>, QueueError> {
        let _guard = self.lock.lock().await;
        let mut mutations = self.load()?;
        if mutations.is_empty() {
            return Ok(None);
        }
        let head = mutations.remove(0);
        self.save(&mutations)?;
        Ok(Some(head))
    }

    /// Oldest mutation, left in place.
    pub async fn peek(&self) -> Result<Option<Mutation>, QueueError> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.into_iter().next())
    }

    /// Merge `fields` into mutation `id`. Returns `false` if no such mutation.
    pub async fn update(&self, id: Uuid, fields: MutationUpdate) -> Result<bool, QueueError> {
        let _guard = self.lock.lock().await;
        let mut mutations = self.load()?;
        let Some(mutation) = mutations.iter_mut().find(|m| m.id == id) else {
            log::debug!("Ignoring update for unknown mutation {id}");
            return Ok(false);
        };

        if let Some(status) = fields.status {
            mutation.status = status;
        }
        if let Some(retry_count) = fields.retry_count {
            mutation.retry_count = retry_count;
        }
        if let Some(last_error) = fields.last_error {
            mutation.last_error = last_error;
        }
        self.save(&mutations)?;
        Ok(true)
    }

    pub async fn count(&self) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.count().await? == 0)
    }

    /// Snapshot in FIFO order.
    pub async fn get_all(&self) -> Result<Vec<Mutation>, QueueError> {
        let _guard = self.lock.lock().await;
        self.load()
    }

    pub async fn get_failed(&self) -> Result<Vec<Mutation>, QueueError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|m| m.status == MutationStatus::Failed)
            .collect())
    }

    /// Return every failed mutation to `Pending` with a clean slate.
    pub async fn reset_failed(&self) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().await;
        let mut mutations = self.load()?;
        let mut reset = 0;
        for mutation in mutations
            .iter_mut()
            .filter(|m| m.status == MutationStatus::Failed)
        {
            mutation.status = MutationStatus::Pending;
            mutation.retry_count = 0;
            mutation.last_error = None;
            reset += 1;
        }
        if reset > 0 {
            self.save(&mutations)?;
        }
        Ok(reset)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.kv.remove(&self.config.key)?;
        Ok(())
    }
}

fn is_update(kind: &str) -> bool {
    kind.to_ascii_uppercase().contains("UPDATE")
}

/// Top-level fields of `payload` that differ from `previous`; fields
/// dropped from `payload` appear as `null`. `None` unless both are objects.
pub fn shallow_patch(previous: &Value, payload: &Value) -> Option<Map<String, Value>> {
    let (Value::Object(before), Value::Object(after)) = (previous, payload) else {
        return None;
    };
    let mut patch = Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            patch.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    Some(patch)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
