//! The CRUD contract shared by both persistence engines.
//!
//! [`PersistentStore`](crate::storage::PersistentStore) selects one
//! implementation at initialization and only ever talks to it through
//! this trait.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entity::Entity;
use crate::storage::config::BackendMode;
use crate::storage::error::StoreResult;

/// One mutation inside a committed batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Entity),
    Delete(String),
}

impl WriteOp {
    /// Identifier of the record this op touches.
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Put(entity) => &entity.id,
            WriteOp::Delete(id) => id,
        }
    }
}

/// A write addressed to a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionWrite {
    pub collection: String,
    pub op: WriteOp,
}

impl CollectionWrite {
    pub fn put(collection: impl Into<String>, entity: Entity) -> Self {
        Self {
            collection: collection.into(),
            op: WriteOp::Put(entity),
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            op: WriteOp::Delete(id.into()),
        }
    }
}

/// Commit counters, observable by tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Number of `commit` calls that succeeded
    pub transactions_committed: u64,
    /// Number of individual writes inside those commits
    pub operations_committed: u64,
}

/// Lock-free counters behind [`BackendStats`].
#[derive(Debug, Default)]
pub struct CommitCounters {
    transactions: AtomicU64,
    operations: AtomicU64,
}

impl CommitCounters {
    pub fn record(&self, operations: usize) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.operations.fetch_add(operations as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BackendStats {
        BackendStats {
            transactions_committed: self.transactions.load(Ordering::Relaxed),
            operations_committed: self.operations.load(Ordering::Relaxed),
        }
    }
}

/// A persistence engine.
///
/// All methods are synchronous; buffering and completion notification
/// live in the store above.
pub trait Backend: Send + Sync {
    fn mode(&self) -> BackendMode;

    /// Whether writes should go through the coalescing buffer.
    fn buffers_writes(&self) -> bool;

    fn get_all(&self, collection: &str) -> StoreResult<Vec<Entity>>;

    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Entity>>;

    /// Records whose `attribute` equals any of `values`.
    fn get_by_index(
        &self,
        collection: &str,
        attribute: &str,
        values: &[Value],
    ) -> StoreResult<Vec<Entity>>;

    /// A bounded slice of a collection in storage order.
    fn get_page(&self, collection: &str, offset: usize, limit: usize) -> StoreResult<Vec<Entity>>;

    fn count(&self, collection: &str) -> StoreResult<usize>;

    /// Apply every write as one transaction: all or nothing where the
    /// engine allows it.
    fn commit(&self, writes: &[CollectionWrite]) -> StoreResult<()>;

    fn put_blob(&self, id: &str, data: &[u8]) -> StoreResult<()>;

    fn get_blob(&self, id: &str) -> StoreResult<Option<Vec<u8>>>;

    fn delete_blob(&self, id: &str) -> StoreResult<()>;

    fn blob_ids(&self) -> StoreResult<Vec<String>>;

    fn stats(&self) -> BackendStats;
}

/// Equality match used wherever an index is emulated by scanning.
pub(crate) fn matches_any(entity: &Entity, attribute: &str, values: &[Value]) -> bool {
    match entity.get(attribute) {
        Some(found) => values.iter().any(|v| *v == found),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_any() {
        let entity = Entity::new("m1").with("status", "open");
        assert!(matches_any(&entity, "status", &[json!("closed"), json!("open")]));
        assert!(!matches_any(&entity, "status", &[json!("closed")]));
        assert!(!matches_any(&entity, "caseId", &[json!("open")]));
        assert!(matches_any(&entity, "id", &[json!("m1")]));
    }

    #[test]
    fn test_commit_counters() {
        let counters = CommitCounters::default();
        counters.record(3);
        counters.record(2);
        assert_eq!(
            counters.snapshot(),
            BackendStats {
                transactions_committed: 2,
                operations_committed: 5
            }
        );
    }

    #[test]
    fn test_write_op_id() {
        let put = CollectionWrite::put("cases", Entity::new("c1"));
        let del = CollectionWrite::delete("cases", "c2");
        assert_eq!(put.op.id(), "c1");
        assert_eq!(del.op.id(), "c2");
    }
}
