//! Write coalescing for buffered backends.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               WriteBuffer                     │
//! │                                              │
//! │  pending: [ write | write | write | ... ]    │
//! │                                              │
//! │  first write into an empty buffer            │
//! │    └─► timer task: sleep(flush_delay)        │
//! │          └─► take all pending                │
//! │                └─► Backend::commit (1 txn)   │
//! │                      └─► resolve every       │
//! │                          completion together │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Writes that arrive while a flush is committing find the buffer empty
//! and start the next batch. Commits are serialized, so batches land in
//! the order they were opened. Each timer is tied to the batch that armed
//! it and does nothing once that batch has been flushed explicitly.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::storage::backend::{Backend, CollectionWrite};
use crate::storage::error::{StoreError, StoreResult};

/// Resolves once the write's batch has committed or failed.
pub type Completion = oneshot::Receiver<StoreResult<()>>;

/// A buffered write and the caller waiting on it.
pub struct PendingWrite {
    pub write: CollectionWrite,
    done: oneshot::Sender<StoreResult<()>>,
}

/// Writes of the open batch and its sequence number.
#[derive(Default)]
struct Pending {
    writes: Vec<PendingWrite>,
    batch: u64,
}

struct Inner {
    backend: Arc<dyn Backend>,
    flush_delay: Duration,
    pending: Mutex<Pending>,
    /// Held for the duration of one commit
    commit_lock: tokio::sync::Mutex<()>,
}

/// Coalescing buffer in front of one backend.
#[derive(Clone)]
pub struct WriteBuffer {
    inner: Arc<Inner>,
}

impl WriteBuffer {
    pub fn new(backend: Arc<dyn Backend>, flush_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                flush_delay,
                pending: Mutex::new(Pending::default()),
                commit_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Buffer one write. Must be called from within a Tokio runtime.
    pub fn enqueue(&self, write: CollectionWrite) -> Completion {
        let (done, completion) = oneshot::channel();
        let opened = {
            let mut pending = self.inner.lock_pending();
            let opened = if pending.writes.is_empty() {
                pending.batch += 1;
                Some(pending.batch)
            } else {
                None
            };
            pending.writes.push(PendingWrite { write, done });
            opened
        };

        if let Some(batch) = opened {
            // Weak so a discarded buffer releases its backend without waiting for the timer
            let inner = Arc::downgrade(&self.inner);
            let delay = self.inner.flush_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = inner.upgrade() {
                    inner.flush(Some(batch)).await;
                }
            });
        }
        completion
    }

    /// Commit whatever is buffered now instead of waiting for the timer.
    pub async fn flush(&self) {
        self.inner.flush(None).await;
    }

    /// Writes waiting for the next commit.
    pub fn pending_len(&self) -> usize {
        self.inner.lock_pending().writes.len()
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        // The guarded state is always left consistent, so a poisoned lock is safe to reuse
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit the open batch. A timer passes the batch it was armed for
    /// and skips the commit if a newer batch is open.
    async fn flush(&self, only: Option<u64>) {
        let _commit = self.commit_lock.lock().await;
        let batch = {
            let mut pending = self.lock_pending();
            if only.is_some_and(|id| id != pending.batch) {
                return;
            }
            mem::take(&mut pending.writes)
        };
        if batch.is_empty() {
            return;
        }

        let (writes, waiters): (Vec<CollectionWrite>, Vec<_>) =
            batch.into_iter().map(|p| (p.write, p.done)).unzip();

        let backend = Arc::clone(&self.backend);
        let count = writes.len();
        let result = tokio::task::spawn_blocking(move || backend.commit(&writes))
            .await
            .unwrap_or_else(|e| Err(StoreError::FlushTransactionFailed(e.to_string())));

        match result {
            Ok(()) => {
                log::debug!("Flushed {count} buffered writes in one transaction");
                for done in waiters {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                log::error!("Flush of {count} buffered writes failed: {e}");
                let failure = StoreError::FlushTransactionFailed(e.to_string());
                for done in waiters {
                    let _ = done.send(Err(failure.clone()));
                }
            }
        }
    }
}
