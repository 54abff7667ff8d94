//! Storage error taxonomy.

use thiserror::Error;

use crate::codec::CodecError;
use crate::storage::kv::FlatError;

/// Errors surfaced by [`PersistentStore`](crate::storage::PersistentStore)
/// and its backends.
///
/// `Clone` so a single failed flush can reject every write in its batch.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The Structured backend could not be opened or used; the session
    /// continues on Flat.
    #[error("Structured backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The coalesced transaction carrying this write did not commit.
    /// Retryable by re-issuing the logical write.
    #[error("Flush transaction failed: {0}")]
    FlushTransactionFailed(String),

    /// A stored value failed both direct and decompressed decoding.
    #[error("Stored value is corrupted: {0}")]
    DecodeCorruption(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Flat storage error: {0}")]
    Flat(#[from] FlatError),
}

impl StoreError {
    /// Whether the caller should re-issue the write.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::FlushTransactionFailed(_) | StoreError::Database(_) | StoreError::Flat(_)
        )
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Serialize(msg) => StoreError::Serialization(msg),
            CodecError::Corrupted(msg) => StoreError::DecodeCorruption(msg),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
