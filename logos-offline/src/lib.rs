//! # logos-offline: Offline-first persistence core for Logos
//!
//! Keeps every record readable and writable without a network, and logs
//! local writes for later replay against the remote authority.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  coalesced txns   ┌──────────────────┐
//! │ PersistentStore  │ ────────────────► │ RocksBackend     │ Structured
//! │ (CRUD, blobs)    │                   └──────────────────┘
//! │                  │  whole-collection ┌──────────────────┐
//! │                  │ ────────────────► │ FlatBackend      │ Flat (fallback)
//! └───┬──────────┬───┘                   └────────┬─────────┘
//!     │          │ get_page                       │ ValueCodec (LZ4 + base64)
//!     │          ▼                                ▼
//!     │   ┌────────────────────┐          ┌──────────────────┐
//!     │   │ SearchIndexBuilder │          │ KeyValueStore    │
//!     │   │  → PrefixIndex     │          │ (one key/value)  │
//!     │   └────────────────────┘          └────────▲─────────┘
//!     │ SortedIndex (B-tree, per attribute)        │
//!     ▼                                            │
//!  find_by_sorted_key               MutationQueue ─┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: `PersistentStore`, the two backends, write coalescing
//! - [`codec`]: threshold-gated compression for flat values
//! - [`index`]: `SortedIndex` (B-tree) and `PrefixIndex` (trie)
//! - [`search`]: incremental index builder and hybrid ranking
//! - [`queue`]: durable mutation log for sync
//! - [`catalog`] / [`entity`]: collection definitions and records

pub mod catalog;
pub mod codec;
pub mod entity;
pub mod index;
pub mod queue;
pub mod search;
pub mod storage;

// Re-exports for convenience
pub use catalog::{Catalog, CollectionDef};
pub use codec::{CodecError, ValueCodec};
pub use entity::Entity;
pub use index::{PrefixIndex, SortedIndex};
pub use queue::{
    Mutation, MutationQueue, MutationStatus, MutationUpdate, QueueConfig, QueueError,
};
pub use search::{
    BuildProgress, RankedHit, SearchConfig, SearchHit, SearchIndex, SearchIndexBuilder,
    SearchSource, SharedSearchIndex,
};
pub use storage::{
    Backend, BackendMode, BackendStats, PersistentStore, SortedIndexSpec, StoreConfig,
    StoreError, StoreResult,
};
