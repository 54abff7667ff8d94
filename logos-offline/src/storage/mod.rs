//! Persistent storage layer for offline records.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   put / delete   ┌─────────────┐  one txn per window
//! │ PersistentStore  │ ───────────────► │ WriteBuffer │ ──────────────┐
//! │ (CRUD + blobs)   │                  └─────────────┘               │
//! └────────┬─────────┘                                                ▼
//!          │ dyn Backend          ┌──────────────────────────────────────┐
//!          ├────────────────────► │ RocksBackend (Structured)            │
//!          │                      │   CF "records" — entities (JSON)     │
//!          │                      │   CF "indexes" — secondary indexes   │
//!          │                      │   CF "blobs"   — binary attachments  │
//!          │                      │   CF "meta"    — schema (bincode)    │
//!          │                      └──────────────────────────────────────┘
//!          │                      ┌──────────────────────────────────────┐
//!          └────────────────────► │ FlatBackend (Flat)                   │
//!                                 │   one compressed JSON array per      │
//!                                 │   collection in a KeyValueStore      │
//!                                 └──────────────────────────────────────┘
//! ```
//!
//! Exactly one backend is active per store. Structured is preferred;
//! if it cannot be opened the session continues on Flat and remembers why.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod flat;
pub mod kv;
pub mod rocks;
pub mod store;

pub use backend::{Backend, BackendStats, CollectionWrite, WriteOp};
pub use buffer::WriteBuffer;
pub use config::{BackendMode, SortedIndexSpec, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use flat::FlatBackend;
pub use kv::{DirectoryKv, FlatError, KeyValueStore, MemoryKv};
pub use rocks::{RocksBackend, SchemaMetadata};
pub use store::PersistentStore;
