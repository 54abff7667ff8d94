//! Store configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::codec::DEFAULT_COMPRESSION_THRESHOLD;

/// Which persistence engine a store instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendMode {
    /// RocksDB with native per-collection indexes and batched transactions
    Structured,
    /// One serialized container per collection in flat key/value storage
    Flat,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Structured => f.write_str("structured"),
            BackendMode::Flat => f.write_str("flat"),
        }
    }
}

/// An attribute of a collection accelerated by a [`SortedIndex`](crate::index::SortedIndex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortedIndexSpec {
    pub collection: String,
    pub attribute: String,
}

impl SortedIndexSpec {
    pub fn new(collection: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            attribute: attribute.into(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory; `structured/` and `flat/` live underneath
    pub path: PathBuf,
    /// Prefix for every flat key, isolating stores that share a directory
    pub namespace: String,
    /// Backend to try first (default: Structured)
    pub preferred_mode: BackendMode,
    /// Coalescing window between the first buffered write and its flush (default: 10ms)
    pub flush_delay: Duration,
    /// Flat values at or above this serialized length are compressed (default: 1KB)
    pub compression_threshold: usize,
    /// RocksDB block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every committed batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Known collections and their secondary indexes
    pub catalog: Catalog,
    /// Attributes to accelerate with a sorted index after initialization
    pub sorted_indexes: Vec<SortedIndexSpec>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_offline"),
            namespace: "logos".to_string(),
            preferred_mode: BackendMode::Structured,
            flush_delay: Duration::from_millis(10),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            catalog: Catalog::default(),
            sorted_indexes: vec![SortedIndexSpec::new("cases", "caseNumber")],
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_delay: Duration::from_millis(5),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
            ..Self::default()
        }
    }

    /// RocksDB directory.
    pub fn structured_path(&self) -> PathBuf {
        self.path.join("structured")
    }

    /// Flat key/value directory.
    pub fn flat_path(&self) -> PathBuf {
        self.path.join("flat")
    }

    /// Flat key holding one collection's container.
    pub fn collection_key(&self, collection: &str) -> String {
        format!("{}:{collection}", self.namespace)
    }

    /// Flat key holding one blob.
    pub fn blob_key(&self, id: &str) -> String {
        format!("{}:__blob:{id}", self.namespace)
    }

    /// Flat key prefix shared by all blobs.
    pub fn blob_prefix(&self) -> String {
        format!("{}:__blob:", self.namespace)
    }

    /// Flat key recording a Structured failure or an explicit mode choice.
    pub fn mode_key(&self) -> String {
        format!("{}:__backend_mode", self.namespace)
    }

    /// Flat key holding the mutation log.
    pub fn queue_key(&self) -> String {
        format!("{}:__mutation_queue", self.namespace)
    }
}
