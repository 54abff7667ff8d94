//! In-memory lookup structures.
//!
//! - [`SortedIndex`]: B-tree over case-folded keys for exact and range lookups
//! - [`PrefixIndex`]: character trie for incremental prefix search
//!
//! Both fold keys with [`fold_key`] on insert and on query, so callers can
//! pass user text unchanged.

pub mod btree;
pub mod trie;

pub use btree::SortedIndex;
pub use trie::PrefixIndex;

/// Case folding applied to every indexed key.
pub fn fold_key(text: &str) -> String {
    text.to_lowercase()
}
