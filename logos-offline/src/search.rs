//! Incremental search over stored records.
//!
//! ```text
//!   PersistentStore ──get_page──► SearchIndexBuilder ──insert──► SearchIndex
//!                     (page_size)        │ yield_now              ├─ PrefixIndex<SearchHit>
//!                                        ▼ between pages          └─ corpus: Vec<SearchHit>
//! ```
//!
//! Ranking tries the trie first. When it yields fewer than
//! `min_trie_matches` hits the whole corpus is scored instead:
//!
//! | Match                                      | Score |
//! |--------------------------------------------|-------|
//! | exact (case-insensitive)                   | 100   |
//! | prefix                                     | 80    |
//! | substring                                  | 50    |
//! | edit distance ≤ 2 against a window of text | 20    |
//! | anything else                              | excluded |

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::index::{fold_key, PrefixIndex};
use crate::storage::{PersistentStore, StoreError, StoreResult};

pub const SCORE_EXACT: u32 = 100;
pub const SCORE_PREFIX: u32 = 80;
pub const SCORE_SUBSTRING: u32 = 50;
pub const SCORE_FUZZY: u32 = 20;

/// A text field of a collection to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSource {
    pub collection: String,
    pub fields: Vec<String>,
}

impl SearchSource {
    pub fn new(collection: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            collection: collection.into(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
        }
    }
}

/// Search configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Records read per builder step (default: 200)
    pub page_size: usize,
    /// Trie hits below this trigger a scored full scan (default: 5)
    pub min_trie_matches: usize,
    /// Maximum ranked results returned (default: 10)
    pub display_limit: usize,
    /// Largest edit distance that still counts as a fuzzy match (default: 2)
    pub fuzzy_max_distance: usize,
    /// What to index
    pub sources: Vec<SearchSource>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            min_trie_matches: 5,
            display_limit: 10,
            fuzzy_max_distance: 2,
            sources: vec![
                SearchSource::new("cases", &["title", "caseNumber"]),
                SearchSource::new("parties", &["name"]),
                SearchSource::new("motions", &["title"]),
                SearchSource::new("documents", &["title"]),
                SearchSource::new("clients", &["name"]),
            ],
        }
    }
}

/// One indexed text and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub collection: String,
    pub id: String,
    pub field: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedHit {
    pub hit: SearchHit,
    pub score: u32,
}

// ─── Index ───────────────────────────────────────────────────────────────

/// Trie plus the flat corpus used for broadened scans.
#[derive(Debug)]
pub struct SearchIndex {
    trie: PrefixIndex<SearchHit>,
    corpus: Vec<SearchHit>,
    config: SearchConfig,
}

/// Index shared between the builder and readers.
pub type SharedSearchIndex = Arc<RwLock<SearchIndex>>;

impl SearchIndex {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            trie: PrefixIndex::new(),
            corpus: Vec::new(),
            config,
        }
    }

    pub fn shared(config: SearchConfig) -> SharedSearchIndex {
        Arc::new(RwLock::new(Self::new(config)))
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn insert(&mut self, hit: SearchHit) {
        self.trie.insert(&hit.text, hit.clone());
        self.corpus.push(hit);
    }

    /// Raw trie lookup in trie order.
    pub fn search(&self, prefix: &str) -> Vec<SearchHit> {
        self.trie.search(prefix)
    }

    /// Scored results, best first, at most `display_limit`.
    pub fn rank(&self, query: &str) -> Vec<RankedHit> {
        let query = fold_key(query.trim());
        if query.is_empty() {
            return Vec::new();
        }

        let max_distance = self.config.fuzzy_max_distance;
        let trie_hits = self.trie.search(&query);
        let ranked: Vec<RankedHit> = if trie_hits.len() >= self.config.min_trie_matches {
            trie_hits
                .into_iter()
                .filter_map(|hit| {
                    score(&query, &hit.text, max_distance).map(|score| RankedHit { hit, score })
                })
                .collect()
        } else {
            log::debug!(
                "Trie returned {} hits for '{query}', scanning {} texts",
                trie_hits.len(),
                self.corpus.len()
            );
            self.corpus
                .iter()
                .filter_map(|hit| {
                    score(&query, &hit.text, max_distance).map(|score| RankedHit {
                        hit: hit.clone(),
                        score,
                    })
                })
                .collect()
        };
        self.finish(ranked)
    }

    /// Keep each record's best field, sort by score, truncate.
    fn finish(&self, ranked: Vec<RankedHit>) -> Vec<RankedHit> {
        let mut best: FxHashMap<(String, String), usize> = FxHashMap::default();
        let mut out: Vec<RankedHit> = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            let key = (candidate.hit.collection.clone(), candidate.hit.id.clone());
            match best.get(&key) {
                Some(&i) if out[i].score >= candidate.score => {}
                Some(&i) => out[i] = candidate,
                None => {
                    best.insert(key, out.len());
                    out.push(candidate);
                }
            }
        }
        // Stable: equal scores keep discovery order
        out.sort_by(|a, b| b.score.cmp(&a.score));
        out.truncate(self.config.display_limit);
        out
    }

    /// Number of indexed texts.
    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    pub fn clear(&mut self) {
        self.trie.clear();
        self.corpus.clear();
    }
}

/// Score `text` against an already folded query.
pub fn score(query: &str, text: &str, max_distance: usize) -> Option<u32> {
    let text = fold_key(text);
    if text == query {
        Some(SCORE_EXACT)
    } else if text.starts_with(query) {
        Some(SCORE_PREFIX)
    } else if text.contains(query) {
        Some(SCORE_SUBSTRING)
    } else {
        let window: String = text.chars().take(query.chars().count()).collect();
        (levenshtein(query, &window) <= max_distance).then_some(SCORE_FUZZY)
    }
}

/// Character-level edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ─── Builder ─────────────────────────────────────────────────────────────

/// Counters reported by a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub pages: usize,
    pub records: usize,
    pub texts: usize,
}

/// Fills a [`SearchIndex`] from the store one page at a time.
pub struct SearchIndexBuilder {
    store: Arc<PersistentStore>,
    index: SharedSearchIndex,
}

impl SearchIndexBuilder {
    pub fn new(store: Arc<PersistentStore>, index: SharedSearchIndex) -> Self {
        Self { store, index }
    }

    /// Index every configured source, yielding to the runtime between pages.
    ///
    /// Sources naming collections outside the catalog are skipped.
    pub async fn build(&self) -> StoreResult<BuildProgress> {
        let config = self.index.read().await.config().clone();
        let page_size = config.page_size.max(1);
        let mut progress = BuildProgress::default();

        for source in &config.sources {
            let mut offset = 0;
            loop {
                let page = match self.store.get_page(&source.collection, offset, page_size).await {
                    Ok(page) => page,
                    Err(StoreError::UnknownCollection(name)) => {
                        log::warn!("Search source '{name}' is not a known collection");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                if page.is_empty() {
                    break;
                }

                {
                    let mut index = self.index.write().await;
                    for entity in &page {
                        for field in &source.fields {
                            let Some(text) = entity.text(field) else {
                                continue;
                            };
                            if text.trim().is_empty() {
                                continue;
                            }
                            index.insert(SearchHit {
                                collection: source.collection.clone(),
                                id: entity.id.clone(),
                                field: field.clone(),
                                text: text.to_string(),
                            });
                            progress.texts += 1;
                        }
                    }
                }

                progress.pages += 1;
                progress.records += page.len();
                offset += page.len();
                if page.len() < page_size {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        log::info!(
            "Search index built: {} texts from {} records in {} pages",
            progress.texts,
            progress.records,
            progress.pages
        );
        Ok(progress)
    }

    /// Run [`build`](Self::build) as a background task.
    pub fn spawn(self) -> JoinHandle<StoreResult<BuildProgress>> {
        tokio::spawn(async move { self.build().await })
    }
}
