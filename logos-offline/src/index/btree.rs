//! B-tree over case-folded string keys.
//!
//! Architecture:
//! ```text
//!                 ┌──────────────┐
//!                 │  [m] [t]     │   internal: keys + children
//!                 └─┬────┬────┬──┘
//!        ┌──────────┘    │    └──────────┐
//!   ┌────▼─────┐   ┌─────▼────┐   ┌──────▼───┐
//!   │ [a] [f]  │   │ [p] [r]  │   │ [v] [x]  │   leaves
//!   └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! Nodes live in an arena (`Vec<Node>`) and reference children by index.
//! Full nodes are split on the way down during insert, so insertion never
//! has to walk back up. Every node holds at most `2t - 1` keys, which keeps
//! all leaves at the same depth and lookups at O(log n).
//!
//! Keys are unique: inserting an existing key replaces its value.
//!
//! Reference: Cormen et al. — Introduction to Algorithms, Chapter 18

use super::fold_key;

/// Minimum degree used by [`SortedIndex::new`].
pub const DEFAULT_MIN_DEGREE: usize = 16;

#[derive(Debug, Clone, Default)]
struct Node {
    keys: Vec<String>,
    values: Vec<String>,
    /// Empty for leaves; `keys.len() + 1` entries otherwise.
    children: Vec<usize>,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Case-insensitive exact-key index mapping attribute values to record ids.
#[derive(Debug, Clone)]
pub struct SortedIndex {
    nodes: Vec<Node>,
    root: usize,
    min_degree: usize,
    len: usize,
}

impl SortedIndex {
    pub fn new() -> Self {
        Self::with_min_degree(DEFAULT_MIN_DEGREE)
    }

    /// Build with branching factor `2 * min_degree` (clamped to at least 2).
    pub fn with_min_degree(min_degree: usize) -> Self {
        Self {
            nodes: vec![Node::default()],
            root: 0,
            min_degree: min_degree.max(2),
            len: 0,
        }
    }

    fn max_keys(&self) -> usize {
        2 * self.min_degree - 1
    }

    /// Insert or replace the value stored under `key`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let key = fold_key(key);
        let value = value.into();

        if self.nodes[self.root].keys.len() == self.max_keys() {
            let old_root = self.root;
            self.nodes.push(Node {
                children: vec![old_root],
                ..Node::default()
            });
            self.root = self.nodes.len() - 1;
            self.split_child(self.root, 0);
        }

        if self.insert_non_full(self.root, key, value) {
            self.len += 1;
        }
    }

    /// Split the full child at `parent.children[i]`, lifting its median.
    fn split_child(&mut self, parent: usize, i: usize) {
        let t = self.min_degree;
        let child = self.nodes[parent].children[i];

        let right = {
            let node = &mut self.nodes[child];
            let keys = node.keys.split_off(t);
            let values = node.values.split_off(t);
            let children = if node.is_leaf() {
                Vec::new()
            } else {
                node.children.split_off(t)
            };
            Node {
                keys,
                values,
                children,
            }
        };
        let (median_key, median_value) = {
            let node = &mut self.nodes[child];
            // After split_off(t) the median is the last remaining key
            match (node.keys.pop(), node.values.pop()) {
                (Some(k), Some(v)) => (k, v),
                _ => return,
            }
        };

        self.nodes.push(right);
        let right_idx = self.nodes.len() - 1;
        let parent_node = &mut self.nodes[parent];
        parent_node.keys.insert(i, median_key);
        parent_node.values.insert(i, median_value);
        parent_node.children.insert(i + 1, right_idx);
    }

    /// Returns `true` if a new key was added.
    fn insert_non_full(&mut self, mut idx: usize, key: String, value: String) -> bool {
        loop {
            let mut pos = match self.nodes[idx].keys.binary_search(&key) {
                Ok(found) => {
                    self.nodes[idx].values[found] = value;
                    return false;
                }
                Err(pos) => pos,
            };

            if self.nodes[idx].is_leaf() {
                let node = &mut self.nodes[idx];
                node.keys.insert(pos, key);
                node.values.insert(pos, value);
                return true;
            }

            let child = self.nodes[idx].children[pos];
            if self.nodes[child].keys.len() == self.max_keys() {
                self.split_child(idx, pos);
                match key.cmp(&self.nodes[idx].keys[pos]) {
                    std::cmp::Ordering::Equal => {
                        self.nodes[idx].values[pos] = value;
                        return false;
                    }
                    std::cmp::Ordering::Greater => pos += 1,
                    std::cmp::Ordering::Less => {}
                }
            }
            idx = self.nodes[idx].children[pos];
        }
    }

    /// Value stored under `key`, compared case-insensitively.
    pub fn search(&self, key: &str) -> Option<&str> {
        let key = fold_key(key);
        let mut idx = self.root;
        loop {
            let node = &self.nodes[idx];
            match node.keys.binary_search(&key) {
                Ok(found) => return Some(&node.values[found]),
                Err(pos) if !node.is_leaf() => idx = node.children[pos],
                Err(_) => return None,
            }
        }
    }

    /// Entries with `from <= key < to` in key order.
    pub fn range(&self, from: &str, to: &str) -> Vec<(&str, &str)> {
        let (from, to) = (fold_key(from), fold_key(to));
        let mut out = Vec::new();
        if from < to {
            self.collect_range(self.root, &from, &to, &mut out);
        }
        out
    }

    fn collect_range<'a>(&'a self, idx: usize, from: &str, to: &str, out: &mut Vec<(&'a str, &'a str)>) {
        let node = &self.nodes[idx];
        let start = node.keys.partition_point(|k| k.as_str() < from);
        for i in start..=node.keys.len() {
            if !node.is_leaf() {
                self.collect_range(node.children[i], from, to, out);
            }
            match node.keys.get(i) {
                Some(key) if key.as_str() < to => out.push((key.as_str(), node.values[i].as_str())),
                _ => return,
            }
        }
    }

    /// Every entry in key order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::with_capacity(self.len);
        self.collect_all(self.root, &mut out);
        out
    }

    fn collect_all<'a>(&'a self, idx: usize, out: &mut Vec<(&'a str, &'a str)>) {
        let node = &self.nodes[idx];
        for i in 0..node.keys.len() {
            if !node.is_leaf() {
                self.collect_all(node.children[i], out);
            }
            out.push((node.keys[i].as_str(), node.values[i].as_str()));
        }
        if let Some(&last) = node.children.last() {
            self.collect_all(last, out);
        }
    }

    /// Levels from root to leaf.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut idx = self.root;
        while let Some(&first) = self.nodes[idx].children.first() {
            idx = first;
            height += 1;
        }
        height
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::default());
        self.root = 0;
        self.len = 0;
    }
}

impl Default for SortedIndex {
    fn default() -> Self {
        Self::new()
    }
}
