//! Character-level prefix trie for autocomplete.
//!
//! Flat `Vec<TrieNode>` arena with per-node `Vec<(char, u32)>` children.
//! Children keep insertion order, which is also the order `search` reports
//! payloads in: a depth-first walk of the matched subtree, each node's own
//! payload before its descendants.

use super::fold_key;

#[derive(Debug, Clone)]
struct TrieNode<T> {
    /// Payload if an inserted key ends at this node.
    payload: Option<T>,
    /// Children in first-insertion order.
    children: Vec<(char, u32)>,
}

impl<T> TrieNode<T> {
    fn empty() -> Self {
        Self {
            payload: None,
            children: Vec::new(),
        }
    }
}

/// Case-insensitive prefix index mapping text keys to payloads.
///
/// Re-inserting a key replaces its payload without growing the trie.
#[derive(Debug, Clone)]
pub struct PrefixIndex<T> {
    nodes: Vec<TrieNode<T>>,
    terminals: usize,
}

impl<T: Clone> PrefixIndex<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::empty()],
            terminals: 0,
        }
    }

    /// Insert `text` with `payload`, overwriting any previous payload.
    pub fn insert(&mut self, text: &str, payload: T) {
        let mut node_idx: u32 = 0;
        for ch in fold_key(text).chars() {
            let children = &self.nodes[node_idx as usize].children;
            node_idx = match children.iter().find(|(c, _)| *c == ch) {
                Some(&(_, child_idx)) => child_idx,
                None => {
                    let new_idx = self.nodes.len() as u32;
                    self.nodes.push(TrieNode::empty());
                    self.nodes[node_idx as usize].children.push((ch, new_idx));
                    new_idx
                }
            };
        }
        let node = &mut self.nodes[node_idx as usize];
        if node.payload.replace(payload).is_none() {
            self.terminals += 1;
        }
    }

    /// Every payload whose key starts with `prefix`.
    ///
    /// An empty prefix matches everything.
    pub fn search(&self, prefix: &str) -> Vec<T> {
        let Some(start) = self.find(&fold_key(prefix)) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx as usize];
            if let Some(payload) = &node.payload {
                out.push(payload.clone());
            }
            // Reverse so the first-inserted child is visited first
            stack.extend(node.children.iter().rev().map(|&(_, child)| child));
        }
        out
    }

    fn find(&self, folded: &str) -> Option<u32> {
        let mut node_idx: u32 = 0;
        for ch in folded.chars() {
            let children = &self.nodes[node_idx as usize].children;
            node_idx = children.iter().find(|(c, _)| *c == ch)?.1;
        }
        Some(node_idx)
    }

    /// Drop every key.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(TrieNode::empty());
        self.terminals = 0;
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.terminals
    }

    pub fn is_empty(&self) -> bool {
        self.terminals == 0
    }

    /// Number of nodes in the trie (for diagnostics).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<T: Clone> Default for PrefixIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}
