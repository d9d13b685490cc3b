//! Commits, trees and head ordering.
//!
//! A commit is an immutable node in the per-page history DAG. Its id is a
//! content hash over the canonical identity encoding (parents, generation,
//! timestamp, tree root hash), so equal commits constructed independently on
//! different devices collapse to one. Merge commits take the maximum of
//! their parents' timestamps instead of a fresh clock reading, which makes
//! the merge of a given parent pair and tree fully deterministic. That is
//! what lets concurrent mergers converge instead of trading new commits
//! forever.

use std::collections::BTreeMap;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::ids::{CommitId, ObjectHash};

/// A single key/value entry as listed by snapshots and diffs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
}

/// Ordered key→value mapping carried by a commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree(BTreeMap<String, Bytes>);

impl Tree {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: String, value: Bytes) {
        self.0.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.0.iter()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0
            .iter()
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

impl FromIterator<(String, Bytes)> for Tree {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Content hash of a tree's canonical encoding.
///
/// Keys iterate in lexicographic order, so equal trees hash equally
/// regardless of insertion history.
pub fn tree_hash(tree: &Tree) -> ObjectHash {
    let mut hasher = Sha256::new();
    for (key, value) in tree.iter() {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    ObjectHash::from_bytes(hasher.finalize().into())
}

/// Content hash of a value object offloaded to the cloud object store.
pub fn object_hash(bytes: &[u8]) -> ObjectHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ObjectHash::from_bytes(hasher.finalize().into())
}

/// Commit id over the canonical identity encoding.
pub fn commit_id(
    parents: &[CommitId],
    generation: u64,
    timestamp_ms: u64,
    root_hash: ObjectHash,
) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update([parents.len() as u8]);
    for parent in parents {
        hasher.update(parent.as_bytes());
    }
    hasher.update(generation.to_be_bytes());
    hasher.update(timestamp_ms.to_be_bytes());
    hasher.update(root_hash.as_bytes());
    CommitId::from_bytes(hasher.finalize().into())
}

/// Immutable node in the per-page history DAG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    id: CommitId,
    parents: Vec<CommitId>,
    generation: u64,
    timestamp_ms: u64,
    root_hash: ObjectHash,
}

impl Commit {
    /// Construct a commit, computing its content-addressed id.
    ///
    /// Merge parents are sorted so both merge orders produce the same id.
    pub fn new(
        mut parents: Vec<CommitId>,
        generation: u64,
        timestamp_ms: u64,
        root_hash: ObjectHash,
    ) -> Self {
        parents.sort();
        let id = commit_id(&parents, generation, timestamp_ms, root_hash);
        Self {
            id,
            parents,
            generation,
            timestamp_ms,
            root_hash,
        }
    }

    /// The implicit empty first commit every page starts from.
    pub fn root() -> Self {
        Self {
            id: CommitId::root(),
            parents: Vec::new(),
            generation: 0,
            timestamp_ms: 0,
            root_hash: tree_hash(&Tree::new()),
        }
    }

    pub fn id(&self) -> CommitId {
        self.id
    }

    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn root_hash(&self) -> ObjectHash {
        self.root_hash
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    /// Head ordering key: (generation, timestamp, id), greatest = newest.
    pub fn order_key(&self) -> (u64, u64, CommitId) {
        (self.generation, self.timestamp_ms, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(pairs: &[(&str, &str)]) -> Tree {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[test]
    fn tree_hash_is_insertion_order_independent() {
        let mut a = Tree::new();
        a.insert("x".into(), Bytes::from_static(b"1"));
        a.insert("y".into(), Bytes::from_static(b"2"));
        let mut b = Tree::new();
        b.insert("y".into(), Bytes::from_static(b"2"));
        b.insert("x".into(), Bytes::from_static(b"1"));
        assert_eq!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn tree_hash_distinguishes_key_value_split() {
        let a = tree(&[("ab", "c")]);
        let b = tree(&[("a", "bc")]);
        assert_ne!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn merge_commit_id_independent_of_parent_order() {
        let p1 = CommitId::from_bytes([1u8; 32]);
        let p2 = CommitId::from_bytes([2u8; 32]);
        let root = tree_hash(&tree(&[("k", "v")]));
        let a = Commit::new(vec![p1, p2], 3, 99, root);
        let b = Commit::new(vec![p2, p1], 3, 99, root);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn commit_id_covers_all_fields() {
        let root = tree_hash(&Tree::new());
        let base = Commit::new(vec![CommitId::root()], 1, 10, root);
        let other_gen = Commit::new(vec![CommitId::root()], 2, 10, root);
        let other_ts = Commit::new(vec![CommitId::root()], 1, 11, root);
        assert_ne!(base.id(), other_gen.id());
        assert_ne!(base.id(), other_ts.id());
    }

    #[test]
    fn order_key_prefers_generation_over_timestamp() {
        let root = tree_hash(&Tree::new());
        let low_gen = Commit::new(vec![CommitId::root()], 1, 100, root);
        let high_gen = Commit::new(vec![CommitId::root()], 2, 1, root);
        assert!(high_gen.order_key() > low_gen.order_key());
    }
}
