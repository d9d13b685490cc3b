//! Shared read-only views of a commit's contents.

use std::sync::Arc;

use bytes::Bytes;

use crate::core::{Commit, Entry, Tree};

/// A commit plus its materialized tree.
///
/// The tree is reference-counted: an in-flight operation holding a snapshot
/// keeps the contents alive regardless of what storage does afterwards.
#[derive(Clone)]
pub struct PageSnapshot {
    commit: Commit,
    tree: Arc<Tree>,
}

impl PageSnapshot {
    pub(crate) fn new(commit: Commit, tree: Arc<Tree>) -> Self {
        Self { commit, tree }
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.tree.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.tree.contains_key(key)
    }

    /// All entries in key order.
    pub fn entries(&self) -> Vec<Entry> {
        self.tree.entries()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}
