//! Journals: mutable staging areas committed atomically into new commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::{CommitId, Tree};

/// Whether the journal belongs to an explicit transaction or is an implicit
/// single-operation one. Transaction bookkeeping for the owning page handle;
/// does not change commit semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalType {
    Implicit,
    Explicit,
}

/// Staged put/delete operations over a parent commit.
///
/// Created by `PageStorage::start_commit` / `start_merge_commit`, consumed
/// exactly once by `PageStorage::commit_journal` (move semantics make a
/// second commit attempt unrepresentable).
pub struct Journal {
    journal_type: JournalType,
    parents: Vec<CommitId>,
    base: Arc<Tree>,
    ops: BTreeMap<String, Option<Bytes>>,
}

impl Journal {
    pub(crate) fn new(journal_type: JournalType, parents: Vec<CommitId>, base: Arc<Tree>) -> Self {
        Self {
            journal_type,
            parents,
            base,
            ops: BTreeMap::new(),
        }
    }

    pub fn journal_type(&self) -> JournalType {
        self.journal_type
    }

    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    pub fn put(&mut self, key: impl Into<String>, value: Bytes) {
        self.ops.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.insert(key.into(), None);
    }

    /// The tree this journal commits to: base contents plus staged ops.
    pub(crate) fn build_tree(&self) -> Tree {
        let mut tree = (*self.base).clone();
        for (key, op) in &self.ops {
            match op {
                Some(value) => tree.insert(key.clone(), value.clone()),
                None => {
                    tree.remove(key);
                }
            }
        }
        tree
    }
}
