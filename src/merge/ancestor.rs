//! Lowest common ancestor over the commit DAG.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::core::{Commit, CommitId};
use crate::storage::PageStorage;

use super::MergeError;

const FROM_LEFT: u8 = 0b01;
const FROM_RIGHT: u8 = 0b10;

/// Find the lowest common ancestor of two commits, the "common version"
/// handed to merge strategies.
///
/// Walks ancestors newest-first by (generation, timestamp, id); the first
/// commit reachable from both sides is the answer. Every page's history
/// bottoms out in the implicit root commit, so the walk always terminates
/// with a result.
pub fn common_ancestor(
    storage: &Arc<dyn PageStorage>,
    left: &Commit,
    right: &Commit,
) -> Result<Commit, MergeError> {
    let mut marks: HashMap<CommitId, u8> = HashMap::new();
    let mut frontier: BinaryHeap<OrderedCommit> = BinaryHeap::new();

    marks.insert(left.id(), FROM_LEFT);
    marks.insert(right.id(), FROM_RIGHT);
    frontier.push(OrderedCommit(left.clone()));
    frontier.push(OrderedCommit(right.clone()));

    while let Some(OrderedCommit(commit)) = frontier.pop() {
        let mark = marks.get(&commit.id()).copied().unwrap_or(0);
        if mark == FROM_LEFT | FROM_RIGHT {
            return Ok(commit);
        }
        for parent in commit.parents() {
            let entry = marks.entry(*parent).or_insert(0);
            let before = *entry;
            *entry |= mark;
            if before == 0 {
                frontier.push(OrderedCommit(storage.commit(parent)?));
            }
        }
    }

    // Unreachable for well-formed histories; kept as a hard error rather
    // than a panic because the commits may have come from the network.
    Err(MergeError::Storage(
        crate::storage::StorageError::InvalidCommit {
            commit: left.id(),
            reason: format!("no common ancestor with {}", right.id()),
        },
    ))
}

struct OrderedCommit(Commit);

impl PartialEq for OrderedCommit {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}

impl Eq for OrderedCommit {}

impl PartialOrd for OrderedCommit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedCommit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.order_key().cmp(&other.0.order_key())
    }
}
