//! Three-way diffs between two heads and their common ancestor.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::core::Tree;

/// Entries per page returned by one paginated diff call.
pub const DIFF_PAGE_SIZE: usize = 64;

/// One key's state across the three versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub key: String,
    pub base: Option<Bytes>,
    pub left: Option<Bytes>,
    pub right: Option<Bytes>,
}

impl DiffEntry {
    pub fn changed_left(&self) -> bool {
        self.left != self.base
    }

    pub fn changed_right(&self) -> bool {
        self.right != self.base
    }

    /// Both sides changed the key, to different values.
    pub fn is_conflicting(&self) -> bool {
        self.changed_left() && self.changed_right() && self.left != self.right
    }
}

/// Continuation token for paginated diff reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffToken(pub(crate) usize);

/// All keys touched by either side relative to the ancestor, in key order.
pub fn three_way_diff(base: &Tree, left: &Tree, right: &Tree) -> Vec<DiffEntry> {
    let mut keys: BTreeSet<&String> = BTreeSet::new();
    keys.extend(base.iter().map(|(k, _)| k));
    keys.extend(left.iter().map(|(k, _)| k));
    keys.extend(right.iter().map(|(k, _)| k));

    keys.into_iter()
        .filter_map(|key| {
            let entry = DiffEntry {
                key: key.clone(),
                base: base.get(key).cloned(),
                left: left.get(key).cloned(),
                right: right.get(key).cloned(),
            };
            (entry.changed_left() || entry.changed_right()).then_some(entry)
        })
        .collect()
}

/// Slice one page out of a diff, returning the continuation token when more
/// entries remain.
pub(crate) fn paginate(diff: &[DiffEntry], token: Option<DiffToken>) -> (Vec<DiffEntry>, Option<DiffToken>) {
    let from = token.map_or(0, |t| t.0).min(diff.len());
    let to = (from + DIFF_PAGE_SIZE).min(diff.len());
    let next = (to < diff.len()).then_some(DiffToken(to));
    (diff[from..to].to_vec(), next)
}
