//! Automatic "last one wins" merge strategy.

use super::{MergeContext, MergeError, MergeStrategy, StrategyOutcome, three_way_diff};

/// Three-way merge favoring the newer head.
///
/// Keys touched by only one side take that side's change; keys changed on
/// both sides take the left (newer) head's value. Chained pairwise merges of
/// more than two concurrent writers are neither associative nor commutative:
/// the final value of a twice-fought-over key can depend on merge order.
/// That is a documented property of this strategy, not an instability:
/// every device still converges to the same result for the same merge
/// order, and the order itself is fixed by the deterministic head ordering.
pub struct LastOneWinsStrategy;

impl MergeStrategy for LastOneWinsStrategy {
    fn merge(&mut self, ctx: MergeContext) -> Result<StrategyOutcome, MergeError> {
        let base = ctx.storage.snapshot(&ctx.ancestor.id())?;
        let left = ctx.storage.snapshot(&ctx.left.id())?;
        let right = ctx.storage.snapshot(&ctx.right.id())?;
        let diff = three_way_diff(base.tree(), left.tree(), right.tree());

        // Journal base is the left tree: left-only changes and conflict
        // winners are already in place, only right-only changes get applied.
        let mut journal = ctx
            .storage
            .start_merge_commit(&ctx.left.id(), &ctx.right.id())?;
        for entry in &diff {
            if entry.changed_right() && !entry.changed_left() {
                match &entry.right {
                    Some(value) => journal.put(entry.key.clone(), value.clone()),
                    None => journal.delete(entry.key.clone()),
                }
            }
        }
        ctx.storage.commit_journal(journal)?;
        Ok(StrategyOutcome::Merged)
    }

    fn cancel(&mut self) {}
}
