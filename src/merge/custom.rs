//! Merge strategy delegating to an application conflict resolver.

use std::sync::Arc;

use super::session::create_session;
use super::{
    ConflictResolver, MergeContext, MergeError, MergeStrategy, StrategyOutcome, three_way_diff,
};

/// Hands each conflict to an external [`ConflictResolver`] together with a
/// result-provider session; the merge settles whenever the resolver calls
/// `done` (or disconnects).
pub struct CustomMergeStrategy {
    resolver: Arc<dyn ConflictResolver>,
}

impl CustomMergeStrategy {
    pub fn new(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self { resolver }
    }
}

impl MergeStrategy for CustomMergeStrategy {
    fn merge(&mut self, mut ctx: MergeContext) -> Result<StrategyOutcome, MergeError> {
        let common = ctx.storage.snapshot(&ctx.ancestor.id())?;
        let left = ctx.storage.snapshot(&ctx.left.id())?;
        let right = ctx.storage.snapshot(&ctx.right.id())?;
        let diff = three_way_diff(common.tree(), left.tree(), right.tree());

        let hook = ctx
            .take_settled_hook()
            .expect("merge context carries a settled hook");
        let (provider, handle) = create_session(
            Arc::clone(&ctx.storage),
            ctx.left.clone(),
            ctx.right.clone(),
            diff,
            hook,
        );

        // The resolver may complete the session synchronously inside this
        // call; the owning MergeResolver reconciles that case.
        self.resolver.resolve(left, right, common, provider);
        Ok(StrategyOutcome::Pending(handle))
    }

    fn cancel(&mut self) {}
}
