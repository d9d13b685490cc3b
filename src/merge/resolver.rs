//! Per-page merge resolver.
//!
//! A state machine observing the page's head-commit set: whenever more than
//! one head exists and a strategy is set, it obtains the common ancestor,
//! drives the strategy, and commits the reconciling merge, retrying
//! transient storage failures with backoff. At most one merge session is in
//! flight per page; conflicts observed mid-session are re-evaluated once the
//! session settles.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::core::Commit;
use crate::storage::{CommitSource, CommitWatcher, PageStorage};
use crate::sync::Backoff;

use super::session::SessionHandle;
use super::{
    ConflictResolutionWaitStatus, MergeContext, MergeStrategy, SessionOutcome, StrategyOutcome,
    common_ancestor,
};

type Waiter = Box<dyn FnOnce(ConflictResolutionWaitStatus) + Send>;

pub struct MergeResolver {
    storage: Arc<dyn PageStorage>,
    self_weak: Weak<MergeResolver>,
    inner: Mutex<Inner>,
}

struct Inner {
    strategy: Option<Box<dyn MergeStrategy>>,
    session: Option<SessionHandle>,
    /// Bumped on every strategy swap; stale session outcomes are dropped.
    epoch: u64,
    processing: bool,
    recheck: bool,
    retry_at: Option<Instant>,
    backoff: Box<dyn Backoff>,
    last_source: CommitSource,
    /// Merge-of-merges damping already consumed for the current conflict.
    damped: bool,
    /// A session failed non-retryably; only a head-set change (or a strategy
    /// swap) re-arms resolution.
    wait_for_head_change: bool,
    pending_conflict: bool,
    has_unfinished: bool,
    settled_while_processing: Option<SessionOutcome>,
    waiters: Vec<Waiter>,
}

/// What one evaluation round decided to do, computed under the lock and
/// executed outside it.
enum Work {
    /// Head set is singular: report to any queued waiters.
    Quiet {
        waiters: Vec<Waiter>,
        status: ConflictResolutionWaitStatus,
    },
    /// Identical content on both heads: merge without any strategy.
    Trivial { left: Commit, right: Commit },
    Strategy {
        left: Commit,
        right: Commit,
        epoch: u64,
    },
    Nothing,
}

impl MergeResolver {
    pub fn new(storage: Arc<dyn PageStorage>, backoff: Box<dyn Backoff>) -> Arc<Self> {
        let resolver = Arc::new_cyclic(|self_weak| Self {
            storage: Arc::clone(&storage),
            self_weak: self_weak.clone(),
            inner: Mutex::new(Inner {
                strategy: None,
                session: None,
                epoch: 0,
                processing: false,
                recheck: false,
                retry_at: None,
                backoff,
                last_source: CommitSource::Local,
                damped: false,
                wait_for_head_change: false,
                pending_conflict: false,
                has_unfinished: false,
                settled_while_processing: None,
                waiters: Vec::new(),
            }),
        });
        let resolver_dyn: Arc<dyn CommitWatcher> = resolver.clone();
        let weak: Weak<dyn CommitWatcher> = Arc::downgrade(&resolver_dyn);
        storage.register_commit_watcher(weak);
        resolver.check_conflicts();
        resolver
    }

    /// Swap the active strategy. `None` disables automatic merging:
    /// conflicts stay visible as multiple heads until a strategy is set
    /// again. Swapping mid-merge cancels the in-flight session and
    /// re-evaluates from scratch.
    pub fn set_merge_strategy(&self, strategy: Option<Box<dyn MergeStrategy>>) {
        {
            let mut inner = self.lock();
            inner.epoch += 1;
            if let Some(handle) = inner.session.take() {
                handle.cancel();
            }
            if let Some(mut old) = inner.strategy.take() {
                old.cancel();
            }
            inner.strategy = strategy;
            inner.retry_at = None;
            inner.damped = false;
            inner.wait_for_head_change = false;
            inner.settled_while_processing = None;
        }
        self.check_conflicts();
    }

    /// True exactly when no merge is in flight and none is scheduled; the
    /// owning page manager may tear the page down.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        !inner.processing && inner.session.is_none() && inner.retry_at.is_none()
    }

    /// True when a strategy reported success but the head set did not
    /// actually collapse (the merge is still owed).
    pub fn has_unfinished_merges(&self) -> bool {
        self.lock().has_unfinished
    }

    /// Register a callback fired the next time the head set is singular.
    ///
    /// Fires immediately with `NoConflicts` when nothing is in conflict now;
    /// otherwise queues and fires with `ConflictsResolved` once the conflict
    /// resolves. The queue drains once per resolution.
    pub fn register_no_conflict_callback(&self, callback: Waiter) {
        let immediate = {
            let mut inner = self.lock();
            let quiet = !inner.processing && inner.session.is_none();
            if quiet && self.storage.head_commit_ids().len() <= 1 {
                Some(callback)
            } else {
                inner.waiters.push(callback);
                None
            }
        };
        if let Some(callback) = immediate {
            callback(ConflictResolutionWaitStatus::NoConflicts);
        }
    }

    /// Run a due retry, if any. Returns true if work was done.
    pub fn pump(&self) -> bool {
        let due = {
            let inner = self.lock();
            !inner.processing
                && inner.session.is_none()
                && inner.retry_at.is_some_and(|at| Instant::now() >= at)
        };
        if due {
            self.check_conflicts();
        }
        due
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("merge resolver lock poisoned")
    }

    /// Evaluate the head set and drive resolution until quiescent.
    fn check_conflicts(&self) {
        loop {
            let work = {
                let mut inner = self.lock();
                if inner.processing || inner.session.is_some() {
                    inner.recheck = true;
                    return;
                }
                if let Some(at) = inner.retry_at {
                    if Instant::now() < at {
                        return;
                    }
                    inner.retry_at = None;
                }
                self.evaluate(&mut inner)
            };

            match work {
                Work::Nothing => {}
                Work::Quiet { waiters, status } => {
                    for waiter in waiters {
                        waiter(status);
                    }
                }
                Work::Trivial { left, right } => self.run_trivial_merge(left, right),
                Work::Strategy { left, right, epoch } => self.run_strategy(left, right, epoch),
            }

            let mut inner = self.lock();
            if inner.recheck && !inner.processing && inner.session.is_none() {
                inner.recheck = false;
                continue;
            }
            return;
        }
    }

    /// Decide the next step for the current head set. Lock held.
    fn evaluate(&self, inner: &mut Inner) -> Work {
        let heads = self.storage.head_commit_ids();
        if heads.len() <= 1 {
            let status = if inner.pending_conflict {
                ConflictResolutionWaitStatus::ConflictsResolved
            } else {
                ConflictResolutionWaitStatus::NoConflicts
            };
            inner.pending_conflict = false;
            inner.damped = false;
            inner.has_unfinished = false;
            let waiters = std::mem::take(&mut inner.waiters);
            if waiters.is_empty() {
                return Work::Nothing;
            }
            return Work::Quiet { waiters, status };
        }

        inner.pending_conflict = true;
        if inner.wait_for_head_change || inner.strategy.is_none() {
            return Work::Nothing;
        }

        // The two newest heads under (generation, timestamp, id) ordering;
        // the newest becomes the left side.
        let left = match self.storage.commit(&heads[heads.len() - 1]) {
            Ok(commit) => commit,
            Err(err) => return self.storage_trouble(inner, err),
        };
        let right = match self.storage.commit(&heads[heads.len() - 2]) {
            Ok(commit) => commit,
            Err(err) => return self.storage_trouble(inner, err),
        };

        if left.root_hash() == right.root_hash() {
            inner.processing = true;
            return Work::Trivial { left, right };
        }

        // Both heads being merges of remote origin means several devices are
        // racing to reconcile; waiting one backoff delay lets one winner
        // propagate instead of trading dueling merges.
        if left.is_merge()
            && right.is_merge()
            && inner.last_source == CommitSource::Sync
            && !inner.damped
        {
            inner.damped = true;
            let delay = inner.backoff.next_delay();
            inner.retry_at = Some(Instant::now() + delay);
            tracing::debug!(page = %self.storage.page_id(), "delaying merge of merges");
            return Work::Nothing;
        }

        inner.processing = true;
        Work::Strategy {
            left,
            right,
            epoch: inner.epoch,
        }
    }

    fn storage_trouble(&self, inner: &mut Inner, err: crate::storage::StorageError) -> Work {
        if err.transience().is_retryable() {
            tracing::warn!(
                page = %self.storage.page_id(),
                error = %err,
                "merge storage access failed, retrying"
            );
            let delay = inner.backoff.next_delay();
            inner.retry_at = Some(Instant::now() + delay);
        } else {
            tracing::error!(
                page = %self.storage.page_id(),
                error = %err,
                "merge storage access failed permanently; conflict left unresolved"
            );
        }
        Work::Nothing
    }

    /// Merge two heads with identical content: no strategy involved, the
    /// merge commit simply carries the shared tree.
    fn run_trivial_merge(&self, left: Commit, right: Commit) {
        let result = self
            .storage
            .start_merge_commit(&left.id(), &right.id())
            .and_then(|journal| self.storage.commit_journal(journal));

        let mut inner = self.lock();
        inner.processing = false;
        match result {
            Ok(_) => {
                inner.damped = false;
                inner.recheck = true;
            }
            Err(err) => {
                let _ = self.storage_trouble(&mut inner, err);
            }
        }
    }

    fn run_strategy(&self, left: Commit, right: Commit, epoch: u64) {
        let ancestor = match common_ancestor(&self.storage, &left, &right) {
            Ok(ancestor) => ancestor,
            Err(err) => {
                let mut inner = self.lock();
                inner.processing = false;
                if err.transience().is_retryable() {
                    let delay = inner.backoff.next_delay();
                    inner.retry_at = Some(Instant::now() + delay);
                } else {
                    tracing::error!(
                        page = %self.storage.page_id(),
                        error = %err,
                        "common ancestor lookup failed; conflict left unresolved"
                    );
                }
                return;
            }
        };

        let Some(mut strategy) = ({
            let mut inner = self.lock();
            let taken = inner.strategy.take();
            if taken.is_none() {
                inner.processing = false;
            }
            taken
        }) else {
            // Strategy cleared between evaluation and now.
            return;
        };

        let weak = self.self_weak.clone();
        let hook = Box::new(move |outcome| {
            if let Some(resolver) = weak.upgrade() {
                resolver.on_session_settled(epoch, outcome);
            }
        });
        let ctx = MergeContext::new(Arc::clone(&self.storage), left, right, ancestor, hook);
        let result = strategy.merge(ctx);

        let mut inner = self.lock();
        inner.processing = false;
        let epoch_ok = inner.epoch == epoch;
        if epoch_ok {
            inner.strategy = Some(strategy);
        } else {
            strategy.cancel();
        }

        if !epoch_ok {
            // Swapped mid-merge: abandon whatever the old strategy started.
            if let Ok(StrategyOutcome::Pending(handle)) = result {
                handle.cancel();
            }
            return;
        }

        match result {
            Ok(StrategyOutcome::Merged) => {
                inner.damped = false;
                inner.has_unfinished = self.storage.head_commit_ids().len() > 1;
                inner.recheck = true;
            }
            Ok(StrategyOutcome::Pending(handle)) => {
                if let Some(outcome) = inner.settled_while_processing.take() {
                    // The external resolver finished synchronously, inside
                    // the strategy call.
                    self.apply_outcome(&mut inner, outcome);
                } else {
                    inner.session = Some(handle);
                }
            }
            Err(err) if err.transience().is_retryable() => {
                tracing::warn!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "merge failed, retrying with backoff"
                );
                let delay = inner.backoff.next_delay();
                inner.retry_at = Some(Instant::now() + delay);
            }
            Err(err) => {
                tracing::error!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "merge failed; conflict left unresolved"
                );
                inner.wait_for_head_change = true;
            }
        }
    }

    fn on_session_settled(&self, epoch: u64, outcome: SessionOutcome) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            if inner.processing {
                inner.settled_while_processing = Some(outcome);
                return;
            }
            self.apply_outcome(&mut inner, outcome);
        }
        self.check_conflicts();
    }

    /// Record a session outcome. Lock held.
    fn apply_outcome(&self, inner: &mut Inner, outcome: SessionOutcome) {
        inner.session = None;
        match outcome {
            SessionOutcome::Merged(_) => {
                inner.damped = false;
                inner.has_unfinished = self.storage.head_commit_ids().len() > 1;
                inner.recheck = true;
            }
            SessionOutcome::Failed { retryable: true } => {
                let delay = inner.backoff.next_delay();
                inner.retry_at = Some(Instant::now() + delay);
            }
            SessionOutcome::Failed { retryable: false } => {
                // Resolved only by the next head-set change (or never, if the
                // external resolver stays broken).
                inner.wait_for_head_change = true;
            }
        }
    }
}

impl CommitWatcher for MergeResolver {
    fn on_new_commits(&self, _commits: &[Commit], source: CommitSource) {
        {
            let mut inner = self.lock();
            inner.last_source = source;
            inner.damped = false;
            inner.wait_for_head_change = false;
        }
        self.check_conflicts();
    }
}
