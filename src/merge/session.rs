//! Merge sessions: the result provider handed to custom conflict resolvers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::Commit;
use crate::storage::PageStorage;

use super::diff::{DiffEntry, DiffToken, paginate};
use super::{MergeError, MergedValue, SessionOutcome, SettledHook, ValueSource};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Committing,
    Done,
    Disconnected,
}

struct SessionState {
    phase: Phase,
    decisions: BTreeMap<String, MergedValue>,
    merge_non_conflicting: bool,
    on_settled: Option<SettledHook>,
}

pub(crate) struct SessionCore {
    storage: Arc<dyn PageStorage>,
    left: Commit,
    right: Commit,
    diff: Vec<DiffEntry>,
    state: Mutex<SessionState>,
}

impl SessionCore {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("merge session lock poisoned")
    }

    /// Disconnect the session and report `outcome` to the resolver, unless
    /// the session already settled.
    fn settle_failed(&self, retryable: bool) {
        let hook = {
            let mut state = self.lock();
            if state.phase == Phase::Done || state.phase == Phase::Disconnected {
                return;
            }
            state.phase = Phase::Disconnected;
            state.on_settled.take()
        };
        if let Some(hook) = hook {
            hook(SessionOutcome::Failed { retryable });
        }
    }
}

/// Resolver-side handle for cancelling an in-flight session.
pub struct SessionHandle {
    core: Weak<SessionCore>,
}

impl SessionHandle {
    /// Abandon the session: the external resolver's provider goes dead, no
    /// outcome is reported. Storage is untouched.
    pub(crate) fn cancel(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let mut state = core.lock();
        if state.phase == Phase::Active {
            state.phase = Phase::Disconnected;
            state.on_settled = None;
        }
    }
}

/// Construct a session over an already-computed three-way diff.
pub(crate) fn create_session(
    storage: Arc<dyn PageStorage>,
    left: Commit,
    right: Commit,
    diff: Vec<DiffEntry>,
    on_settled: SettledHook,
) -> (MergeResultProvider, SessionHandle) {
    let core = Arc::new(SessionCore {
        storage,
        left,
        right,
        diff,
        state: Mutex::new(SessionState {
            phase: Phase::Active,
            decisions: BTreeMap::new(),
            merge_non_conflicting: false,
            on_settled: Some(on_settled),
        }),
    });
    let handle = SessionHandle {
        core: Arc::downgrade(&core),
    };
    (MergeResultProvider { core }, handle)
}

/// The result accumulator handed to an application conflict resolver.
///
/// Explicit decisions always take precedence over
/// `merge_non_conflicting_entries` for the same key, regardless of call
/// order. `done` applies the accumulated result as a single merge commit.
///
/// Dropping the provider without calling `done` counts as a disconnect: the
/// conflict stays unresolved.
pub struct MergeResultProvider {
    core: Arc<SessionCore>,
}

impl MergeResultProvider {
    /// One page of the full three-way diff; a returned token means more
    /// entries remain.
    pub fn get_full_diff(
        &self,
        token: Option<DiffToken>,
    ) -> Result<(Vec<DiffEntry>, Option<DiffToken>), MergeError> {
        self.check_active()?;
        Ok(paginate(&self.core.diff, token))
    }

    /// Like `get_full_diff`, restricted to keys both sides changed to
    /// different values.
    pub fn get_conflicting_diff(
        &self,
        token: Option<DiffToken>,
    ) -> Result<(Vec<DiffEntry>, Option<DiffToken>), MergeError> {
        self.check_active()?;
        let conflicting: Vec<DiffEntry> = self
            .core
            .diff
            .iter()
            .filter(|entry| entry.is_conflicting())
            .cloned()
            .collect();
        Ok(paginate(&conflicting, token))
    }

    /// Record explicit per-key decisions.
    ///
    /// A `Left`/`Right`/`Delete` decision naming a key absent from the diff
    /// fails the whole session: the provider disconnects and the conflict
    /// remains unresolved. `New` decisions may introduce fresh keys.
    pub fn merge(&self, decisions: Vec<MergedValue>) -> Result<(), MergeError> {
        self.check_active()?;
        for decision in &decisions {
            match decision.source {
                ValueSource::New => {
                    if decision.new_value.is_none() {
                        let key = decision.key.clone();
                        self.core.settle_failed(false);
                        return Err(MergeError::InvalidDecision {
                            key,
                            reason: "NEW decision carries no value",
                        });
                    }
                }
                ValueSource::Left | ValueSource::Right | ValueSource::Delete => {
                    if !self.core.diff.iter().any(|e| e.key == decision.key) {
                        let key = decision.key.clone();
                        self.core.settle_failed(false);
                        return Err(MergeError::KeyNotFound(key));
                    }
                }
            }
        }

        let mut state = self.core.lock();
        if state.phase != Phase::Active {
            return Err(MergeError::Disconnected);
        }
        for decision in decisions {
            state.decisions.insert(decision.key.clone(), decision);
        }
        Ok(())
    }

    /// Merge every key touched by exactly one side automatically.
    pub fn merge_non_conflicting_entries(&self) -> Result<(), MergeError> {
        let mut state = self.core.lock();
        if state.phase != Phase::Active {
            return Err(MergeError::Disconnected);
        }
        state.merge_non_conflicting = true;
        Ok(())
    }

    /// Apply the accumulated decisions as a single merge commit.
    pub fn done(&self) -> Result<(), MergeError> {
        let (decisions, merge_non_conflicting) = {
            let mut state = self.core.lock();
            if state.phase != Phase::Active {
                return Err(MergeError::Disconnected);
            }
            state.phase = Phase::Committing;
            (state.decisions.clone(), state.merge_non_conflicting)
        };

        match self.commit(decisions, merge_non_conflicting) {
            Ok(commit_id) => {
                let hook = {
                    let mut state = self.core.lock();
                    state.phase = Phase::Done;
                    state.on_settled.take()
                };
                if let Some(hook) = hook {
                    hook(SessionOutcome::Merged(commit_id));
                }
                Ok(())
            }
            Err(err) => {
                self.core
                    .settle_failed(err.transience().is_retryable());
                Err(err)
            }
        }
    }

    /// Build and commit the merge. The journal's base is the left (newer)
    /// tree, so unresolved conflicting keys default to the left side.
    fn commit(
        &self,
        decisions: BTreeMap<String, MergedValue>,
        merge_non_conflicting: bool,
    ) -> Result<crate::core::CommitId, MergeError> {
        let core = &self.core;
        let mut journal = core
            .storage
            .start_merge_commit(&core.left.id(), &core.right.id())?;

        if merge_non_conflicting {
            for entry in &core.diff {
                if entry.is_conflicting() || !entry.changed_right() || entry.changed_left() {
                    continue;
                }
                match &entry.right {
                    Some(value) => journal.put(entry.key.clone(), value.clone()),
                    None => journal.delete(entry.key.clone()),
                }
            }
        }

        for (key, decision) in &decisions {
            let value = match decision.source {
                ValueSource::New => decision.new_value.clone(),
                ValueSource::Delete => None,
                ValueSource::Left | ValueSource::Right => {
                    let entry = core
                        .diff
                        .iter()
                        .find(|e| &e.key == key)
                        .expect("side decisions were validated against the diff");
                    if decision.source == ValueSource::Left {
                        entry.left.clone()
                    } else {
                        entry.right.clone()
                    }
                }
            };
            match value {
                Some(value) => journal.put(key.clone(), value),
                None => journal.delete(key.clone()),
            }
        }

        let commit = core.storage.commit_journal(journal)?;
        Ok(commit.id())
    }

    fn check_active(&self) -> Result<(), MergeError> {
        if self.core.lock().phase == Phase::Active {
            Ok(())
        } else {
            Err(MergeError::Disconnected)
        }
    }
}

impl Drop for MergeResultProvider {
    fn drop(&mut self) {
        // Dropping without `done` is an external-resolver disconnect.
        self.core.settle_failed(false);
    }
}
