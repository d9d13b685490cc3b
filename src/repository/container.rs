//! Request deduplication while a repository initializes.

use crossbeam::channel::{Receiver, Sender, bounded};

use super::repository::RepositoryHandle;
use super::RepositoryError;

/// Why a container is in the failed state. Kept separate from
/// [`RepositoryError`] so every queued requester gets its own error value.
#[derive(Clone, Debug)]
enum FailureKind {
    Detached,
    Initialization(String),
}

impl FailureKind {
    fn to_error(&self) -> RepositoryError {
        match self {
            FailureKind::Detached => RepositoryError::Detached,
            FailureKind::Initialization(reason) => RepositoryError::InitializationFailed {
                reason: reason.clone(),
            },
        }
    }
}

enum State {
    /// Initialization in flight; requests queue in FIFO order.
    Pending(Vec<Sender<Result<RepositoryHandle, RepositoryError>>>),
    Ready(RepositoryHandle),
    Failed(FailureKind),
}

/// Holds at most one repository and the requests that arrived before its
/// initialization finished.
pub struct RepositoryContainer {
    state: State,
}

impl RepositoryContainer {
    pub fn new() -> Self {
        Self {
            state: State::Pending(Vec::new()),
        }
    }

    /// Request a handle. Resolves immediately when the container is ready or
    /// failed, otherwise once `set_repository` runs.
    pub fn bind(&mut self) -> BindTicket {
        let (tx, rx) = bounded(1);
        match &mut self.state {
            State::Pending(queue) => queue.push(tx),
            State::Ready(handle) => {
                let _ = tx.send(Ok(handle.clone()));
            }
            State::Failed(kind) => {
                let _ = tx.send(Err(kind.to_error()));
            }
        }
        BindTicket { rx }
    }

    /// Transition out of pending; called exactly once. All queued requests
    /// drain in arrival order with the single resulting status.
    pub fn set_repository(&mut self, result: Result<RepositoryHandle, String>) {
        debug_assert!(
            matches!(self.state, State::Pending(_)),
            "set_repository called twice"
        );
        let queue = match std::mem::replace(&mut self.state, State::Pending(Vec::new())) {
            State::Pending(queue) => queue,
            other => {
                self.state = other;
                return;
            }
        };

        let new_state = match result {
            Ok(handle) => State::Ready(handle),
            Err(reason) => State::Failed(FailureKind::Initialization(reason)),
        };

        for tx in queue {
            let response = match &new_state {
                State::Ready(handle) => Ok(handle.clone()),
                State::Failed(kind) => Err(kind.to_error()),
                State::Pending(_) => unreachable!("new_state is never pending"),
            };
            let _ = tx.send(response);
        }
        self.state = new_state;
    }

    /// Sever live client handles without notifying them and fail every
    /// future request until the container is re-registered. In-flight calls
    /// race the teardown; callers observe it as an ordinary disconnect.
    pub fn detach(&mut self) {
        if let State::Ready(handle) = &self.state {
            handle.detach();
        }
        if let State::Pending(queue) =
            std::mem::replace(&mut self.state, State::Failed(FailureKind::Detached))
        {
            // Queued requests are dropped with the failure status.
            for tx in queue {
                let _ = tx.send(Err(RepositoryError::Detached));
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed(_))
    }
}

impl Default for RepositoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued bind request's receiving end.
pub struct BindTicket {
    rx: Receiver<Result<RepositoryHandle, RepositoryError>>,
}

impl BindTicket {
    /// Wait for the container to settle.
    pub fn wait(self) -> Result<RepositoryHandle, RepositoryError> {
        self.rx
            .recv()
            .unwrap_or(Err(RepositoryError::Detached))
    }

    /// Non-blocking probe, for callers multiplexing several requests.
    pub fn try_wait(&self) -> Option<Result<RepositoryHandle, RepositoryError>> {
        self.rx.try_recv().ok()
    }
}
