//! Per-repository sync orchestration and cloud-erasure detection.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Receiver;

use crate::cloud::{CloudError, DeviceSet, DeviceSetEvent};
use crate::core::Fingerprint;

use super::backoff::Backoff;

/// Owns the device-set fingerprint handshake for one repository.
///
/// On start the fingerprint is checked against the cloud (or set, for a
/// fingerprint this device just generated). A missing fingerprint means the
/// remote store was wiped since we last synced: the orchestrator then fires
/// `on_version_mismatch` exactly once, and the owning factory performs the
/// local wipe-and-reopen recovery.
pub struct UserSync {
    device_set: Arc<dyn DeviceSet>,
    fingerprint: Fingerprint,
    fingerprint_is_new: bool,
    backoff: Box<dyn Backoff>,
    on_version_mismatch: Box<dyn Fn() + Send>,
    events: Option<Receiver<DeviceSetEvent>>,
    retry_at: Option<Instant>,
    erased: bool,
}

impl UserSync {
    pub fn new(
        device_set: Arc<dyn DeviceSet>,
        fingerprint: Fingerprint,
        fingerprint_is_new: bool,
        backoff: Box<dyn Backoff>,
        on_version_mismatch: Box<dyn Fn() + Send>,
    ) -> Self {
        Self {
            device_set,
            fingerprint,
            fingerprint_is_new,
            backoff,
            on_version_mismatch,
            events: None,
            retry_at: None,
            erased: false,
        }
    }

    /// Begin the fingerprint handshake. Non-blocking beyond the cloud calls
    /// themselves; transient failures are retried from `pump`.
    pub fn start(&mut self) {
        self.handshake();
    }

    /// Process due retries and fingerprint watcher events. Returns true if
    /// any work was done.
    pub fn pump(&mut self) -> bool {
        let mut worked = false;

        if let Some(at) = self.retry_at
            && Instant::now() >= at
        {
            self.retry_at = None;
            worked = true;
            self.handshake();
        }

        loop {
            let Some(events) = &self.events else { break };
            let Ok(event) = events.try_recv() else { break };
            worked = true;
            match event {
                DeviceSetEvent::Erased => self.version_mismatch(),
            }
        }

        worked
    }

    /// True once cloud erasure was detected; the repository is unusable
    /// until the factory recreates it.
    pub fn is_erased(&self) -> bool {
        self.erased
    }

    fn handshake(&mut self) {
        if self.erased {
            return;
        }

        let result = if self.fingerprint_is_new {
            self.device_set.set_fingerprint(self.fingerprint)
        } else {
            self.device_set.check_fingerprint(&self.fingerprint)
        };

        match result {
            Ok(()) => {
                self.backoff.reset();
                self.fingerprint_is_new = false;
                self.watch();
            }
            Err(CloudError::Erased) => self.version_mismatch(),
            Err(err) if err.transience().is_retryable() => {
                tracing::warn!(error = %err, "fingerprint handshake failed, retrying");
                self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            }
            Err(err) => {
                tracing::error!(error = %err, "fingerprint handshake failed permanently");
            }
        }
    }

    fn watch(&mut self) {
        let (tx, rx) = crossbeam::channel::unbounded();
        match self.device_set.watch_fingerprint(self.fingerprint, tx) {
            Ok(()) => self.events = Some(rx),
            Err(CloudError::Erased) => self.version_mismatch(),
            Err(err) => {
                tracing::warn!(error = %err, "fingerprint watch failed, retrying");
                self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            }
        }
    }

    fn version_mismatch(&mut self) {
        if self.erased {
            return;
        }
        self.erased = true;
        self.events = None;
        self.retry_at = None;
        tracing::warn!(
            fingerprint = %self.fingerprint.to_hex(),
            "cloud reports the remote store was erased"
        );
        (self.on_version_mismatch)();
    }
}
