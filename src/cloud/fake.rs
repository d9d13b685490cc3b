//! In-memory cloud provider.
//!
//! Deterministic stand-in for a remote transport: commit logs and object
//! stores per page, fingerprints, watcher push, and scripted transient
//! failures for exercising retry paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam::channel::Sender;

use crate::core::{CommitId, Fingerprint, ObjectHash, PageId, PositionToken};

use super::{
    CloudError, CloudProvider, DeviceSet, DeviceSetEvent, PageCloud, PageCloudEvent, RemoteCommit,
};

/// Which fake operation the next scripted failure applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailOp {
    GetCommits,
    AddCommits,
    GetObject,
    AddObject,
    CheckFingerprint,
}

#[derive(Default)]
struct PageState {
    log: Vec<RemoteCommit>,
    known: HashSet<CommitId>,
    objects: HashMap<ObjectHash, Bytes>,
    watchers: Vec<Sender<PageCloudEvent>>,
}

#[derive(Default)]
struct State {
    pages: HashMap<PageId, PageState>,
    fingerprints: HashSet<Fingerprint>,
    fingerprint_watchers: Vec<Sender<DeviceSetEvent>>,
    fail_next: HashMap<FailOp, u32>,
}

/// Shared in-memory cloud; clone handles freely across "devices".
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `count` calls of `op` to fail with a network error.
    pub fn fail_next(&self, op: FailOp, count: u32) {
        self.lock().fail_next.insert(op, count);
    }

    /// Wipe the whole remote store and notify fingerprint watchers, as if
    /// the user erased their cloud data from another device.
    pub fn erase(&self) {
        let watchers = {
            let mut state = self.lock();
            state.pages.clear();
            state.fingerprints.clear();
            std::mem::take(&mut state.fingerprint_watchers)
        };
        for watcher in watchers {
            let _ = watcher.send(DeviceSetEvent::Erased);
        }
    }

    /// Number of commits the cloud holds for a page.
    pub fn commit_count(&self, page: &PageId) -> usize {
        self.lock().pages.get(page).map_or(0, |p| p.log.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake cloud lock poisoned")
    }
}

impl State {
    fn take_failure(&mut self, op: FailOp) -> Result<(), CloudError> {
        if let Some(count) = self.fail_next.get_mut(&op)
            && *count > 0
        {
            *count -= 1;
            return Err(CloudError::Network(format!("scripted failure for {op:?}")));
        }
        Ok(())
    }
}

fn position_of(index: usize) -> PositionToken {
    PositionToken::new(index.to_string().into_bytes())
}

fn parse_position(token: Option<&PositionToken>) -> Result<usize, CloudError> {
    let Some(token) = token else {
        return Ok(0);
    };
    std::str::from_utf8(token.as_bytes())
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CloudError::Internal("malformed position token".to_string()))
}

struct FakePageCloud {
    page: PageId,
    cloud: FakeCloud,
}

impl PageCloud for FakePageCloud {
    fn add_commits(&self, commits: Vec<RemoteCommit>) -> Result<(), CloudError> {
        let (fresh, position, watchers) = {
            let mut state = self.cloud.lock();
            state.take_failure(FailOp::AddCommits)?;
            let page = state.pages.entry(self.page).or_default();

            let fresh: Vec<RemoteCommit> = commits
                .into_iter()
                .filter(|commit| page.known.insert(commit.id))
                .collect();
            page.log.extend(fresh.iter().cloned());
            let position = position_of(page.log.len());
            (fresh, position, page.watchers.clone())
        };

        if !fresh.is_empty() {
            let mut dead = Vec::new();
            for (index, watcher) in watchers.iter().enumerate() {
                let event = PageCloudEvent::NewCommits {
                    commits: fresh.clone(),
                    position: position.clone(),
                };
                if watcher.send(event).is_err() {
                    dead.push(index);
                }
            }
            if !dead.is_empty() {
                let mut state = self.cloud.lock();
                if let Some(page) = state.pages.get_mut(&self.page) {
                    for index in dead.into_iter().rev() {
                        if index < page.watchers.len() {
                            page.watchers.remove(index);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn get_commits(
        &self,
        min_position: Option<&PositionToken>,
    ) -> Result<(Vec<RemoteCommit>, Option<PositionToken>), CloudError> {
        let mut state = self.cloud.lock();
        state.take_failure(FailOp::GetCommits)?;
        let from = parse_position(min_position)?;
        let Some(page) = state.pages.get(&self.page) else {
            return Ok((Vec::new(), None));
        };
        if page.log.is_empty() {
            return Ok((Vec::new(), None));
        }
        let from = from.min(page.log.len());
        let commits = page.log[from..].to_vec();
        Ok((commits, Some(position_of(page.log.len()))))
    }

    fn add_object(&self, hash: ObjectHash, bytes: Bytes) -> Result<(), CloudError> {
        let mut state = self.cloud.lock();
        state.take_failure(FailOp::AddObject)?;
        state
            .pages
            .entry(self.page)
            .or_default()
            .objects
            .insert(hash, bytes);
        Ok(())
    }

    fn get_object(&self, hash: &ObjectHash) -> Result<Bytes, CloudError> {
        let mut state = self.cloud.lock();
        state.take_failure(FailOp::GetObject)?;
        state
            .pages
            .get(&self.page)
            .and_then(|page| page.objects.get(hash))
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    fn set_watcher(
        &self,
        min_position: Option<&PositionToken>,
        watcher: Sender<PageCloudEvent>,
    ) -> Result<(), CloudError> {
        let from = parse_position(min_position)?;
        let mut state = self.cloud.lock();
        let page = state.pages.entry(self.page).or_default();

        // Deliver the backlog past the position before registering, so the
        // watcher never misses commits appended in between.
        if from < page.log.len() {
            let event = PageCloudEvent::NewCommits {
                commits: page.log[from..].to_vec(),
                position: position_of(page.log.len()),
            };
            let _ = watcher.send(event);
        }
        page.watchers.push(watcher);
        Ok(())
    }
}

struct FakeDeviceSet {
    cloud: FakeCloud,
}

impl DeviceSet for FakeDeviceSet {
    fn check_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), CloudError> {
        let mut state = self.cloud.lock();
        state.take_failure(FailOp::CheckFingerprint)?;
        if state.fingerprints.contains(fingerprint) {
            Ok(())
        } else {
            Err(CloudError::Erased)
        }
    }

    fn set_fingerprint(&self, fingerprint: Fingerprint) -> Result<(), CloudError> {
        self.cloud.lock().fingerprints.insert(fingerprint);
        Ok(())
    }

    fn erase_all_fingerprints(&self) -> Result<(), CloudError> {
        self.cloud.erase();
        Ok(())
    }

    fn watch_fingerprint(
        &self,
        fingerprint: Fingerprint,
        watcher: Sender<DeviceSetEvent>,
    ) -> Result<(), CloudError> {
        let mut state = self.cloud.lock();
        if !state.fingerprints.contains(&fingerprint) {
            return Err(CloudError::Erased);
        }
        state.fingerprint_watchers.push(watcher);
        Ok(())
    }
}

impl CloudProvider for FakeCloud {
    fn page_cloud(&self, page: &PageId) -> Arc<dyn PageCloud> {
        Arc::new(FakePageCloud {
            page: *page,
            cloud: self.clone(),
        })
    }

    fn device_set(&self) -> Arc<dyn DeviceSet> {
        Arc::new(FakeDeviceSet {
            cloud: self.clone(),
        })
    }
}
