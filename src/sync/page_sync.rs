//! Wiring of both sync directions for one page.

use std::sync::{Arc, Weak};

use crate::cloud::PageCloud;
use crate::storage::{CommitWatcher, PageStorage};

use super::backoff::Backoff;
use super::page_download::PageDownload;
use super::page_upload::{PageUpload, UploadTrigger};
use super::state::SyncStateTracker;
use super::watcher_set::SyncWatcherHandle;

pub struct PageSync {
    download: PageDownload,
    upload: PageUpload,
    tracker: Arc<SyncStateTracker>,
    // Keeps the registered commit watcher alive for the sync's lifetime.
    _trigger: Arc<UploadTrigger>,
}

impl PageSync {
    pub fn new(
        storage: Arc<dyn PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        download_backoff: Box<dyn Backoff>,
        upload_backoff: Box<dyn Backoff>,
        inline_limit: usize,
    ) -> Self {
        let tracker = Arc::new(SyncStateTracker::new());
        let download = PageDownload::new(
            Arc::clone(&storage),
            Arc::clone(&page_cloud),
            Arc::clone(&tracker),
            download_backoff,
        );
        let (upload, trigger) = PageUpload::new(
            Arc::clone(&storage),
            page_cloud,
            Arc::clone(&tracker),
            upload_backoff,
            inline_limit,
        );
        let trigger_dyn: Arc<dyn CommitWatcher> = trigger.clone();
        let weak: Weak<dyn CommitWatcher> = Arc::downgrade(&trigger_dyn);
        storage.register_commit_watcher(weak);

        Self {
            download,
            upload,
            tracker,
            _trigger: trigger,
        }
    }

    pub fn start(&mut self) {
        self.download.start();
        self.upload.start();
    }

    /// One cooperative step: drain download notifications and retries, then
    /// give the upload a chance. Returns true if any work was done.
    pub fn pump(&mut self) -> bool {
        let downloaded = self.download.pump();
        let uploaded = self.upload.pump();
        downloaded || uploaded
    }

    pub fn is_idle(&self) -> bool {
        self.download.is_idle() && self.upload.is_idle()
    }

    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    pub fn add_sync_watcher(&self) -> SyncWatcherHandle {
        self.tracker.add_sync_watcher()
    }
}
