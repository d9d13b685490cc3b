//! Per-repository runtime: pages, resolvers, sync.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::cloud::CloudProvider;
use crate::config::SyncConfig;
use crate::core::{Commit, Entry, Fingerprint, PageId, RepositoryName};
use crate::merge::{MergeResolver, MergeStrategy};
use crate::paths;
use crate::storage::{JournalType, MemoryPageStorage, PageStorage, StorageError};
use crate::sync::{PageSync, SyncWatcherHandle, UserSync};

use super::RepositoryError;

/// Shared handle to an open repository.
pub type RepositoryHandle = Arc<LedgerRepository>;

/// One open repository: its pages and, when a cloud provider is attached,
/// the synchronization machinery.
///
/// Everything is driven cooperatively: callers (or a host loop) invoke
/// [`LedgerRepository::pump`] to process cloud notifications and due
/// retries.
pub struct LedgerRepository {
    root: PathBuf,
    name: RepositoryName,
    config: SyncConfig,
    cloud: Option<Arc<dyn CloudProvider>>,
    detached: AtomicBool,
    pages: Mutex<HashMap<PageId, Arc<PageRuntime>>>,
    user_sync: Option<Mutex<UserSync>>,
}

impl LedgerRepository {
    pub(crate) fn open(
        root: &Path,
        name: RepositoryName,
        cloud: Option<Arc<dyn CloudProvider>>,
        config: SyncConfig,
        on_version_mismatch: Box<dyn Fn() + Send>,
    ) -> Result<RepositoryHandle, RepositoryError> {
        fs::create_dir_all(root).map_err(|source| RepositoryError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let user_sync = match &cloud {
            Some(provider) => {
                let (fingerprint, is_new) = load_or_create_fingerprint(root)?;
                let mut sync = UserSync::new(
                    provider.device_set(),
                    fingerprint,
                    is_new,
                    config.backoff(),
                    on_version_mismatch,
                );
                sync.start();
                Some(Mutex::new(sync))
            }
            None => None,
        };

        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            name,
            config,
            cloud,
            detached: AtomicBool::new(false),
            pages: Mutex::new(HashMap::new()),
            user_sync,
        }))
    }

    pub fn name(&self) -> RepositoryName {
        self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Get or create the runtime for one page.
    pub fn get_page(&self, page_id: PageId) -> Result<Arc<PageRuntime>, RepositoryError> {
        self.check_detached()?;
        let mut pages = self.pages.lock().expect("pages lock poisoned");
        if let Some(page) = pages.get(&page_id) {
            return Ok(Arc::clone(page));
        }
        let page = PageRuntime::new(page_id, self.cloud.clone(), &self.config);
        pages.insert(page_id, Arc::clone(&page));
        Ok(page)
    }

    /// One cooperative step across the user sync and every open page.
    /// Returns true if any work was done.
    pub fn pump(&self) -> bool {
        if self.is_detached() {
            return false;
        }
        let mut worked = false;
        if let Some(user_sync) = &self.user_sync {
            worked |= user_sync.lock().expect("user sync lock poisoned").pump();
        }
        let pages: Vec<Arc<PageRuntime>> = self
            .pages
            .lock()
            .expect("pages lock poisoned")
            .values()
            .cloned()
            .collect();
        for page in pages {
            worked |= page.pump();
        }
        worked
    }

    /// Sever this repository from its clients without notifying them.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn check_detached(&self) -> Result<(), RepositoryError> {
        if self.is_detached() {
            Err(RepositoryError::Detached)
        } else {
            Ok(())
        }
    }
}

/// One page's storage, merge resolver and (optional) sync.
pub struct PageRuntime {
    storage: Arc<dyn PageStorage>,
    resolver: Arc<MergeResolver>,
    sync: Option<Mutex<PageSync>>,
}

impl PageRuntime {
    fn new(
        page_id: PageId,
        cloud: Option<Arc<dyn CloudProvider>>,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryPageStorage::with_inline_limit(
            page_id,
            config.inline_value_limit,
        ));
        let resolver = MergeResolver::new(Arc::clone(&storage), config.backoff());
        let sync = cloud.map(|provider| {
            let mut page_sync = PageSync::new(
                Arc::clone(&storage),
                provider.page_cloud(&page_id),
                config.backoff(),
                config.backoff(),
                config.inline_value_limit,
            );
            page_sync.start();
            Mutex::new(page_sync)
        });

        Arc::new(Self {
            storage,
            resolver,
            sync,
        })
    }

    pub fn storage(&self) -> &Arc<dyn PageStorage> {
        &self.storage
    }

    pub fn resolver(&self) -> &Arc<MergeResolver> {
        &self.resolver
    }

    /// Write one key on top of the newest head.
    pub fn put(&self, key: &str, value: Bytes) -> Result<Commit, StorageError> {
        let head = self.newest_head()?;
        let mut journal = self.storage.start_commit(&head, JournalType::Implicit)?;
        journal.put(key, value);
        self.storage.commit_journal(journal)
    }

    /// Delete one key on top of the newest head.
    pub fn delete(&self, key: &str) -> Result<Commit, StorageError> {
        let head = self.newest_head()?;
        let mut journal = self.storage.start_commit(&head, JournalType::Implicit)?;
        journal.delete(key);
        self.storage.commit_journal(journal)
    }

    /// Read one key from the newest head's snapshot.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let head = self.newest_head()?;
        Ok(self.storage.snapshot(&head)?.get(key))
    }

    /// All entries of the newest head's snapshot, in key order.
    pub fn entries(&self) -> Result<Vec<Entry>, StorageError> {
        let head = self.newest_head()?;
        Ok(self.storage.snapshot(&head)?.entries())
    }

    pub fn head_count(&self) -> usize {
        self.storage.head_commit_ids().len()
    }

    pub fn set_merge_strategy(&self, strategy: Option<Box<dyn MergeStrategy>>) {
        self.resolver.set_merge_strategy(strategy);
    }

    /// Register a sync state watcher; `None` when the page has no cloud.
    pub fn set_sync_watcher(&self) -> Option<SyncWatcherHandle> {
        self.sync
            .as_ref()
            .map(|sync| sync.lock().expect("page sync lock poisoned").add_sync_watcher())
    }

    /// One cooperative step for this page. Returns true if work was done.
    pub fn pump(&self) -> bool {
        let mut worked = false;
        if let Some(sync) = &self.sync {
            worked |= sync.lock().expect("page sync lock poisoned").pump();
        }
        worked |= self.resolver.pump();
        worked
    }

    fn newest_head(&self) -> Result<crate::core::CommitId, StorageError> {
        self.storage
            .head_commit_ids()
            .last()
            .copied()
            .ok_or(StorageError::CommitNotFound(crate::core::CommitId::root()))
    }
}

fn load_or_create_fingerprint(root: &Path) -> Result<(Fingerprint, bool), RepositoryError> {
    let path = paths::fingerprint_path(root);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok((Fingerprint::parse_hex(&contents)?, false)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let fingerprint = Fingerprint::random();
            fs::write(&path, fingerprint.to_hex()).map_err(|source| RepositoryError::Io {
                path: path.clone(),
                source,
            })?;
            Ok((fingerprint, true))
        }
        Err(source) => Err(RepositoryError::Io { path, source }),
    }
}
