//! Repository factory: dedup by stable identity, erasure recovery.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::core::RepositoryName;
use crate::paths;

use super::container::{BindTicket, RepositoryContainer};
use super::repository::{LedgerRepository, RepositoryHandle};
use super::RepositoryError;

/// Hands out repository handles, deduplicating concurrent requests for the
/// same content directory.
///
/// Identity is the repository name stored in the directory's `name` file
/// (generated and persisted on first open), so the same path always
/// resolves to the same logical repository, across process restarts and
/// independent of the path string.
pub struct RepositoryFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    config: Config,
    registry: Mutex<HashMap<RepositoryName, RepositoryContainer>>,
}

enum Resolution {
    Ticket(BindTicket),
    Initialize,
}

impl RepositoryFactory {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                config,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open (or join the opening of) the repository at `path`.
    ///
    /// At most one repository runtime is ever constructed per distinct name;
    /// requests arriving while initialization is in flight queue and resolve
    /// together with the single resulting status.
    pub fn get_repository(
        &self,
        path: &Path,
        cloud: Option<Arc<dyn CloudProvider>>,
    ) -> Result<RepositoryHandle, RepositoryError> {
        fs::create_dir_all(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = read_or_create_name(path)?;

        let resolution = {
            let mut registry = self.lock_registry();
            match registry.entry(name) {
                Entry::Occupied(mut occupied) => Resolution::Ticket(occupied.get_mut().bind()),
                Entry::Vacant(vacant) => {
                    vacant.insert(RepositoryContainer::new());
                    Resolution::Initialize
                }
            }
        };

        match resolution {
            Resolution::Ticket(ticket) => ticket.wait(),
            Resolution::Initialize => {
                let result = self.initialize(path, name, cloud);
                let for_container = match &result {
                    Ok(handle) => Ok(handle.clone()),
                    Err(err) => Err(err.to_string()),
                };
                let mut registry = self.lock_registry();
                if let Some(container) = registry.get_mut(&name) {
                    container.set_repository(for_container);
                }
                result
            }
        }
    }

    fn initialize(
        &self,
        path: &Path,
        name: RepositoryName,
        cloud: Option<Arc<dyn CloudProvider>>,
    ) -> Result<RepositoryHandle, RepositoryError> {
        let factory: Weak<FactoryInner> = Arc::downgrade(&self.inner);
        let root = path.to_path_buf();
        let on_version_mismatch = Box::new(move || {
            if let Some(inner) = factory.upgrade() {
                recover_from_erasure(&inner, name, &root);
            }
        });
        LedgerRepository::open(
            path,
            name,
            cloud,
            self.inner.config.sync.clone(),
            on_version_mismatch,
        )
    }

    fn lock_registry(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<RepositoryName, RepositoryContainer>> {
        self.inner.registry.lock().expect("registry lock poisoned")
    }
}

/// The cloud confirmed its data was erased since this device last synced.
/// Reconciling against a wiped history is not attempted: the repository is
/// detached, its on-disk content removed, and the registry entry dropped so
/// the next open recreates everything from scratch.
fn recover_from_erasure(inner: &Arc<FactoryInner>, name: RepositoryName, root: &Path) {
    tracing::warn!(
        repository = %name,
        path = %root.display(),
        "remote store erased; wiping local repository state"
    );
    let container = inner
        .registry
        .lock()
        .expect("registry lock poisoned")
        .remove(&name);
    if let Some(mut container) = container {
        container.detach();
    }
    if let Err(err) = wipe_directory(root) {
        tracing::error!(
            path = %root.display(),
            error = %err,
            "failed to remove repository contents"
        );
    }
}

/// Move the directory aside, then delete it. A crash between the two steps
/// leaves a clean original path plus an orphaned staging directory, never a
/// half-deleted store where the repository used to be.
fn wipe_directory(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let staging = paths::staging_path(root);
    fs::rename(root, &staging)?;
    fs::remove_dir_all(&staging)
}

fn read_or_create_name(path: &Path) -> Result<RepositoryName, RepositoryError> {
    let name_path = paths::name_path(path);
    match fs::read_to_string(&name_path) {
        Ok(contents) => Ok(RepositoryName::parse_hex(&contents)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let name = RepositoryName::random();
            let io_err = |source: io::Error| RepositoryError::Io {
                path: name_path.clone(),
                source,
            };
            let temp = tempfile::NamedTempFile::new_in(path).map_err(io_err)?;
            fs::write(temp.path(), name.to_hex()).map_err(io_err)?;
            match temp.persist_noclobber(&name_path) {
                Ok(_) => Ok(name),
                // Lost the race: someone else persisted a name first.
                Err(_) => {
                    let contents = fs::read_to_string(&name_path).map_err(io_err)?;
                    Ok(RepositoryName::parse_hex(&contents)?)
                }
            }
        }
        Err(source) => Err(RepositoryError::Io {
            path: name_path,
            source,
        }),
    }
}
