//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::memory::DEFAULT_INLINE_VALUE_LIMIT;
use crate::sync::{Backoff, ExponentialBackoff};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// First retry delay after a transient failure.
    pub backoff_base_ms: u64,
    /// Retry delays double up to this ceiling.
    pub backoff_max_ms: u64,
    /// Values larger than this are offloaded to the cloud object store.
    pub inline_value_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            inline_value_limit: DEFAULT_INLINE_VALUE_LIMIT,
        }
    }
}

impl SyncConfig {
    pub(crate) fn backoff(&self) -> Box<dyn Backoff> {
        Box::new(ExponentialBackoff::new(
            std::time::Duration::from_millis(self.backoff_base_ms),
            std::time::Duration::from_millis(self.backoff_max_ms),
        ))
    }

    /// Immediate-retry variant used by deterministic tests.
    pub fn immediate() -> Self {
        Self {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..Self::default()
        }
    }
}

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load() -> Result<Config, String> {
    let path = config_path();
    let contents = fs::read_to_string(&path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    toml::from_str(&contents).map_err(|e| format!("failed to parse {}: {e}", path.display()))
}

pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load() {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(&path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    }
    let contents =
        toml::to_string_pretty(cfg).map_err(|e| format!("failed to render config: {e}"))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), String> {
    let dir = path
        .parent()
        .ok_or_else(|| "config path missing parent directory".to_string())?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| format!("failed to create temp file in {}: {e}", dir.display()))?;
    fs::write(temp.path(), data).map_err(|e| format!("failed to write config temp file: {e}"))?;
    temp.persist(path)
        .map_err(|e| format!("failed to persist config to {}: {e}", path.display()))?;
    Ok(())
}
