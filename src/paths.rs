//! Repository directory layout helpers.

use std::path::{Path, PathBuf};

use rand::RngCore;

/// The file holding the repository's stable identity.
pub(crate) fn name_path(root: &Path) -> PathBuf {
    root.join("name")
}

/// The file holding the device-set fingerprint for this repository.
pub(crate) fn fingerprint_path(root: &Path) -> PathBuf {
    root.join("fingerprint")
}

/// Sibling path the content directory is moved to before deletion, so a
/// crash mid-delete never leaves a half-valid store at the original path.
pub(crate) fn staging_path(root: &Path) -> PathBuf {
    let mut rng = rand::rng();
    let mut suffix = [0u8; 4];
    rng.fill_bytes(&mut suffix);
    let file_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string());
    root.with_file_name(format!(
        "{file_name}.staging-{:02x}{:02x}{:02x}{:02x}",
        suffix[0], suffix[1], suffix[2], suffix[3]
    ))
}

/// Base directory for configuration files.
///
/// Uses `FOLIO_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/folio` or
/// `~/.config/folio`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FOLIO_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("folio")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_is_a_sibling() {
        let root = PathBuf::from("/data/repos/alpha");
        let staging = staging_path(&root);
        assert_eq!(staging.parent(), root.parent());
        assert!(
            staging
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("alpha.staging-")
        );
    }

    #[test]
    fn staging_paths_differ_between_calls() {
        let root = PathBuf::from("/data/repos/alpha");
        assert_ne!(staging_path(&root), staging_path(&root));
    }
}
