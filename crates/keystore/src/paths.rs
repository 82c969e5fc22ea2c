//! Filesystem locations

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the home directory.
///
/// Paths without a tilde, and paths when no home directory is known, are
/// returned unchanged.
pub fn expand_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// `~/.signalcraft`, or `./.signalcraft` without a home directory
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".signalcraft")
}

pub fn default_keystore_dir() -> PathBuf {
    default_config_dir().join("keys")
}
