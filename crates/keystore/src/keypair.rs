//! Relay long-term key files
//!
//! A key file holds the 32-byte X25519 secret key as 64 hex characters,
//! optionally followed by a newline.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use signalcraft_crypto::EncryptionKeypair;

use crate::paths::default_keystore_dir;
use crate::Result;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read key file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write key file {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Invalid key file {path:?}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("Key file already exists: {0:?}")]
    AlreadyExists(PathBuf),
}

/// `~/.signalcraft/keys/relay.key`
pub fn default_key_path() -> PathBuf {
    default_keystore_dir().join("relay.key")
}

/// Read an existing key file
pub fn load_keypair(path: &Path) -> Result<EncryptionKeypair> {
    let content = fs::read_to_string(path).map_err(|source| KeystoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| KeystoreError::InvalidKey {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = hex::decode(content.trim()).map_err(|e| invalid(e.to_string()))?;
    EncryptionKeypair::from_secret_slice(&bytes).map_err(|e| invalid(e.to_string()))
}

/// Write `keypair` to a new file. Refuses to overwrite.
pub fn save_keypair(path: &Path, keypair: &EncryptionKeypair) -> Result<()> {
    if path.exists() {
        return Err(KeystoreError::AlreadyExists(path.to_path_buf()));
    }
    let write_err = |source| KeystoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let mut content = hex::encode(keypair.secret_key_bytes());
    content.push('\n');
    write_private(path, content.as_bytes()).map_err(write_err)
}

/// Load the key at `path`, generating and saving a new one if missing
pub fn load_or_generate_keypair(path: &Path) -> Result<EncryptionKeypair> {
    if path.exists() {
        let keypair = load_keypair(path)?;
        info!("Loaded relay key from {:?}", path);
        return Ok(keypair);
    }
    let keypair = EncryptionKeypair::generate();
    save_keypair(path, &keypair)?;
    info!("Generated new relay key at {:?}", path);
    Ok(keypair)
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("relay.key");

        let generated = load_or_generate_keypair(&path).unwrap();
        assert!(path.exists());
        let loaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(generated.public_key_bytes(), loaded.public_key_bytes());
    }

    #[test]
    fn test_file_is_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        let keypair = EncryptionKeypair::generate();
        save_keypair(&path, &keypair).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), hex::encode(keypair.secret_key_bytes()));
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        load_or_generate_keypair(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_default_key_path() {
        assert!(default_key_path().ends_with("keys/relay.key"));
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        save_keypair(&path, &EncryptionKeypair::generate()).unwrap();
        let err = save_keypair(&path, &EncryptionKeypair::generate()).unwrap_err();
        assert!(matches!(err, KeystoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_invalid_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        fs::write(&path, "not hex").unwrap();
        let err = load_keypair(&path).unwrap_err();
        assert!(matches!(err, KeystoreError::InvalidKey { .. }));
    }

    #[test]
    fn test_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        fs::write(&path, hex::encode([7u8; 16])).unwrap();
        assert!(load_keypair(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_keypair(&dir.path().join("absent.key")).unwrap_err();
        assert!(matches!(err, KeystoreError::Read { .. }));
    }
}
