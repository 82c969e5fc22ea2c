//! SignalCraft Keystore
//!
//! Long-term key files and path utilities for the relay.
//!
//! ## Features
//!
//! - X25519 key file loading/generation (hex encoded secret key)
//! - Owner-only permissions on newly written key files
//! - Path expansion (`~`, `~/...`)

mod keypair;
mod paths;

pub use keypair::{
    default_key_path, load_keypair, load_or_generate_keypair, save_keypair, KeystoreError,
};
pub use paths::{default_config_dir, default_keystore_dir, expand_path};

pub type Result<T> = std::result::Result<T, KeystoreError>;
