//! SignalCraft Cryptography
//!
//! X25519 key agreement, XChaCha20-Poly1305 boxes and the per-connection
//! session state that enforces cookie and sequence number rules.

mod encrypt;
mod keys;
mod session;

pub use encrypt::*;
pub use keys::*;
pub use session::*;
