//! SignalCraft Core Types
//!
//! Wire-level building blocks shared by the relay and its clients: addresses,
//! path ids, cookies, combined sequence numbers, nonces, the message catalogue,
//! close codes and task negotiation.

mod close;
mod config;
mod error;
pub mod hex_serde;
mod message;
mod nonce;
mod task;
mod types;

pub use close::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use nonce::*;
pub use task::*;
pub use types::*;
