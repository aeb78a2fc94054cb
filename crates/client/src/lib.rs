//! ciphrtxt client
//!
//! Relay-facing client pieces: NAK credentials, onion request wrapping, and
//! the per-relay message store with its header cache.

mod config;
mod nak;
mod onion;
mod store;

pub use config::*;
pub use nak::*;
pub use onion::*;
pub use store::*;
