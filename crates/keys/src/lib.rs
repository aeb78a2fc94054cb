//! ciphrtxt keys
//!
//! Time-rotating secp256k1 identity keys, deterministic topic keys, and the
//! peripheral base58check wallet address encoders.

mod rotating;
mod topic;
mod wallet;

pub use rotating::*;
pub use topic::*;
pub use wallet::*;
