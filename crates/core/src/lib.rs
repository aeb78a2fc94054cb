//! ciphrtxt core
//!
//! Curve context and secp256k1 scalar/point plumbing shared by the key,
//! message, and client crates.

mod context;
mod ec;
mod error;

pub use context::*;
pub use ec::*;
pub use error::*;

// Re-exported so downstream crates agree on arithmetic types without
// naming k256 themselves.
pub use k256::{AffinePoint, NonZeroScalar, ProjectivePoint, Scalar};
