//! Core types and plumbing shared by the recon pipeline: the scan data model,
//! the error taxonomy, caller input normalization, external tool invocation
//! and request pacing.

pub mod error;
pub mod input;
pub mod model;
pub mod ratelimiter;
pub mod tool;

pub use error::{ReconError, Result};
pub use model::*;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
