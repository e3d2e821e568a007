//! Recon session: scan a batch of devices, crawl the HTTP surface of every
//! open (or forced) port, and persist the per-host results.

pub mod config;
pub mod report;
pub mod session;

pub use config::{load_config, load_endpoints, Config};
pub use session::{ReconSession, SessionOptions};
