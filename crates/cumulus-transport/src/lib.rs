//! Cumulus Transport - hot object residency and transfer orchestration
//!
//! This crate provides:
//! - [`LeaseScheduler`]: a single expiry task per cache
//! - [`InstanceCache`]: reference-counted, lease-expiring object cache
//! - [`Transport`]: active volumes, in-flight files, uploads and downloads

pub mod cache;
pub mod lease;
pub mod transport;

pub use cache::InstanceCache;
pub use lease::LeaseScheduler;
pub use transport::Transport;
