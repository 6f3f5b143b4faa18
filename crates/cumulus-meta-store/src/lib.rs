//! Cumulus Metadata Store - persistence for volumes, disks and files
//!
//! Two [`Repository`](cumulus_common::Repository) implementations:
//! [`MetaStore`], durable and backed by redb, and [`MemoryRepository`] for
//! tests and ephemeral runs.

pub mod memory;
pub mod store;
pub mod tables;

// Re-exports
pub use memory::MemoryRepository;
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
