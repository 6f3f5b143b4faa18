//! Cumulus Common - Shared types and utilities
//!
//! This crate provides the identifiers, settings enums, persistence records,
//! error definitions and small utilities used across all Cumulus components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod records;
pub mod repository;
pub mod types;

pub use checksum::content_checksum;
pub use config::Config;
pub use error::{Error, Result};
pub use records::{BlockRecord, DiskRecord, FileRecord, ProviderRecord, VolumeRecord};
pub use repository::{Record, Repository, RepositoryExt};
pub use types::*;

/// Default size of a volume block: 8 MiB
pub const DEFAULT_VOLUME_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
