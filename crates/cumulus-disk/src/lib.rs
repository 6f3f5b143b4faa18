//! Cumulus Disk - storage targets for volume blocks
//!
//! This crate provides:
//! - The [`Disk`] capability contract and its shared [`DiskCore`] bookkeeping
//! - [`BackupDisk`], a virtual disk mirroring blocks onto two real disks
//! - Cached, self-refreshing readiness probes
//! - Concrete backends ([`LocalDisk`], [`MemoryDisk`]) and the [`DiskRegistry`]
//! - Free-space and throughput measurements used by block placement

pub mod backup;
pub mod credentials;
pub mod disk;
pub mod local;
pub mod memory;
pub mod readiness;
pub mod registry;
pub mod space;
pub mod transfer;

pub use backup::BackupDisk;
pub use credentials::Credentials;
pub use disk::{Disk, DiskCore, DownloadOutcome, ProviderSpace};
pub use local::LocalDisk;
pub use memory::{MemoryDisk, MemoryStore};
pub use readiness::{CachedReadiness, DiskReadiness, StaticReadiness, VirtualDiskReadiness};
pub use registry::{DiskConstructor, DiskContext, DiskRegistry, MemoryBackend};
pub use space::{compute_free_space, measure_throughput};
pub use transfer::{BlockTransfer, CompletionCallback};
