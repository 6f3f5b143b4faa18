//! Cumulus Volume - logical volumes over heterogeneous disks
//!
//! This crate provides:
//! - Files and their blocks
//! - Block placement strategies (round-robin, priority, throughput)
//! - The [`Volume`] aggregate: disk set, RAID1 pairing, block splitting
//! - AES-256-GCM block encryption

pub mod block;
pub mod crypto;
pub mod file;
pub mod partitioner;
pub mod volume;

pub use block::Block;
pub use crypto::BlockCipher;
pub use file::{Directory, File, FileMeta, RegularFile};
pub use partitioner::{BalancedPartitioner, Candidate, FitnessPartitioner, Partitioner};
pub use volume::{Placement, Volume};
