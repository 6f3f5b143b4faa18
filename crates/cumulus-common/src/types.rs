//! Core type definitions for Cumulus
//!
//! Identifiers for every persisted entity, plus the small enums that select
//! volume behaviour (redundancy, encryption, block placement).

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The all-zero identifier
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a volume
    VolumeId
);
uuid_id!(
    /// Unique identifier for a disk, real or virtual
    DiskId
);
uuid_id!(
    /// Unique identifier for a file or directory
    FileId
);
uuid_id!(
    /// Unique identifier for a block of a file
    BlockId
);
uuid_id!(
    /// Unique identifier for a user
    UserId
);
uuid_id!(
    /// Unique identifier for a storage provider entry
    ProviderId
);

/// Kind of backend a disk talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    Sftp,
    GDrive,
    OneDrive,
    Ftp,
    /// Virtual mirrored pair of two real disks
    Raid1,
    /// Directory on a locally mounted filesystem
    Local,
    /// Process memory, for tests and ephemeral runs
    Memory,
}

impl ProviderType {
    pub const ALL: [Self; 7] = [
        Self::Sftp,
        Self::GDrive,
        Self::OneDrive,
        Self::Ftp,
        Self::Raid1,
        Self::Local,
        Self::Memory,
    ];

    #[must_use]
    pub const fn is_virtual(self) -> bool {
        matches!(self, Self::Raid1)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sftp => "sftp",
            Self::GDrive => "gdrive",
            Self::OneDrive => "onedrive",
            Self::Ftp => "ftp",
            Self::Raid1 => "raid1",
            Self::Local => "local",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Redundancy mode of a volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    /// Every block is stored once
    #[default]
    NoBackup,
    /// Disks are paired into mirrored virtual disks
    Raid1,
}

/// Encryption applied to block content before it leaves the process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    #[default]
    NoEncryption,
    /// AES-256-GCM with a random nonce per block
    Aes256,
}

/// Strategy used to pick the disk that receives the next block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    /// Round-robin over the disk set
    #[default]
    Balanced,
    /// Highest fitness first (oldest disk by default)
    Priority,
    /// Weighted by measured disk throughput
    Throughput,
}

/// Volume-level settings chosen at creation time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSettings {
    pub backup: BackupMode,
    pub encryption: EncryptionMode,
    pub partition: PartitionStrategy,
}

/// Transfer state of a single block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    #[default]
    Queued,
    InProgress,
    Transferred,
    Failed,
}

/// Kind of entry in the file tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Directory,
    Regular,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip_through_string() {
        let id = DiskId::new();
        let parsed: DiskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_nil_id() {
        assert!(VolumeId::nil().is_nil());
        assert!(!VolumeId::new().is_nil());
    }

    #[test]
    fn test_debug_contains_type_name() {
        let id = BlockId::nil();
        assert!(format!("{id:?}").starts_with("BlockId("));
    }

    #[test]
    fn test_only_raid1_is_virtual() {
        let virtual_types: Vec<_> = ProviderType::ALL
            .into_iter()
            .filter(|p| p.is_virtual())
            .collect();
        assert_eq!(virtual_types, vec![ProviderType::Raid1]);
    }
}
