//! Persistence records
//!
//! Flat, serializable snapshots of the in-memory model. The runtime types in
//! the disk, volume and transport crates are hydrated from these records and
//! written back through a [`Repository`](crate::Repository).

use crate::repository::Record;
use crate::types::{
    BlockId, DiskId, FileId, FileType, ProviderId, ProviderType, UserId, VolumeId,
    VolumeSettings,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's logical volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub name: String,
    pub user_id: UserId,
    pub settings: VolumeSettings,
    /// Size of every block but the last one of a file
    pub block_size: u64,
    pub created_at: DateTime<Utc>,
}

impl Record for VolumeRecord {
    const TABLE: &'static str = "volumes";

    fn key(&self) -> Uuid {
        self.id.as_uuid()
    }
}

/// A disk attached to a volume, real or virtual
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: DiskId,
    pub user_id: UserId,
    pub volume_id: VolumeId,
    pub provider_id: ProviderId,
    /// Serialized credentials, empty for virtual disks
    pub credentials: String,
    pub name: String,
    /// User quota in bytes
    pub total_space: u64,
    pub used_space: u64,
    pub created_at: DateTime<Utc>,
    pub is_virtual: bool,
    /// Virtual disk this disk is a mirror of
    pub virtual_disk_id: Option<DiskId>,
}

impl Record for DiskRecord {
    const TABLE: &'static str = "disks";

    fn key(&self) -> Uuid {
        self.id.as_uuid()
    }
}

/// A storage provider entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub provider_type: ProviderType,
    pub name: String,
}

impl ProviderRecord {
    /// Deterministic provider entry for a provider type
    ///
    /// Provider entries are seeded once per type, so every process agrees on
    /// the identifier without reading the repository first.
    #[must_use]
    pub fn for_type(provider_type: ProviderType) -> Self {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, provider_type.as_str().as_bytes());
        Self {
            id: ProviderId::from_uuid(id),
            provider_type,
            name: provider_type.as_str().to_string(),
        }
    }

    /// Provider type behind a seeded provider identifier
    #[must_use]
    pub fn type_of(id: ProviderId) -> Option<ProviderType> {
        ProviderType::ALL
            .into_iter()
            .find(|provider_type| Self::for_type(*provider_type).id == id)
    }
}

impl Record for ProviderRecord {
    const TABLE: &'static str = "providers";

    fn key(&self) -> Uuid {
        self.id.as_uuid()
    }
}

/// A file or directory of a volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub volume_id: VolumeId,
    /// Parent directory, `None` for entries at the volume root
    pub root_id: Option<FileId>,
    pub user_id: UserId,
    pub file_type: FileType,
    pub name: String,
    pub size: u64,
    /// Checksum of the plaintext content, empty for directories
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for FileRecord {
    const TABLE: &'static str = "files";

    fn key(&self) -> Uuid {
        self.id.as_uuid()
    }
}

/// One block of a regular file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub file_id: FileId,
    pub user_id: UserId,
    pub volume_id: VolumeId,
    pub disk_id: DiskId,
    /// Size of the stored payload
    pub size: u64,
    /// Checksum of the stored payload
    pub checksum: String,
    /// 0-based position within the file
    pub order: u64,
}

impl Record for BlockRecord {
    const TABLE: &'static str = "blocks";

    fn key(&self) -> Uuid {
        self.id.as_uuid()
    }
}
