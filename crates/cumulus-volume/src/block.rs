//! File blocks

use bytes::Bytes;
use cumulus_common::{BlockId, BlockRecord, BlockStatus, FileId, UserId, VolumeId};
use cumulus_disk::{BlockTransfer, Disk};
use std::fmt;
use std::sync::Arc;

/// One fragment of a regular file, placed on a single disk
#[derive(Clone)]
pub struct Block {
    pub id: BlockId,
    pub file_id: FileId,
    pub user_id: UserId,
    pub volume_id: VolumeId,
    /// Disk holding the block
    pub disk: Arc<dyn Disk>,
    /// Payload size; the plaintext size until the block is uploaded
    pub size: u64,
    /// Checksum of the stored payload, empty until uploaded
    pub checksum: String,
    pub status: BlockStatus,
    /// 0-based position within the file
    pub order: u64,
}

impl Block {
    /// Queued block of `size` bytes assigned to `disk`
    #[must_use]
    pub fn new(
        file_id: FileId,
        user_id: UserId,
        volume_id: VolumeId,
        disk: Arc<dyn Disk>,
        size: u64,
        order: u64,
    ) -> Self {
        Self {
            id: BlockId::new(),
            file_id,
            user_id,
            volume_id,
            disk,
            size,
            checksum: String::new(),
            status: BlockStatus::Queued,
            order,
        }
    }

    /// Stored block restored from its record
    #[must_use]
    pub fn from_record(record: &BlockRecord, disk: Arc<dyn Disk>) -> Self {
        Self {
            id: record.id,
            file_id: record.file_id,
            user_id: record.user_id,
            volume_id: record.volume_id,
            disk,
            size: record.size,
            checksum: record.checksum.clone(),
            status: BlockStatus::Transferred,
            order: record.order,
        }
    }

    #[must_use]
    pub fn to_record(&self) -> BlockRecord {
        BlockRecord {
            id: self.id,
            file_id: self.file_id,
            user_id: self.user_id,
            volume_id: self.volume_id,
            disk_id: self.disk.id(),
            size: self.size,
            checksum: self.checksum.clone(),
            order: self.order,
        }
    }

    /// Transfer writing `payload` as this block
    #[must_use]
    pub fn upload_transfer(&self, payload: Bytes) -> BlockTransfer {
        BlockTransfer::upload(self.id, self.file_id, payload)
    }

    /// Transfer reading this block back
    #[must_use]
    pub fn download_transfer(&self) -> BlockTransfer {
        BlockTransfer::download(self.id, self.file_id, self.size, self.checksum.clone())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("file_id", &self.file_id)
            .field("disk_id", &self.disk.id())
            .field("size", &self.size)
            .field("status", &self.status)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}
