//! File tree entries
//!
//! A [`File`] is either a [`RegularFile`], owning the blocks its content is
//! split into, or a [`Directory`], owning child entries.

use crate::block::Block;
use chrono::{DateTime, Utc};
use cumulus_common::{
    BlockId, BlockRecord, BlockStatus, DiskId, FileId, FileRecord, FileType, UserId, VolumeId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Attributes shared by every file tree entry
#[derive(Clone, Debug)]
pub struct FileMeta {
    pub id: FileId,
    pub volume_id: VolumeId,
    /// Parent directory, `None` at the volume root
    pub root_id: Option<FileId>,
    pub user_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileMeta {
    #[must_use]
    pub fn new(volume_id: VolumeId, root_id: Option<FileId>, user_id: UserId, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: FileId::new(),
            volume_id,
            root_id,
            user_id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn from_record(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            volume_id: record.volume_id,
            root_id: record.root_id,
            user_id: record.user_id,
            name: record.name.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// File whose content is stored as blocks
#[derive(Debug)]
pub struct RegularFile {
    pub meta: FileMeta,
    size: u64,
    checksum: RwLock<String>,
    blocks: RwLock<HashMap<BlockId, Block>>,
}

impl RegularFile {
    /// Empty file of `size` bytes with no blocks yet
    #[must_use]
    pub fn new(meta: FileMeta, size: u64) -> Self {
        Self {
            meta,
            size,
            checksum: RwLock::new(String::new()),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Stored file restored from its records
    #[must_use]
    pub fn from_record(record: &FileRecord, blocks: impl IntoIterator<Item = Block>) -> Self {
        let file = Self::new(FileMeta::from_record(record), record.size);
        *file.checksum.write() = record.checksum.clone();
        for block in blocks {
            file.insert_block(block);
        }
        file
    }

    #[must_use]
    pub const fn id(&self) -> FileId {
        self.meta.id
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Checksum of the whole plaintext content
    #[must_use]
    pub fn checksum(&self) -> String {
        self.checksum.read().clone()
    }

    pub fn set_checksum(&self, checksum: String) {
        *self.checksum.write() = checksum;
    }

    pub fn insert_block(&self, block: Block) {
        self.blocks.write().insert(block.id, block);
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Blocks sorted by their position in the file
    #[must_use]
    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = self.blocks.read().values().cloned().collect();
        blocks.sort_by_key(|block| block.order);
        blocks
    }

    /// Apply `update` to a block; returns false if the block is unknown
    pub fn update_block(&self, block_id: BlockId, update: impl FnOnce(&mut Block)) -> bool {
        match self.blocks.write().get_mut(&block_id) {
            Some(block) => {
                update(block);
                true
            }
            None => false,
        }
    }

    pub fn set_block_status(&self, block_id: BlockId, status: BlockStatus) -> bool {
        debug!("Block {} of file {} is now {:?}", block_id, self.meta.id, status);
        self.update_block(block_id, |block| block.status = status)
    }

    /// Whether every block has been transferred
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.blocks
            .read()
            .values()
            .all(|block| block.status == BlockStatus::Transferred)
    }

    /// Whether any block is placed on `disk_id`, directly or through a mirror
    #[must_use]
    pub fn references_disk(&self, disk_id: DiskId) -> bool {
        self.blocks.read().values().any(|block| {
            block.disk.id() == disk_id || block.disk.virtual_disk_id() == Some(disk_id)
        })
    }

    #[must_use]
    pub fn block_records(&self) -> Vec<BlockRecord> {
        self.blocks().iter().map(Block::to_record).collect()
    }
}

/// Directory holding child entries
#[derive(Debug)]
pub struct Directory {
    pub meta: FileMeta,
    children: RwLock<Vec<Arc<File>>>,
}

impl Directory {
    #[must_use]
    pub fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn add_child(&self, child: Arc<File>) {
        self.children.write().push(child);
    }

    #[must_use]
    pub fn children(&self) -> Vec<Arc<File>> {
        self.children.read().clone()
    }

    /// Sum of the children's sizes, computed on every call
    #[must_use]
    pub fn size(&self) -> u64 {
        self.children.read().iter().map(|child| child.size()).sum()
    }
}

/// Entry of a volume's file tree
#[derive(Debug)]
pub enum File {
    Regular(RegularFile),
    Directory(Directory),
}

impl File {
    /// Entry restored from its record; regular files come back without blocks
    #[must_use]
    pub fn from_record(record: &FileRecord) -> Self {
        match record.file_type {
            FileType::Directory => Self::Directory(Directory::new(FileMeta::from_record(record))),
            FileType::Regular => Self::Regular(RegularFile::from_record(record, [])),
        }
    }

    #[must_use]
    pub const fn meta(&self) -> &FileMeta {
        match self {
            Self::Regular(file) => &file.meta,
            Self::Directory(dir) => &dir.meta,
        }
    }

    #[must_use]
    pub const fn id(&self) -> FileId {
        self.meta().id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta().name
    }

    #[must_use]
    pub const fn volume_id(&self) -> VolumeId {
        self.meta().volume_id
    }

    #[must_use]
    pub const fn file_type(&self) -> FileType {
        match self {
            Self::Regular(_) => FileType::Regular,
            Self::Directory(_) => FileType::Directory,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Regular(file) => file.size(),
            Self::Directory(dir) => dir.size(),
        }
    }

    /// Directories are always complete
    #[must_use]
    pub fn is_completed(&self) -> bool {
        match self {
            Self::Regular(file) => file.is_completed(),
            Self::Directory(_) => true,
        }
    }

    #[must_use]
    pub const fn as_regular(&self) -> Option<&RegularFile> {
        match self {
            Self::Regular(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    #[must_use]
    pub fn to_record(&self) -> FileRecord {
        let meta = self.meta();
        let checksum = match self {
            Self::Regular(file) => file.checksum(),
            Self::Directory(_) => String::new(),
        };
        FileRecord {
            id: meta.id,
            volume_id: meta.volume_id,
            root_id: meta.root_id,
            user_id: meta.user_id,
            file_type: self.file_type(),
            name: meta.name.clone(),
            size: self.size(),
            checksum,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_disk::{Disk, MemoryDisk};

    fn regular(volume_id: VolumeId, size: u64) -> RegularFile {
        RegularFile::new(FileMeta::new(volume_id, None, UserId::new(), "f"), size)
    }

    #[test]
    fn test_blocks_come_back_in_order() {
        let volume_id = VolumeId::new();
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new(volume_id, "m", 100));
        let file = regular(volume_id, 30);
        for order in [2, 0, 1] {
            file.insert_block(Block::new(file.id(), UserId::new(), volume_id, disk.clone(), 10, order));
        }

        let orders: Vec<u64> = file.blocks().iter().map(|b| b.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_completion_tracks_block_status() {
        let volume_id = VolumeId::new();
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new(volume_id, "m", 100));
        let file = regular(volume_id, 20);
        let first = Block::new(file.id(), UserId::new(), volume_id, disk.clone(), 10, 0);
        let second = Block::new(file.id(), UserId::new(), volume_id, disk.clone(), 10, 1);
        let (a, b) = (first.id, second.id);
        file.insert_block(first);
        file.insert_block(second);

        assert!(!file.is_completed());
        assert!(file.set_block_status(a, BlockStatus::Transferred));
        assert!(!file.is_completed());
        assert!(file.set_block_status(b, BlockStatus::Transferred));
        assert!(file.is_completed());
        assert!(!file.set_block_status(BlockId::new(), BlockStatus::Failed));
        assert!(file.references_disk(disk.id()));
    }

    #[test]
    fn test_directory_size_is_sum_of_children() {
        let volume_id = VolumeId::new();
        let dir = Directory::new(FileMeta::new(volume_id, None, UserId::new(), "d"));
        let nested = Directory::new(FileMeta::new(volume_id, None, UserId::new(), "n"));
        nested.add_child(Arc::new(File::Regular(regular(volume_id, 5))));
        let nested = Arc::new(File::Directory(nested));

        dir.add_child(Arc::new(File::Regular(regular(volume_id, 10))));
        dir.add_child(nested.clone());
        assert_eq!(dir.size(), 15);

        if let File::Directory(nested) = nested.as_ref() {
            nested.add_child(Arc::new(File::Regular(regular(volume_id, 7))));
        }
        assert_eq!(dir.size(), 22);
    }

    #[test]
    fn test_record_roundtrip() {
        let file = File::Regular(regular(VolumeId::new(), 42));
        let record = file.to_record();
        assert_eq!(record.file_type, FileType::Regular);
        assert_eq!(record.size, 42);

        let restored = File::from_record(&record);
        assert_eq!(restored.id(), file.id());
        assert_eq!(restored.size(), 42);
        assert!(restored.is_completed());
    }
}
