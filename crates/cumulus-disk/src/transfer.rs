//! Block transfer descriptor
//!
//! A [`BlockTransfer`] is what a disk operation works on: the block identity,
//! the expected checksum, the content buffer and an optional completion
//! callback fired once when the operation succeeds.

use bytes::Bytes;
use cumulus_common::{BlockId, BlockStatus, FileId, content_checksum};
use std::fmt;
use std::sync::Arc;

/// Callback invoked with the owning file and the final block status
pub type CompletionCallback = Arc<dyn Fn(FileId, BlockStatus) + Send + Sync>;

/// One block moving between the process and a disk
#[derive(Clone)]
pub struct BlockTransfer {
    pub block_id: BlockId,
    pub file_id: FileId,
    /// Payload size in bytes
    pub size: u64,
    /// Checksum of the payload as written
    pub checksum: String,
    /// Payload; filled by downloads
    pub content: Bytes,
    pub status: BlockStatus,
    on_complete: Option<CompletionCallback>,
}

impl BlockTransfer {
    /// Transfer for writing `content`, checksummed here
    #[must_use]
    pub fn upload(block_id: BlockId, file_id: FileId, content: Bytes) -> Self {
        Self {
            block_id,
            file_id,
            size: content.len() as u64,
            checksum: content_checksum(&content),
            content,
            status: BlockStatus::Queued,
            on_complete: None,
        }
    }

    /// Transfer for reading a block whose size and checksum are known
    #[must_use]
    pub fn download(block_id: BlockId, file_id: FileId, size: u64, checksum: String) -> Self {
        Self {
            block_id,
            file_id,
            size,
            checksum,
            content: Bytes::new(),
            status: BlockStatus::Queued,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, on_complete: CompletionCallback) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    /// Independent copy without the completion callback
    ///
    /// Used when one logical operation fans out to several disks, so that a
    /// sub-operation finishing never fires the caller's callback.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            block_id: self.block_id,
            file_id: self.file_id,
            size: self.size,
            checksum: self.checksum.clone(),
            content: self.content.clone(),
            status: BlockStatus::Queued,
            on_complete: None,
        }
    }

    /// Mark the transfer as in progress
    pub const fn start(&mut self) {
        self.status = BlockStatus::InProgress;
    }

    /// Mark the transfer as done and fire the completion callback
    pub fn complete(&mut self) {
        self.status = BlockStatus::Transferred;
        if let Some(on_complete) = &self.on_complete {
            on_complete(self.file_id, self.status);
        }
    }

    /// Mark the transfer as failed
    pub const fn fail(&mut self) {
        self.status = BlockStatus::Failed;
    }

    /// Whether the current content matches the expected checksum
    #[must_use]
    pub fn is_intact(&self) -> bool {
        content_checksum(&self.content) == self.checksum
    }
}

impl fmt::Debug for BlockTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTransfer")
            .field("block_id", &self.block_id)
            .field("file_id", &self.file_id)
            .field("size", &self.size)
            .field("checksum", &self.checksum)
            .field("status", &self.status)
            .field("has_callback", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_detached_copy_does_not_fire_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let block = BlockTransfer::upload(BlockId::new(), FileId::new(), Bytes::from_static(b"abc"))
            .with_callback(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let mut copy = block.detached();
        copy.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(copy.content, block.content);

        let mut block = block;
        block.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(block.status, BlockStatus::Transferred);
    }

    #[test]
    fn test_integrity_check() {
        let mut block =
            BlockTransfer::upload(BlockId::new(), FileId::new(), Bytes::from_static(b"payload"));
        assert!(block.is_intact());
        assert_eq!(block.size, 7);

        block.content = Bytes::from_static(b"paYload");
        assert!(!block.is_intact());
    }
}
