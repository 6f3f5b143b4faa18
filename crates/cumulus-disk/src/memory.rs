//! In-memory disk
//!
//! Blocks live in a [`MemoryStore`] that outlives the disk handle, the same
//! way data on a remote provider outlives a connection. The store carries
//! fault-injection knobs used throughout the test suites.

use crate::disk::{Disk, DiskCore, DownloadOutcome, ProviderSpace};
use crate::readiness::{CachedReadiness, DiskReadiness};
use crate::transfer::BlockTransfer;
use async_trait::async_trait;
use bytes::Bytes;
use cumulus_common::config::ReadinessConfig;
use cumulus_common::{BlockId, DiskRecord, Error, ProviderType, Result, VolumeId};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Block storage of one in-memory disk
pub struct MemoryStore {
    blocks: Mutex<HashMap<BlockId, Bytes>>,
    provider_space: Mutex<ProviderSpace>,
    latency: Mutex<Duration>,
    ready: AtomicBool,
    fail_uploads: AtomicBool,
    fail_downloads: AtomicBool,
    fail_removes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            provider_space: Mutex::new(ProviderSpace::NotSupported),
            latency: Mutex::new(Duration::ZERO),
            ready: AtomicBool::new(true),
            fail_uploads: AtomicBool::new(false),
            fail_downloads: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Disk backed by process memory
pub struct MemoryDisk {
    core: DiskCore,
    store: Arc<MemoryStore>,
    readiness: Arc<CachedReadiness>,
}

impl MemoryDisk {
    /// New empty disk with a user quota of `total_space` bytes
    #[must_use]
    pub fn new(volume_id: VolumeId, name: &str, total_space: u64) -> Self {
        let core =
            DiskCore::new(volume_id, ProviderType::Memory, name).with_total_space(total_space);
        Self::with_core(core, Arc::default(), &ReadinessConfig::default())
    }

    /// Disk over an existing store
    #[must_use]
    pub fn with_core(core: DiskCore, store: Arc<MemoryStore>, config: &ReadinessConfig) -> Self {
        let probe_store = Arc::downgrade(&store);
        let alive_store = Arc::downgrade(&store);
        let readiness = CachedReadiness::new(
            Arc::new(move || {
                let store = probe_store.upgrade();
                async move { store.is_some_and(|s| s.ready.load(Ordering::SeqCst)) }.boxed()
            }),
            Arc::new(move || alive_store.strong_count() > 0),
            config,
        );

        Self {
            core,
            store,
            readiness: Arc::new(readiness),
        }
    }

    /// Restore a disk from its record over a shared store
    ///
    /// # Errors
    /// Returns an error if the record's credentials cannot be parsed.
    pub fn from_record(
        record: &DiskRecord,
        store: Arc<MemoryStore>,
        config: &ReadinessConfig,
    ) -> Result<Self> {
        let core = DiskCore::from_record(record, ProviderType::Memory)?;
        Ok(Self::with_core(core, store, config))
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn cumulus_common::Repository>) -> Self {
        self.core = self.core.with_repository(repository);
        self
    }

    /// Stored bytes of a block
    #[must_use]
    pub fn stored(&self, block_id: BlockId) -> Option<Bytes> {
        self.store.blocks.lock().get(&block_id).cloned()
    }

    /// Number of stored blocks
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.store.blocks.lock().len()
    }

    /// Flip the first byte of a stored block
    pub fn corrupt(&self, block_id: BlockId) {
        if let Some(content) = self.store.blocks.lock().get_mut(&block_id) {
            let mut bytes = content.to_vec();
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            } else {
                bytes.push(0xFF);
            }
            *content = Bytes::from(bytes);
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.store.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.store.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.store.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Backend reachability reported to readiness probes
    pub fn set_ready(&self, ready: bool) {
        self.store.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_provider_space(&self, space: ProviderSpace) {
        *self.store.provider_space.lock() = space;
    }

    /// Delay applied to every transfer
    pub fn set_latency(&self, latency: Duration) {
        *self.store.latency.lock() = latency;
    }
}

#[async_trait]
impl Disk for MemoryDisk {
    async fn upload(&self, block: &mut BlockTransfer) -> Result<()> {
        block.start();
        self.store.simulate_latency().await;
        if self.store.fail_uploads.load(Ordering::SeqCst) {
            block.fail();
            return Err(Error::remote(format!(
                "memory disk {} rejected block {}",
                self.core.id(),
                block.block_id
            )));
        }

        self.store
            .blocks
            .lock()
            .insert(block.block_id, block.content.clone());
        block.complete();
        debug!("Stored block {} on memory disk {}", block.block_id, self.core.id());
        Ok(())
    }

    async fn download(&self, block: &mut BlockTransfer) -> Result<DownloadOutcome> {
        block.start();
        self.store.simulate_latency().await;
        if self.store.fail_downloads.load(Ordering::SeqCst) {
            block.fail();
            return Err(Error::remote(format!(
                "memory disk {} is unreachable",
                self.core.id()
            )));
        }

        let Some(content) = self.stored(block.block_id) else {
            block.fail();
            return Err(Error::BlockNotFound(block.block_id));
        };
        block.content = content;
        block.complete();
        Ok(DownloadOutcome::Direct)
    }

    async fn rename(&self, from: BlockId, to: BlockId) -> Result<()> {
        let mut blocks = self.store.blocks.lock();
        let content = blocks.remove(&from).ok_or(Error::BlockNotFound(from))?;
        blocks.insert(to, content);
        Ok(())
    }

    async fn remove(&self, block: &mut BlockTransfer) -> Result<()> {
        if self.store.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::remote(format!(
                "memory disk {} refused to delete block {}",
                self.core.id(),
                block.block_id
            )));
        }

        self.store.blocks.lock().remove(&block.block_id);
        block.complete();
        Ok(())
    }

    async fn provider_space(&self) -> ProviderSpace {
        self.store.provider_space.lock().clone()
    }

    fn core(&self) -> &DiskCore {
        &self.core
    }

    fn readiness(&self) -> Arc<dyn DiskReadiness> {
        self.readiness.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_common::FileId;

    #[tokio::test]
    async fn test_store_survives_disk_handle() {
        let store = Arc::new(MemoryStore::default());
        let core = DiskCore::new(VolumeId::new(), ProviderType::Memory, "m");
        let id = core.id();
        let disk = MemoryDisk::with_core(core, Arc::clone(&store), &ReadinessConfig::default());

        let mut block = BlockTransfer::upload(BlockId::new(), FileId::new(), Bytes::from_static(b"kept"));
        disk.upload(&mut block).await.unwrap();
        drop(disk);

        let reopened = MemoryDisk::with_core(
            DiskCore::new(VolumeId::new(), ProviderType::Memory, "m").with_id(id),
            store,
            &ReadinessConfig::default(),
        );
        let mut read = BlockTransfer::download(block.block_id, block.file_id, block.size, block.checksum);
        reopened.download(&mut read).await.unwrap();
        assert!(read.is_intact());
    }

    #[tokio::test]
    async fn test_missing_block() {
        let disk = MemoryDisk::new(VolumeId::new(), "m", 10);
        let mut read = BlockTransfer::download(BlockId::new(), FileId::new(), 0, String::new());
        let err = disk.download(&mut read).await.unwrap_err();
        assert_eq!(err.code(), "FS-001");
    }

    #[tokio::test]
    async fn test_readiness_follows_backend() {
        let disk = MemoryDisk::new(VolumeId::new(), "m", 10);
        assert!(disk.readiness().is_ready_force().await);
        disk.set_ready(false);
        assert!(!disk.readiness().is_ready_force().await);
    }
}
