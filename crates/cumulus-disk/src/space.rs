//! Capacity and throughput measurements used by block placement

use crate::disk::{Disk, ProviderSpace};
use crate::transfer::BlockTransfer;
use bytes::Bytes;
use cumulus_common::{BlockId, FileId};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bytes a disk can still accept
///
/// The smaller of the free space under the user quota and the free space the
/// provider reports. A provider that does not expose its quota is trusted to
/// match the user quota; a provider that fails to answer has no free space.
pub async fn compute_free_space(disk: &dyn Disk) -> u64 {
    let user_free = disk.total_space().saturating_sub(disk.used_space());

    let provider_free = match disk.provider_space().await {
        ProviderSpace::Supported { used, total } => total.saturating_sub(used),
        ProviderSpace::NotSupported => user_free,
        ProviderSpace::Failed(e) => {
            warn!("Cannot read provider space of disk {}: {}", disk.id(), e);
            0
        }
    };

    let free = user_free.min(provider_free);
    debug!(
        disk_id = %disk.id(),
        free, user_free, provider_free,
        "Computed free space"
    );
    free
}

/// Throughput weight of a disk; lower is faster
///
/// Uploads then downloads a sample block of `sample_size` bytes and returns
/// the mean of both durations in milliseconds plus one. The sample block is
/// removed afterwards.
pub async fn measure_throughput(disk: &dyn Disk, sample_size: u64) -> u64 {
    let len = usize::try_from(sample_size).unwrap_or(usize::MAX);
    let mut block = BlockTransfer::upload(BlockId::new(), FileId::nil(), Bytes::from(vec![1u8; len]));

    let started = Instant::now();
    if let Err(e) = disk.upload(&mut block).await {
        warn!("Throughput probe upload to disk {} failed: {}", disk.id(), e);
    }
    let upload = started.elapsed();

    let started = Instant::now();
    if let Err(e) = disk.download(&mut block).await {
        warn!("Throughput probe download from disk {} failed: {}", disk.id(), e);
    }
    let download = started.elapsed();

    if let Err(e) = disk.remove(&mut block).await {
        warn!("Cannot remove throughput probe block from disk {}: {}", disk.id(), e);
    }

    let total_ms = upload.as_millis().saturating_add(download.as_millis());
    let weight = u64::try_from(total_ms / 2).unwrap_or(u64::MAX).saturating_add(1);
    debug!(
        "Disk {} has throughput weight {} (upload: {} ms, download: {} ms)",
        disk.id(),
        weight,
        upload.as_millis(),
        download.as_millis()
    );
    weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDisk;
    use cumulus_common::VolumeId;
    use std::time::Duration;

    #[tokio::test]
    async fn test_free_space_falls_back_to_quota() {
        let disk = MemoryDisk::new(VolumeId::new(), "m", 1000);
        disk.set_used_space(400);
        assert_eq!(compute_free_space(&disk).await, 600);
    }

    #[tokio::test]
    async fn test_free_space_is_capped_by_provider() {
        let disk = MemoryDisk::new(VolumeId::new(), "m", 1000);
        disk.set_provider_space(ProviderSpace::Supported { used: 950, total: 1000 });
        assert_eq!(compute_free_space(&disk).await, 50);

        disk.set_provider_space(ProviderSpace::Supported { used: 0, total: 1 << 30 });
        assert_eq!(compute_free_space(&disk).await, 1000);
    }

    #[tokio::test]
    async fn test_free_space_is_zero_when_provider_fails_or_quota_exceeded() {
        let disk = MemoryDisk::new(VolumeId::new(), "m", 1000);
        disk.set_provider_space(ProviderSpace::Failed("timeout".into()));
        assert_eq!(compute_free_space(&disk).await, 0);

        let disk = MemoryDisk::new(VolumeId::new(), "m", 100);
        disk.set_used_space(150);
        assert_eq!(compute_free_space(&disk).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_weight() {
        let disk = MemoryDisk::new(VolumeId::new(), "slow", 1 << 20);
        disk.set_latency(Duration::from_millis(40));

        assert_eq!(measure_throughput(&disk, 1024).await, 41);
        assert_eq!(disk.block_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_disk_has_weight_one() {
        let disk = MemoryDisk::new(VolumeId::new(), "fast", 1 << 20);
        assert_eq!(measure_throughput(&disk, 1024).await, 1);
    }
}
