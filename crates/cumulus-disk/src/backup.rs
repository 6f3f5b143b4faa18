//! Virtual RAID1 disk
//!
//! A [`BackupDisk`] mirrors every block onto exactly two real disks. Each
//! operation fans out to both mirrors as separate tasks and joins them, so a
//! mirrored call costs the slower mirror's latency and a cancelled caller
//! never interrupts a mirror mid-write.
//!
//! Downloads verify both copies against the expected checksum and rewrite a
//! diverging mirror from the good copy before returning.

use crate::credentials::Credentials;
use crate::disk::{Disk, DiskCore, DownloadOutcome, ProviderSpace};
use crate::readiness::{DiskReadiness, StaticReadiness, VirtualDiskReadiness};
use crate::transfer::BlockTransfer;
use async_trait::async_trait;
use cumulus_common::{
    BlockId, DiskId, DiskRecord, Error, ProviderId, ProviderType, Result, UserId, VolumeId,
    content_checksum,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

type Mirror = Arc<dyn Disk>;

/// Two real disks presented as one mirrored disk
pub struct BackupDisk {
    core: DiskCore,
    mirrors: RwLock<[Option<Mirror>; 2]>,
}

impl BackupDisk {
    /// Empty virtual disk with a fresh identifier
    #[must_use]
    pub fn new(volume_id: VolumeId) -> Self {
        Self::with_id(DiskId::new(), volume_id)
    }

    /// Empty virtual disk restored under a known identifier
    #[must_use]
    pub fn with_id(id: DiskId, volume_id: VolumeId) -> Self {
        Self {
            core: DiskCore::new(volume_id, ProviderType::Raid1, String::new()).with_id(id),
            mirrors: RwLock::new([None, None]),
        }
    }

    /// Fill the next free mirror slot
    ///
    /// # Errors
    /// Returns `Error::CompositionOverflow` when both slots are taken; the
    /// composition is left unchanged.
    pub fn assign_disk(&self, disk: Mirror) -> Result<()> {
        let mut mirrors = self.mirrors.write();
        let Some(slot) = mirrors.iter_mut().find(|slot| slot.is_none()) else {
            error!(
                "Cannot assign disk {} to backup disk {}, both mirrors are already assigned",
                disk.id(),
                self.core.id()
            );
            return Err(Error::CompositionOverflow {
                disk_id: self.core.id(),
            });
        };

        debug!("Assigned disk {} to backup disk {}", disk.id(), self.core.id());
        *slot = Some(disk);
        Ok(())
    }

    /// Both mirrors, once assigned
    #[must_use]
    pub fn mirrors(&self) -> Option<(Mirror, Mirror)> {
        let mirrors = self.mirrors.read();
        match &*mirrors {
            [Some(first), Some(second)] => Some((Arc::clone(first), Arc::clone(second))),
            _ => None,
        }
    }

    /// Whether the backup disk references `disk_id` as a mirror
    #[must_use]
    pub fn contains(&self, disk_id: DiskId) -> bool {
        self.mirrors
            .read()
            .iter()
            .flatten()
            .any(|mirror| mirror.id() == disk_id)
    }

    fn pair(&self) -> Result<(Mirror, Mirror)> {
        self.mirrors().ok_or_else(|| {
            Error::internal(format!(
                "backup disk {} has fewer than two mirrors",
                self.core.id()
            ))
        })
    }

    /// Rewrite `target` with the verified copy of a block
    ///
    /// Runs as its own task so the repair completes even if the reader goes
    /// away. Failures are logged only.
    async fn repair(&self, target: Mirror, good: &BlockTransfer) {
        let block_id = good.block_id;
        let mut copy = good.detached();
        let task = tokio::spawn(async move {
            target.remove(&mut copy).await.map_err(|e| (target.id(), "remove", e))?;
            target.upload(&mut copy).await.map_err(|e| (target.id(), "upload", e))?;
            Ok::<_, (DiskId, &'static str, Error)>(target.id())
        });

        match task.await {
            Ok(Ok(disk_id)) => warn!(
                "RAID1 recovery completed: disk {} now has the correct block {}",
                disk_id, block_id
            ),
            Ok(Err((disk_id, step, e))) => error!(
                "RAID1 recovery failed: cannot {} block {} on disk {}: {}",
                step, block_id, disk_id, e
            ),
            Err(e) => error!("RAID1 recovery of block {} aborted: {}", block_id, e),
        }
    }
}

/// Run `op` against both mirrors concurrently on independent block copies
async fn fan_out<T, F, Fut>(
    (first, second): (Mirror, Mirror),
    block: &BlockTransfer,
    op: F,
) -> (Result<T>, Result<T>)
where
    F: Fn(Mirror, BlockTransfer) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let first = tokio::spawn(op(first, block.detached()));
    let second = tokio::spawn(op(second, block.detached()));
    let (first, second) = tokio::join!(first, second);
    (flatten(first), flatten(second))
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(|e| Error::internal(format!("mirror task failed: {e}")))?
}

fn describe_failures<T>(first: &Result<T>, second: &Result<T>) -> String {
    [("first", first), ("second", second)]
        .into_iter()
        .filter_map(|(mirror, result)| {
            result
                .as_ref()
                .err()
                .map(|e| format!("{mirror} mirror: {e}"))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl Disk for BackupDisk {
    async fn upload(&self, block: &mut BlockTransfer) -> Result<()> {
        let pair = self.pair()?;
        block.start();
        let (first, second) = fan_out(pair, block, |disk, mut copy| async move {
            disk.upload(&mut copy).await
        })
        .await;

        if first.is_err() || second.is_err() {
            let detail = describe_failures(&first, &second);
            error!("Cannot upload block {}: {}", block.block_id, detail);
            block.fail();
            return Err(Error::MirrorWriteFailure {
                block_id: block.block_id,
                detail,
            });
        }

        block.complete();
        debug!("Uploaded block {} to backup disk {}", block.block_id, self.core.id());
        Ok(())
    }

    async fn download(&self, block: &mut BlockTransfer) -> Result<DownloadOutcome> {
        let pair = self.pair()?;
        block.start();
        let (first, second) = fan_out(pair.clone(), block, |disk, mut copy| async move {
            disk.download(&mut copy).await?;
            let checksum = content_checksum(&copy.content);
            Ok((copy, checksum))
        })
        .await;

        let expected = block.checksum.clone();
        let (served, outcome) = match (first, second) {
            (Ok((first, first_sum)), Ok((second, second_sum))) => {
                let first_ok = first_sum == expected;
                let second_ok = second_sum == expected;
                match (first_ok, second_ok) {
                    (true, true) => (first, DownloadOutcome::Verified),
                    (true, false) => {
                        self.repair(pair.1, &first).await;
                        (first, DownloadOutcome::Repaired)
                    }
                    (false, true) => {
                        self.repair(pair.0, &second).await;
                        (second, DownloadOutcome::Repaired)
                    }
                    (false, false) => {
                        error!(
                            "RAID1 recovery failed: both mirrors have a corrupted block {}",
                            block.block_id
                        );
                        (first, DownloadOutcome::Unrecoverable)
                    }
                }
            }
            (Ok((copy, _)), Err(e)) | (Err(e), Ok((copy, _))) => {
                warn!(
                    "Serving block {} from a single mirror, the other failed: {}",
                    block.block_id, e
                );
                (copy, DownloadOutcome::Degraded)
            }
            (Err(first), Err(second)) => {
                let detail = format!("first mirror: {first}; second mirror: {second}");
                error!("Cannot download block {}: {}", block.block_id, detail);
                block.fail();
                return Err(Error::MirrorReadFailure {
                    block_id: block.block_id,
                    detail,
                });
            }
        };

        block.content = served.content;
        block.complete();
        debug!(block_id = %block.block_id, ?outcome, "Downloaded block from backup disk");
        Ok(outcome)
    }

    async fn rename(&self, from: BlockId, to: BlockId) -> Result<()> {
        let (first, second) = self.pair()?;
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { first.rename(from, to).await }),
            tokio::spawn(async move { second.rename(from, to).await }),
        );
        let (r1, r2) = (flatten(r1), flatten(r2));
        if r1.is_err() || r2.is_err() {
            return Err(Error::MirrorWriteFailure {
                block_id: from,
                detail: describe_failures(&r1, &r2),
            });
        }
        Ok(())
    }

    async fn remove(&self, block: &mut BlockTransfer) -> Result<()> {
        let pair = self.pair()?;
        let (first, second) = fan_out(pair, block, |disk, mut copy| async move {
            disk.remove(&mut copy).await
        })
        .await;

        if first.is_err() || second.is_err() {
            let detail = describe_failures(&first, &second);
            error!("Cannot remove block {}: {}", block.block_id, detail);
            return Err(Error::MirrorRemoveFailure {
                block_id: block.block_id,
                detail,
            });
        }

        block.complete();
        Ok(())
    }

    async fn provider_space(&self) -> ProviderSpace {
        let Ok((first, second)) = self.pair() else {
            return ProviderSpace::Failed("backup disk is incomplete".into());
        };
        match tokio::join!(first.provider_space(), second.provider_space()) {
            (ProviderSpace::NotSupported, _) | (_, ProviderSpace::NotSupported) => {
                ProviderSpace::NotSupported
            }
            (ProviderSpace::Failed(e), _) | (_, ProviderSpace::Failed(e)) => {
                ProviderSpace::Failed(e)
            }
            (
                ProviderSpace::Supported {
                    used: used1,
                    total: total1,
                },
                ProviderSpace::Supported {
                    used: used2,
                    total: total2,
                },
            ) => ProviderSpace::Supported {
                used: used1.max(used2),
                total: total1.min(total2),
            },
        }
    }

    fn core(&self) -> &DiskCore {
        &self.core
    }

    fn readiness(&self) -> Arc<dyn DiskReadiness> {
        match self.mirrors() {
            Some((first, second)) => Arc::new(VirtualDiskReadiness::new([
                first.readiness(),
                second.readiness(),
            ])),
            None => Arc::new(StaticReadiness(false)),
        }
    }

    fn provider_id(&self) -> Result<ProviderId> {
        Err(Error::unsupported("provider id of a backup disk"))
    }

    fn name(&self) -> Result<String> {
        Err(Error::unsupported("name of a backup disk"))
    }

    fn set_name(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported("renaming a backup disk"))
    }

    fn credentials(&self) -> Result<Credentials> {
        Err(Error::unsupported("credentials of a backup disk"))
    }

    fn total_space(&self) -> u64 {
        self.mirrors()
            .map_or(0, |(first, second)| first.total_space().min(second.total_space()))
    }

    fn set_total_space(&self, quota: u64) {
        for mirror in self.mirrors.read().iter().flatten() {
            mirror.set_total_space(quota);
        }
    }

    fn used_space(&self) -> u64 {
        self.mirrors()
            .map_or(0, |(first, second)| first.used_space().max(second.used_space()))
    }

    fn set_used_space(&self, usage: u64) {
        for mirror in self.mirrors.read().iter().flatten() {
            mirror.set_used_space(usage);
        }
    }

    async fn update_used_space(&self, delta: i64) -> Result<()> {
        let (first, second) = self.pair()?;
        let (r1, r2) = tokio::join!(
            first.update_used_space(delta),
            second.update_used_space(delta)
        );
        r1.and(r2)
    }

    fn to_record(&self, _user_id: UserId, _provider_id: ProviderId) -> Result<DiskRecord> {
        Err(Error::unsupported("persisting a backup disk"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDisk;
    use bytes::Bytes;
    use cumulus_common::FileId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        backup: BackupDisk,
        first: Arc<MemoryDisk>,
        second: Arc<MemoryDisk>,
    }

    fn fixture() -> Fixture {
        let volume_id = VolumeId::new();
        let first = Arc::new(MemoryDisk::new(volume_id, "first", 100));
        let second = Arc::new(MemoryDisk::new(volume_id, "second", 100));
        let backup = BackupDisk::new(volume_id);
        backup.assign_disk(first.clone()).unwrap();
        backup.assign_disk(second.clone()).unwrap();
        Fixture {
            backup,
            first,
            second,
        }
    }

    fn block(content: &'static [u8]) -> BlockTransfer {
        BlockTransfer::upload(BlockId::new(), FileId::new(), Bytes::from_static(content))
    }

    fn counting(block: BlockTransfer) -> (BlockTransfer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let block = block.with_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (block, fired)
    }

    async fn read_direct(disk: &MemoryDisk, block: &BlockTransfer) -> BlockTransfer {
        let mut copy = block.detached();
        disk.download(&mut copy).await.unwrap();
        copy
    }

    #[tokio::test]
    async fn test_upload_writes_both_mirrors_and_fires_callback_once() {
        let f = fixture();
        let (mut block, fired) = counting(block(b"mirrored payload"));

        f.backup.upload(&mut block).await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(read_direct(&f.first, &block).await.is_intact());
        assert!(read_direct(&f.second, &block).await.is_intact());
    }

    #[tokio::test]
    async fn test_upload_reports_mirror_write_failure() {
        let f = fixture();
        f.second.fail_uploads(true);
        let (mut block, fired) = counting(block(b"payload"));

        let err = f.backup.upload(&mut block).await.unwrap_err();

        assert_eq!(err.code(), "REM-001");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // No rollback of the mirror that succeeded
        assert!(f.first.stored(block.block_id).is_some());
    }

    #[tokio::test]
    async fn test_download_heals_corrupted_mirror() {
        let f = fixture();
        let mut block = block(b"precious bytes");
        f.backup.upload(&mut block).await.unwrap();
        f.second.corrupt(block.block_id);

        let mut read = BlockTransfer::download(block.block_id, block.file_id, block.size, block.checksum.clone());
        let outcome = f.backup.download(&mut read).await.unwrap();

        assert_eq!(outcome, DownloadOutcome::Repaired);
        assert_eq!(read.content, block.content);
        assert!(read_direct(&f.second, &block).await.is_intact());
    }

    #[tokio::test]
    async fn test_download_prefers_first_mirror_when_both_match() {
        let f = fixture();
        let mut block = block(b"same on both");
        f.backup.upload(&mut block).await.unwrap();

        let mut read = BlockTransfer::download(block.block_id, block.file_id, block.size, block.checksum.clone());
        assert_eq!(
            f.backup.download(&mut read).await.unwrap(),
            DownloadOutcome::Verified
        );
        assert!(read.is_intact());
    }

    #[tokio::test]
    async fn test_download_with_both_mirrors_corrupted_does_not_repair() {
        let f = fixture();
        let mut block = block(b"doomed");
        f.backup.upload(&mut block).await.unwrap();
        f.first.corrupt(block.block_id);
        f.second.corrupt(block.block_id);
        let first_before = f.first.stored(block.block_id);
        let second_before = f.second.stored(block.block_id);

        let mut read = BlockTransfer::download(block.block_id, block.file_id, block.size, block.checksum.clone());
        let outcome = f.backup.download(&mut read).await.unwrap();

        assert_eq!(outcome, DownloadOutcome::Unrecoverable);
        assert_eq!(f.first.stored(block.block_id), first_before);
        assert_eq!(f.second.stored(block.block_id), second_before);
    }

    #[tokio::test]
    async fn test_download_degraded_when_one_mirror_fails() {
        let f = fixture();
        let mut block = block(b"half available");
        f.backup.upload(&mut block).await.unwrap();
        f.first.fail_downloads(true);

        let (read, fired) = counting(BlockTransfer::download(
            block.block_id,
            block.file_id,
            block.size,
            block.checksum.clone(),
        ));
        let mut read = read;
        let outcome = f.backup.download(&mut read).await.unwrap();

        assert_eq!(outcome, DownloadOutcome::Degraded);
        assert!(read.is_intact());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_fails_when_both_mirrors_fail() {
        let f = fixture();
        let mut block = block(b"gone");
        f.backup.upload(&mut block).await.unwrap();
        f.first.fail_downloads(true);
        f.second.fail_downloads(true);

        let mut read = BlockTransfer::download(block.block_id, block.file_id, block.size, block.checksum.clone());
        let err = f.backup.download(&mut read).await.unwrap_err();
        assert_eq!(err.code(), "REM-003");
    }

    #[tokio::test]
    async fn test_remove_and_rename_fan_out() {
        let f = fixture();
        let mut block = block(b"short lived");
        f.backup.upload(&mut block).await.unwrap();

        let renamed = BlockId::new();
        f.backup.rename(block.block_id, renamed).await.unwrap();
        assert!(f.first.stored(renamed).is_some());
        assert!(f.second.stored(renamed).is_some());

        block.block_id = renamed;
        f.second.fail_removes(true);
        let err = f.backup.remove(&mut block).await.unwrap_err();
        assert_eq!(err.code(), "REM-004");

        f.second.fail_removes(false);
        f.backup.remove(&mut block).await.unwrap();
        assert!(f.first.stored(renamed).is_none());
        assert!(f.second.stored(renamed).is_none());
    }

    #[test]
    fn test_third_disk_is_rejected() {
        let f = fixture();
        let third = Arc::new(MemoryDisk::new(VolumeId::new(), "third", 100));
        let err = f.backup.assign_disk(third.clone()).unwrap_err();

        assert_eq!(err.code(), "DSK-010");
        assert!(!f.backup.contains(third.id()));
        assert!(f.backup.contains(f.first.id()));
    }

    #[test]
    fn test_total_space_is_pushed_to_both_mirrors() {
        let f = fixture();
        f.backup.set_total_space(50);

        assert_eq!(f.first.total_space(), 50);
        assert_eq!(f.second.total_space(), 50);
        assert_eq!(f.backup.total_space(), 50);

        f.first.set_total_space(30);
        assert_eq!(f.backup.total_space(), 30);
    }

    #[tokio::test]
    async fn test_provider_space_is_pessimistic() {
        let f = fixture();
        f.first.set_provider_space(ProviderSpace::Supported { used: 10, total: 500 });
        f.second.set_provider_space(ProviderSpace::Supported { used: 40, total: 300 });
        assert_eq!(
            f.backup.provider_space().await,
            ProviderSpace::Supported { used: 40, total: 300 }
        );

        f.second.set_provider_space(ProviderSpace::NotSupported);
        assert_eq!(f.backup.provider_space().await, ProviderSpace::NotSupported);
    }

    #[tokio::test]
    async fn test_identity_operations_are_unsupported() {
        let f = fixture();
        assert_eq!(f.backup.name().unwrap_err().code(), "DSK-011");
        assert_eq!(f.backup.credentials().unwrap_err().code(), "DSK-011");
        assert_eq!(f.backup.provider_id().unwrap_err().code(), "DSK-011");
        assert!(f.backup.is_virtual());
    }

    #[tokio::test]
    async fn test_ready_iff_both_mirrors_ready() {
        let f = fixture();
        assert!(f.backup.readiness().is_ready_force().await);

        f.second.set_ready(false);
        assert!(!f.backup.readiness().is_ready_force().await);

        let incomplete = BackupDisk::new(VolumeId::new());
        assert!(!incomplete.is_ready().await);
    }
}
