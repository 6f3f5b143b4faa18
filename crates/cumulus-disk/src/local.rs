//! Directory-backed disk
//!
//! Each block is one file named after the block id under the disk's root
//! directory. Used by the CLI and as the reference real backend.

use crate::credentials::Credentials;
use crate::disk::{Disk, DiskCore, DownloadOutcome, ProviderSpace};
use crate::readiness::{CachedReadiness, DiskReadiness};
use crate::transfer::BlockTransfer;
use async_trait::async_trait;
use bytes::Bytes;
use cumulus_common::config::ReadinessConfig;
use cumulus_common::{BlockId, DiskRecord, Error, ProviderType, Result};
use futures::FutureExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Disk storing blocks as files in a local directory
pub struct LocalDisk {
    core: DiskCore,
    root: Arc<PathBuf>,
    readiness: Arc<CachedReadiness>,
}

impl LocalDisk {
    /// Disk over the directory named by `core`'s credentials
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` unless the credentials are local.
    pub fn new(core: DiskCore, config: &ReadinessConfig) -> Result<Self> {
        let root = match core.credentials() {
            Some(credentials @ Credentials::Local { .. }) => {
                credentials.authenticate()?;
                Arc::new(credentials.path().to_path_buf())
            }
            Some(other) => {
                return Err(Error::invalid_argument(format!(
                    "local disk cannot use {other} credentials"
                )));
            }
            None => return Err(Error::invalid_argument("local disk requires a path")),
        };

        let probe_root = Arc::downgrade(&root);
        let alive_root = Arc::downgrade(&root);
        let readiness = CachedReadiness::new(
            Arc::new(move || {
                let root = probe_root.upgrade();
                async move {
                    match root {
                        Some(root) => tokio::fs::metadata(root.as_path())
                            .await
                            .is_ok_and(|m| m.is_dir()),
                        None => false,
                    }
                }
                .boxed()
            }),
            Arc::new(move || alive_root.strong_count() > 0),
            config,
        );

        Ok(Self {
            core,
            root,
            readiness: Arc::new(readiness),
        })
    }

    /// Restore a disk from its record
    ///
    /// # Errors
    /// Returns an error if the record does not hold local credentials.
    pub fn from_record(record: &DiskRecord, config: &ReadinessConfig) -> Result<Self> {
        Self::new(DiskCore::from_record(record, ProviderType::Local)?, config)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.root.join(block_id.to_string())
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn cumulus_common::Repository>) -> Self {
        self.core = self.core.with_repository(repository);
        self
    }
}

#[async_trait]
impl Disk for LocalDisk {
    async fn upload(&self, block: &mut BlockTransfer) -> Result<()> {
        block.start();
        let path = self.block_path(block.block_id);
        let staging = path.with_extension("part");

        let written = async {
            tokio::fs::create_dir_all(self.root.as_path()).await?;
            tokio::fs::write(&staging, &block.content).await?;
            tokio::fs::rename(&staging, &path).await
        }
        .await;

        if let Err(e) = written {
            block.fail();
            warn!("Failed to write block {} to {}: {}", block.block_id, path.display(), e);
            return Err(e.into());
        }

        block.complete();
        debug!("Wrote block {} to {}", block.block_id, path.display());
        Ok(())
    }

    async fn download(&self, block: &mut BlockTransfer) -> Result<DownloadOutcome> {
        block.start();
        match tokio::fs::read(self.block_path(block.block_id)).await {
            Ok(content) => {
                block.content = Bytes::from(content);
                block.complete();
                Ok(DownloadOutcome::Direct)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                block.fail();
                Err(Error::BlockNotFound(block.block_id))
            }
            Err(e) => {
                block.fail();
                Err(e.into())
            }
        }
    }

    async fn rename(&self, from: BlockId, to: BlockId) -> Result<()> {
        match tokio::fs::rename(self.block_path(from), self.block_path(to)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::BlockNotFound(from)),
            other => Ok(other?),
        }
    }

    async fn remove(&self, block: &mut BlockTransfer) -> Result<()> {
        match tokio::fs::remove_file(self.block_path(block.block_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Block {} already absent from {}", block.block_id, self.root.display());
            }
            Err(e) => return Err(e.into()),
        }
        block.complete();
        Ok(())
    }

    async fn provider_space(&self) -> ProviderSpace {
        filesystem_space(Arc::clone(&self.root)).await
    }

    fn core(&self) -> &DiskCore {
        &self.core
    }

    fn readiness(&self) -> Arc<dyn DiskReadiness> {
        self.readiness.clone()
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
async fn filesystem_space(root: Arc<PathBuf>) -> ProviderSpace {
    let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(root.as_path())).await;
    match stat {
        Ok(Ok(stat)) => {
            let fragment = stat.fragment_size() as u64;
            let total = stat.blocks() as u64 * fragment;
            let available = stat.blocks_available() as u64 * fragment;
            ProviderSpace::Supported {
                used: total.saturating_sub(available),
                total,
            }
        }
        Ok(Err(e)) => ProviderSpace::Failed(e.to_string()),
        Err(e) => ProviderSpace::Failed(e.to_string()),
    }
}

#[cfg(not(unix))]
async fn filesystem_space(_root: Arc<PathBuf>) -> ProviderSpace {
    ProviderSpace::NotSupported
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_common::{FileId, VolumeId};
    use tempfile::TempDir;

    fn local_disk(dir: &TempDir) -> LocalDisk {
        let core = DiskCore::new(VolumeId::new(), ProviderType::Local, "local")
            .with_credentials(Credentials::Local {
                path: dir.path().join("blocks").display().to_string(),
            })
            .with_total_space(1 << 20);
        LocalDisk::new(core, &ReadinessConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_block_lifecycle() {
        let dir = TempDir::new().unwrap();
        let disk = local_disk(&dir);
        let mut block = BlockTransfer::upload(BlockId::new(), FileId::new(), Bytes::from_static(b"on disk"));

        disk.upload(&mut block).await.unwrap();
        assert!(disk.root().join(block.block_id.to_string()).exists());

        let renamed = BlockId::new();
        disk.rename(block.block_id, renamed).await.unwrap();

        let mut read = BlockTransfer::download(renamed, block.file_id, block.size, block.checksum.clone());
        assert_eq!(disk.download(&mut read).await.unwrap(), DownloadOutcome::Direct);
        assert!(read.is_intact());

        disk.remove(&mut read).await.unwrap();
        // Removing twice is not an error
        disk.remove(&mut read).await.unwrap();
        let err = disk.download(&mut read).await.unwrap_err();
        assert_eq!(err.code(), "FS-001");
    }

    #[tokio::test]
    async fn test_requires_local_credentials() {
        let core = DiskCore::new(VolumeId::new(), ProviderType::Local, "x");
        assert!(LocalDisk::new(core, &ReadinessConfig::default()).is_err());

        let core = DiskCore::new(VolumeId::new(), ProviderType::Local, "x").with_credentials(
            Credentials::OAuth {
                access_token: "t".into(),
                refresh_token: "r".into(),
                path: "/".into(),
            },
        );
        assert!(LocalDisk::new(core, &ReadinessConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_readiness_checks_directory() {
        let dir = TempDir::new().unwrap();
        let disk = local_disk(&dir);
        assert!(!disk.readiness().is_ready_force().await);

        std::fs::create_dir_all(disk.root()).unwrap();
        assert!(disk.readiness().is_ready_force().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_provider_space_is_reported() {
        let dir = TempDir::new().unwrap();
        let disk = local_disk(&dir);
        std::fs::create_dir_all(disk.root()).unwrap();

        match disk.provider_space().await {
            ProviderSpace::Supported { used, total } => assert!(used <= total && total > 0),
            other => panic!("unexpected provider space {other:?}"),
        }
    }
}
