//! Disk capability contract
//!
//! [`Disk`] is implemented by every backend and by the mirrored
//! [`BackupDisk`](crate::BackupDisk). Transfer operations have no default and
//! must be provided by each implementation; bookkeeping accessors default to
//! the shared [`DiskCore`] every disk embeds.

use crate::credentials::Credentials;
use crate::readiness::DiskReadiness;
use crate::transfer::BlockTransfer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cumulus_common::{
    BlockId, DiskId, DiskRecord, Error, ProviderId, ProviderRecord, ProviderType, Repository,
    RepositoryExt, Result, UserId, VolumeId,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Capacity as reported by the backend itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderSpace {
    Supported { used: u64, total: u64 },
    /// The backend does not expose its quota
    NotSupported,
    /// The backend was asked and failed to answer
    Failed(String),
}

/// How a successful download was served
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Read from a single real disk, not verified
    Direct,
    /// Read from a mirror whose copy matched the expected checksum
    Verified,
    /// Verified, and the diverging mirror was rewritten from the good copy
    Repaired,
    /// Only one mirror answered; its copy is served unverified
    Degraded,
    /// Both mirrors answered and neither copy matches the expected checksum
    Unrecoverable,
}

/// A storage target that can hold blocks
#[async_trait]
pub trait Disk: Send + Sync {
    /// Store the block content
    async fn upload(&self, block: &mut BlockTransfer) -> Result<()>;

    /// Fill the block content from the disk
    async fn download(&self, block: &mut BlockTransfer) -> Result<DownloadOutcome>;

    /// Move a stored block to a new identifier
    async fn rename(&self, from: BlockId, to: BlockId) -> Result<()>;

    /// Delete the stored block
    async fn remove(&self, block: &mut BlockTransfer) -> Result<()>;

    /// Capacity reported by the backend
    async fn provider_space(&self) -> ProviderSpace;

    /// Shared bookkeeping state
    fn core(&self) -> &DiskCore;

    /// Readiness cache of this disk
    fn readiness(&self) -> Arc<dyn DiskReadiness>;

    fn id(&self) -> DiskId {
        self.core().id()
    }

    fn volume_id(&self) -> VolumeId {
        self.core().volume_id()
    }

    fn provider_type(&self) -> ProviderType {
        self.core().provider_type()
    }

    fn provider_id(&self) -> Result<ProviderId> {
        Ok(ProviderRecord::for_type(self.provider_type()).id)
    }

    fn name(&self) -> Result<String> {
        Ok(self.core().name())
    }

    fn set_name(&self, name: &str) -> Result<()> {
        self.core().set_name(name);
        Ok(())
    }

    fn credentials(&self) -> Result<Credentials> {
        self.core()
            .credentials()
            .cloned()
            .ok_or_else(|| Error::unsupported(format!("disk {} has no credentials", self.id())))
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.core().created_at()
    }

    fn is_virtual(&self) -> bool {
        self.core().is_virtual()
    }

    fn virtual_disk_id(&self) -> Option<DiskId> {
        self.core().virtual_disk_id()
    }

    fn set_virtual_disk_id(&self, id: Option<DiskId>) {
        self.core().set_virtual_disk_id(id);
    }

    fn total_space(&self) -> u64 {
        self.core().total_space()
    }

    fn set_total_space(&self, quota: u64) {
        self.core().set_total_space(quota);
    }

    fn used_space(&self) -> u64 {
        self.core().used_space()
    }

    fn set_used_space(&self, usage: u64) {
        self.core().set_used_space(usage);
    }

    /// Apply a signed change to the used space and persist the new value
    async fn update_used_space(&self, delta: i64) -> Result<()> {
        self.core().update_used_space(delta).await
    }

    async fn is_ready(&self) -> bool {
        self.readiness().is_ready().await
    }

    /// Persistence record of this disk
    fn to_record(&self, user_id: UserId, provider_id: ProviderId) -> Result<DiskRecord> {
        self.core().to_record(user_id, provider_id)
    }
}

/// Bookkeeping shared by every disk implementation
pub struct DiskCore {
    id: DiskId,
    volume_id: VolumeId,
    provider_type: ProviderType,
    name: RwLock<String>,
    credentials: Option<Credentials>,
    created_at: DateTime<Utc>,
    is_virtual: bool,
    virtual_disk_id: RwLock<Option<DiskId>>,
    total_space: AtomicU64,
    used_space: AtomicU64,
    /// Serialises read-modify-persist of `used_space`
    usage_lock: tokio::sync::Mutex<()>,
    repository: Option<Arc<dyn Repository>>,
}

impl DiskCore {
    /// Fresh disk with a random identifier
    #[must_use]
    pub fn new(volume_id: VolumeId, provider_type: ProviderType, name: impl Into<String>) -> Self {
        Self {
            id: DiskId::new(),
            volume_id,
            provider_type,
            name: RwLock::new(name.into()),
            credentials: None,
            created_at: Utc::now(),
            is_virtual: provider_type.is_virtual(),
            virtual_disk_id: RwLock::new(None),
            total_space: AtomicU64::new(0),
            used_space: AtomicU64::new(0),
            usage_lock: tokio::sync::Mutex::new(()),
            repository: None,
        }
    }

    /// Restore a disk from its persistence record
    ///
    /// # Errors
    /// Returns an error if the stored credentials cannot be parsed.
    pub fn from_record(record: &DiskRecord, provider_type: ProviderType) -> Result<Self> {
        let credentials = if record.credentials.is_empty() {
            None
        } else {
            Some(Credentials::parse(&record.credentials)?)
        };

        Ok(Self {
            id: record.id,
            volume_id: record.volume_id,
            provider_type,
            name: RwLock::new(record.name.clone()),
            credentials,
            created_at: record.created_at,
            is_virtual: record.is_virtual,
            virtual_disk_id: RwLock::new(record.virtual_disk_id),
            total_space: AtomicU64::new(record.total_space),
            used_space: AtomicU64::new(record.used_space),
            usage_lock: tokio::sync::Mutex::new(()),
            repository: None,
        })
    }

    #[must_use]
    pub const fn with_id(mut self, id: DiskId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_total_space(self, quota: u64) -> Self {
        self.total_space.store(quota, Ordering::SeqCst);
        self
    }

    /// Persist used-space updates through `repository`
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    #[must_use]
    pub const fn id(&self) -> DiskId {
        self.id
    }

    #[must_use]
    pub const fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[must_use]
    pub const fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    #[must_use]
    pub fn virtual_disk_id(&self) -> Option<DiskId> {
        *self.virtual_disk_id.read()
    }

    pub fn set_virtual_disk_id(&self, id: Option<DiskId>) {
        *self.virtual_disk_id.write() = id;
    }

    #[must_use]
    pub fn total_space(&self) -> u64 {
        self.total_space.load(Ordering::SeqCst)
    }

    pub fn set_total_space(&self, quota: u64) {
        self.total_space.store(quota, Ordering::SeqCst);
    }

    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.used_space.load(Ordering::SeqCst)
    }

    pub fn set_used_space(&self, usage: u64) {
        self.used_space.store(usage, Ordering::SeqCst);
    }

    /// Apply `delta` to the used space and persist the result
    ///
    /// Concurrent updates of the same disk are serialised, so the persisted
    /// value always reflects every applied delta. The counter saturates at 0.
    ///
    /// # Errors
    /// Returns the repository error if the new value cannot be persisted; the
    /// in-memory counter keeps the new value.
    pub async fn update_used_space(&self, delta: i64) -> Result<()> {
        let _guard = self.usage_lock.lock().await;

        let used = self.used_space().saturating_add_signed(delta);
        self.set_used_space(used);
        debug!(disk_id = %self.id, delta, used, "Updated used space");

        if let Some(repository) = &self.repository {
            repository
                .update(self.id, |record: &mut DiskRecord| record.used_space = used)
                .inspect_err(|e| {
                    error!("Failed to persist used space of disk {}: {}", self.id, e);
                })?;
        }
        Ok(())
    }

    /// Persistence record of this disk
    ///
    /// # Errors
    /// Returns an error if the credentials cannot be serialized.
    pub fn to_record(&self, user_id: UserId, provider_id: ProviderId) -> Result<DiskRecord> {
        let credentials = match &self.credentials {
            Some(credentials) => credentials.to_json()?,
            None => String::new(),
        };

        Ok(DiskRecord {
            id: self.id,
            user_id,
            volume_id: self.volume_id,
            provider_id,
            credentials,
            name: self.name(),
            total_space: self.total_space(),
            used_space: self.used_space(),
            created_at: self.created_at,
            is_virtual: self.is_virtual,
            virtual_disk_id: self.virtual_disk_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_meta_store::MemoryRepository;

    fn core_with_repository() -> (DiskCore, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::new());
        let core = DiskCore::new(VolumeId::new(), ProviderType::Memory, "scratch")
            .with_total_space(1000)
            .with_repository(repository.clone());
        let record = core
            .to_record(UserId::new(), ProviderRecord::for_type(ProviderType::Memory).id)
            .unwrap();
        repository.create(&record).unwrap();
        (core, repository)
    }

    #[tokio::test]
    async fn test_used_space_is_persisted() {
        let (core, repository) = core_with_repository();

        core.update_used_space(300).await.unwrap();
        core.update_used_space(-100).await.unwrap();

        assert_eq!(core.used_space(), 200);
        let record: DiskRecord = repository.find(core.id()).unwrap().unwrap();
        assert_eq!(record.used_space, 200);
    }

    #[tokio::test]
    async fn test_used_space_saturates_at_zero() {
        let (core, _repository) = core_with_repository();
        core.update_used_space(-5).await.unwrap();
        assert_eq!(core.used_space(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let (core, repository) = core_with_repository();
        let core = Arc::new(core);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let core = Arc::clone(&core);
                tokio::spawn(async move { core.update_used_space(10).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(core.used_space(), 640);
        let record: DiskRecord = repository.find(core.id()).unwrap().unwrap();
        assert_eq!(record.used_space, 640);
    }

    #[test]
    fn test_record_roundtrip_keeps_credentials() {
        let core = DiskCore::new(VolumeId::new(), ProviderType::Local, "local")
            .with_credentials(Credentials::Local {
                path: "/srv/blocks".into(),
            })
            .with_total_space(42);
        let record = core.to_record(UserId::new(), ProviderId::new()).unwrap();

        let restored = DiskCore::from_record(&record, ProviderType::Local).unwrap();
        assert_eq!(restored.id(), core.id());
        assert_eq!(restored.total_space(), 42);
        assert_eq!(restored.credentials(), core.credentials());
    }

    #[tokio::test]
    async fn test_missing_record_surfaces_error() {
        let repository = Arc::new(MemoryRepository::new());
        let core = DiskCore::new(VolumeId::new(), ProviderType::Memory, "orphan")
            .with_repository(repository);
        let err = core.update_used_space(1).await.unwrap_err();
        assert_eq!(err.code(), "DB-001");
        assert_eq!(core.used_space(), 1);
    }
}
