//! Volume management
//!
//! A [`Volume`] owns the disks attached to it, the virtual RAID1 disks built
//! over them, and the partitioner that places new blocks. Blocks go to real
//! disks when the volume has no backup and to virtual disks otherwise.
//!
//! The partitioner and the measured disk weights are cached until the disk
//! set changes. Free space is measured again for every file.

use crate::block::Block;
use crate::crypto::{BlockCipher, NONCE_LEN, TAG_LEN};
use crate::file::{FileMeta, RegularFile};
use crate::partitioner::{self, Candidate, Partitioner};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cumulus_common::{
    BackupMode, DEFAULT_VOLUME_BLOCK_SIZE, DiskId, DiskRecord, EncryptionMode, Error, FileId,
    ProviderRecord, ProviderType, Repository, RepositoryExt, Result, UserId, VolumeId,
    VolumeRecord, VolumeSettings,
};
use cumulus_disk::{BackupDisk, Disk, DiskRegistry};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Partitioner of a volume with the disks it places on
pub struct Placement {
    pub partitioner: Arc<dyn Partitioner>,
    /// Placement disks in a stable order, with their weights
    pub candidates: Vec<Candidate>,
}

/// A user's logical volume
pub struct Volume {
    id: VolumeId,
    name: String,
    user_id: UserId,
    settings: VolumeSettings,
    block_size: u64,
    created_at: DateTime<Utc>,
    disks: RwLock<BTreeMap<DiskId, Arc<dyn Disk>>>,
    virtual_disks: RwLock<BTreeMap<DiskId, Arc<BackupDisk>>>,
    /// `None` once the disk set changed
    placement: RwLock<Option<Arc<Placement>>>,
    /// Bumped on every disk set change
    generation: AtomicU64,
    cipher: Option<BlockCipher>,
}

impl Volume {
    /// Fresh volume without disks
    #[must_use]
    pub fn new(name: &str, user_id: UserId, settings: VolumeSettings, block_size: u64) -> Self {
        Self::from_record(&VolumeRecord {
            id: VolumeId::new(),
            name: name.to_string(),
            user_id,
            settings,
            block_size,
            created_at: Utc::now(),
        })
    }

    /// Volume restored from its record, without disks
    #[must_use]
    pub fn from_record(record: &VolumeRecord) -> Self {
        let block_size = if record.block_size == 0 {
            DEFAULT_VOLUME_BLOCK_SIZE
        } else {
            record.block_size
        };

        Self {
            id: record.id,
            name: record.name.clone(),
            user_id: record.user_id,
            settings: record.settings,
            block_size,
            created_at: record.created_at,
            disks: RwLock::new(BTreeMap::new()),
            virtual_disks: RwLock::new(BTreeMap::new()),
            placement: RwLock::new(None),
            generation: AtomicU64::new(0),
            cipher: None,
        }
    }

    /// Volume restored with its disks
    ///
    /// Real disks are built through `registry`, then the virtual disks are
    /// assembled over them. A disk whose backend cannot be built is skipped.
    #[must_use]
    pub fn hydrate(record: &VolumeRecord, disks: &[DiskRecord], registry: &DiskRegistry) -> Self {
        let volume = Self::from_record(record);

        for disk in disks.iter().filter(|disk| !disk.is_virtual) {
            let Some(provider_type) = ProviderRecord::type_of(disk.provider_id) else {
                warn!("Disk {} has an unknown provider {}", disk.id, disk.provider_id);
                continue;
            };
            match registry.create(provider_type, disk) {
                Ok(disk) => volume.add_disk(disk),
                Err(e) => warn!("Cannot load disk {} of volume {}: {}", disk.id, record.id, e),
            }
        }

        for disk in disks.iter().filter(|disk| disk.is_virtual) {
            volume.create_virtual_disk(disk);
        }

        info!(
            "Loaded volume {} with {} disks and {} virtual disks",
            volume.id,
            volume.disks.read().len(),
            volume.virtual_disks.read().len()
        );
        volume
    }

    /// Encrypt blocks with `cipher` when the volume enables encryption
    #[must_use]
    pub fn with_cipher(mut self, cipher: BlockCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub const fn id(&self) -> VolumeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub const fn settings(&self) -> VolumeSettings {
        self.settings
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn to_record(&self) -> VolumeRecord {
        VolumeRecord {
            id: self.id,
            name: self.name.clone(),
            user_id: self.user_id,
            settings: self.settings,
            block_size: self.block_size,
            created_at: self.created_at,
        }
    }

    /// Real or virtual disk of this volume
    #[must_use]
    pub fn disk(&self, disk_id: DiskId) -> Option<Arc<dyn Disk>> {
        if let Some(disk) = self.disks.read().get(&disk_id) {
            return Some(Arc::clone(disk));
        }
        if let Some(disk) = self.virtual_disks.read().get(&disk_id) {
            return Some(Arc::clone(disk) as Arc<dyn Disk>);
        }
        debug!("Disk {} is not part of volume {}", disk_id, self.id);
        None
    }

    /// Real disks, ordered by identifier
    #[must_use]
    pub fn disks(&self) -> Vec<Arc<dyn Disk>> {
        self.disks.read().values().cloned().collect()
    }

    #[must_use]
    pub fn virtual_disks(&self) -> Vec<Arc<BackupDisk>> {
        self.virtual_disks.read().values().cloned().collect()
    }

    pub fn add_disk(&self, disk: Arc<dyn Disk>) {
        let disk_id = disk.id();
        self.disks.write().insert(disk_id, disk);
        self.invalidate_placement();
        debug!("Added disk {} to volume {}", disk_id, self.id);
    }

    /// Detach a real disk
    pub fn delete_disk(&self, disk_id: DiskId) -> Option<Arc<dyn Disk>> {
        let removed = self.disks.write().remove(&disk_id);
        if removed.is_some() {
            self.invalidate_placement();
            debug!("Deleted disk {} from volume {}", disk_id, self.id);
        } else {
            warn!("Disk {} is not part of volume {}", disk_id, self.id);
        }
        removed
    }

    pub fn add_virtual_disk(&self, disk: Arc<BackupDisk>) {
        let disk_id = disk.id();
        self.virtual_disks.write().insert(disk_id, disk);
        self.invalidate_placement();
        debug!("Added virtual disk {} to volume {}", disk_id, self.id);
    }

    /// Detach a virtual disk together with its member disks
    pub fn delete_virtual_disk(&self, disk_id: DiskId) -> Option<Arc<BackupDisk>> {
        let removed = self.virtual_disks.write().remove(&disk_id);
        self.disks
            .write()
            .retain(|_, disk| disk.virtual_disk_id() != Some(disk_id));
        self.invalidate_placement();
        debug!("Deleted virtual disk {} from volume {}", disk_id, self.id);
        removed
    }

    /// Assemble the virtual disk described by `record` over its members
    ///
    /// Members are the real disks whose `virtual_disk_id` points at the
    /// record. Returns `None` when the volume has no backup or the members
    /// do not form a pair.
    pub fn create_virtual_disk(&self, record: &DiskRecord) -> Option<Arc<BackupDisk>> {
        match self.settings.backup {
            BackupMode::NoBackup => None,
            BackupMode::Raid1 => {
                let members: Vec<Arc<dyn Disk>> = self
                    .disks
                    .read()
                    .values()
                    .filter(|disk| disk.virtual_disk_id() == Some(record.id))
                    .cloned()
                    .collect();

                if members.len() != 2 {
                    error!(
                        "Cannot build RAID1 disk {}: expected 2 member disks, found {}",
                        record.id,
                        members.len()
                    );
                    return None;
                }

                let disk = Arc::new(BackupDisk::with_id(record.id, self.id));
                for member in members {
                    disk.assign_disk(member).ok()?;
                }
                self.add_virtual_disk(Arc::clone(&disk));
                Some(disk)
            }
        }
    }

    /// Pair a newly attached disk with an unpaired disk of this volume
    ///
    /// Creates the virtual disk record, links both members to it in the
    /// repository and in memory, and assembles the virtual disk. Returns the
    /// virtual disk identifier, or `None` when the volume has no backup or no
    /// partner is available yet.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub fn pair_new_disk(
        &self,
        new_disk: DiskId,
        repository: &dyn Repository,
    ) -> Result<Option<DiskId>> {
        if self.settings.backup == BackupMode::NoBackup {
            return Ok(None);
        }

        let mut unpaired = repository.find_by::<DiskRecord>(|disk| {
            disk.volume_id == self.id
                && !disk.is_virtual
                && disk.virtual_disk_id.is_none()
                && disk.id != new_disk
        })?;
        unpaired.sort_by_key(|disk| disk.created_at);
        let Some(partner) = unpaired.into_iter().next() else {
            debug!("No unpaired disk to mirror disk {} with", new_disk);
            return Ok(None);
        };

        let virtual_disk = DiskRecord {
            id: DiskId::new(),
            user_id: partner.user_id,
            volume_id: self.id,
            provider_id: ProviderRecord::for_type(ProviderType::Raid1).id,
            credentials: String::new(),
            name: ProviderType::Raid1.as_str().to_string(),
            total_space: 0,
            used_space: 0,
            created_at: Utc::now(),
            is_virtual: true,
            virtual_disk_id: None,
        };
        repository.create(&virtual_disk)?;

        for member in [partner.id, new_disk] {
            repository.update::<DiskRecord>(member, |disk| {
                disk.virtual_disk_id = Some(virtual_disk.id);
            })?;
            if let Some(disk) = self.disks.read().get(&member) {
                disk.set_virtual_disk_id(Some(virtual_disk.id));
            }
        }

        self.create_virtual_disk(&virtual_disk);
        info!(
            "Paired disks {} and {} into virtual disk {}",
            partner.id, new_disk, virtual_disk.id
        );
        Ok(Some(virtual_disk.id))
    }

    /// Disks new blocks are placed on
    #[must_use]
    pub fn placement_disks(&self) -> Vec<Arc<dyn Disk>> {
        match self.settings.backup {
            BackupMode::NoBackup => self.disks(),
            BackupMode::Raid1 => self
                .virtual_disks
                .read()
                .values()
                .map(|disk| Arc::clone(disk) as Arc<dyn Disk>)
                .collect(),
        }
    }

    fn invalidate_placement(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.placement.write() = None;
    }

    /// Rebuild the placement from the current placement disks
    pub async fn refresh_placement(&self) -> Arc<Placement> {
        let generation = self.generation.load(Ordering::SeqCst);
        let candidates = Candidate::collect(
            self.placement_disks(),
            self.settings.partition,
            self.block_size,
        )
        .await;
        let placement = Arc::new(Placement {
            partitioner: partitioner::build(self.settings.partition),
            candidates,
        });

        let mut current = self.placement.write();
        if self.generation.load(Ordering::SeqCst) == generation {
            *current = Some(Arc::clone(&placement));
        }
        placement
    }

    /// Current placement, rebuilt if the disk set changed
    pub async fn placement(&self) -> Arc<Placement> {
        let cached = self.placement.read().clone();
        match cached {
            Some(placement) => placement,
            None => self.refresh_placement().await,
        }
    }

    /// Bytes a block of `size` plaintext bytes occupies on a disk
    #[must_use]
    pub const fn stored_size(&self, size: u64) -> u64 {
        match self.settings.encryption {
            EncryptionMode::NoEncryption => size,
            EncryptionMode::Aes256 => size + (NONCE_LEN + TAG_LEN) as u64,
        }
    }

    /// Split a new file into blocks and place every block on a disk
    ///
    /// A file of `size` bytes gets `max(ceil(size / block_size), 1)` blocks;
    /// all but the last are `block_size` bytes long. Blocks are placed
    /// against the free space the disks report now; nothing is reserved, so
    /// a failed request leaves no trace.
    ///
    /// # Errors
    /// Returns `Error::NoDiskAvailable` if some block cannot be placed.
    pub async fn file_upload_request(
        &self,
        name: &str,
        size: u64,
        user_id: UserId,
        root_id: Option<FileId>,
    ) -> Result<RegularFile> {
        let placement = self.placement().await;
        let mut candidates = Candidate::refreshed(&placement.candidates).await;
        let file = RegularFile::new(FileMeta::new(self.id, root_id, user_id, name), size);
        let block_count = size.div_ceil(self.block_size).max(1);

        for order in 0..block_count {
            let block_size = if order + 1 == block_count {
                size - order * self.block_size
            } else {
                self.block_size
            };
            let required = self.stored_size(block_size);
            let Some(disk) = placement.partitioner.assign_disk(&mut candidates, required) else {
                error!(
                    "No disk of volume {} can hold block {} of file {} ({} bytes)",
                    self.id, order, name, required
                );
                return Err(Error::NoDiskAvailable { required });
            };

            debug!("Block {} of file {} assigned to disk {}", order, name, disk.id());
            file.insert_block(Block::new(file.id(), user_id, self.id, disk, block_size, order));
        }

        Ok(file)
    }

    /// Encrypt a block payload when the volume enables encryption
    ///
    /// # Errors
    /// Returns `Error::Encryption` if no key is configured or sealing fails.
    pub fn encrypt(&self, payload: Bytes) -> Result<Bytes> {
        match self.settings.encryption {
            EncryptionMode::NoEncryption => Ok(payload),
            EncryptionMode::Aes256 => Ok(Bytes::from(self.cipher()?.encrypt(&payload)?)),
        }
    }

    /// Reverse [`Volume::encrypt`]
    ///
    /// # Errors
    /// Returns `Error::Encryption` if no key is configured or the payload
    /// fails authentication.
    pub fn decrypt(&self, payload: Bytes) -> Result<Bytes> {
        match self.settings.encryption {
            EncryptionMode::NoEncryption => Ok(payload),
            EncryptionMode::Aes256 => Ok(Bytes::from(self.cipher()?.decrypt(&payload)?)),
        }
    }

    fn cipher(&self) -> Result<&BlockCipher> {
        self.cipher.as_ref().ok_or_else(|| {
            error!("Volume {} is encrypted but no key is configured", self.id);
            Error::Encryption(format!("no encryption key configured for volume {}", self.id))
        })
    }

    /// Whether the volume has disks and every disk is ready
    pub async fn is_ready(&self) -> bool {
        let disks = self.disks();
        if disks.is_empty() {
            return false;
        }
        join_all(disks.iter().map(|disk| disk.is_ready()))
            .await
            .into_iter()
            .all(|ready| ready)
    }
}
