//! Transfer orchestration
//!
//! [`Transport`] keeps the active volumes and the in-flight files in
//! lease-expiring caches, hydrates volumes from the repository on a cache
//! miss, and drives block uploads and downloads against the disks a volume
//! places them on.
//!
//! One `Transport` is built at startup and shared by every request.

use crate::cache::InstanceCache;
use bytes::{Bytes, BytesMut};
use cumulus_common::{
    BlockRecord, BlockStatus, Config, DiskId, DiskRecord, EncryptionMode, Error, FileId,
    FileRecord, FileType, ProviderRecord, ProviderType, Repository, RepositoryExt, Result,
    UserId, VolumeId, VolumeRecord, VolumeSettings, content_checksum,
};
use cumulus_disk::{BlockTransfer, Credentials, Disk, DiskCore, DiskRegistry, DownloadOutcome};
use cumulus_volume::{Block, BlockCipher, Directory, File, FileMeta, RegularFile, Volume};
use futures::future::{join_all, try_join_all};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Process-wide registry of hot volumes and in-flight files
pub struct Transport {
    active_volumes: InstanceCache<VolumeId, Volume>,
    file_uploads: InstanceCache<FileId, File>,
    file_downloads: InstanceCache<FileId, File>,
    repository: Arc<dyn Repository>,
    registry: DiskRegistry,
    config: Config,
    cipher: Option<BlockCipher>,
}

impl Transport {
    /// Transport over `repository`, building disks through `registry`
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, registry: DiskRegistry, config: Config) -> Self {
        let lease = config.transport.lease();
        Self {
            active_volumes: InstanceCache::new("active volumes", lease),
            file_uploads: InstanceCache::new("file uploads", lease),
            file_downloads: InstanceCache::new("file downloads", lease),
            repository,
            registry,
            config,
            cipher: None,
        }
    }

    /// Key used by encrypted volumes
    #[must_use]
    pub fn with_cipher(mut self, cipher: BlockCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }

    #[must_use]
    pub const fn registry(&self) -> &DiskRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn active_volumes(&self) -> &InstanceCache<VolumeId, Volume> {
        &self.active_volumes
    }

    #[must_use]
    pub const fn file_uploads(&self) -> &InstanceCache<FileId, File> {
        &self.file_uploads
    }

    #[must_use]
    pub const fn file_downloads(&self) -> &InstanceCache<FileId, File> {
        &self.file_downloads
    }

    /// Store the provider entry of every provider type that lacks one
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub fn seed_providers(&self) -> Result<()> {
        for provider_type in ProviderType::ALL {
            let provider = ProviderRecord::for_type(provider_type);
            if self.repository.find::<ProviderRecord>(provider.id)?.is_none() {
                self.repository.create(&provider)?;
                debug!("Seeded provider {}", provider_type);
            }
        }
        Ok(())
    }

    // Volumes

    /// Create, persist and activate a volume
    ///
    /// # Errors
    /// Returns `Error::Encryption` if the volume is encrypted and no key is
    /// configured, or the repository error.
    pub fn create_volume(
        &self,
        name: &str,
        user_id: UserId,
        settings: VolumeSettings,
    ) -> Result<Arc<Volume>> {
        let volume = self.attach_cipher(Volume::new(
            name,
            user_id,
            settings,
            self.config.volume.block_size,
        ))?;
        self.repository.create(&volume.to_record())?;

        let volume = Arc::new(volume);
        self.active_volumes
            .enqueue_instance(volume.id(), Arc::clone(&volume));
        info!("Created volume {} ({}) for user {}", volume.id(), name, user_id);
        Ok(volume)
    }

    fn attach_cipher(&self, volume: Volume) -> Result<Volume> {
        match (&self.cipher, volume.settings().encryption) {
            (Some(cipher), _) => Ok(volume.with_cipher(cipher.clone())),
            (None, EncryptionMode::NoEncryption) => Ok(volume),
            (None, EncryptionMode::Aes256) => Err(Error::Encryption(format!(
                "volume {} is encrypted but no key is configured",
                volume.id()
            ))),
        }
    }

    /// Active volume, extending its residency
    ///
    /// A volume that is not cached is hydrated from the repository with its
    /// disks and cached.
    ///
    /// # Errors
    /// Returns `Error::VolumeNotFound` if the repository has no such volume.
    pub fn volume_keep_alive(&self, volume_id: VolumeId) -> Result<Arc<Volume>> {
        if let Some(volume) = self.touch_volume(volume_id) {
            return Ok(volume);
        }

        let record: VolumeRecord = self
            .repository
            .find(volume_id)?
            .ok_or(Error::VolumeNotFound(volume_id))?;
        let disks = self
            .repository
            .find_by::<DiskRecord>(|disk| disk.volume_id == volume_id)?;
        let volume = self.attach_cipher(Volume::hydrate(&record, &disks, &self.registry))?;

        // Another request may have hydrated it meanwhile
        if let Some(volume) = self.touch_volume(volume_id) {
            return Ok(volume);
        }
        let volume = Arc::new(volume);
        self.active_volumes
            .enqueue_instance(volume_id, Arc::clone(&volume));
        Ok(volume)
    }

    fn touch_volume(&self, volume_id: VolumeId) -> Option<Arc<Volume>> {
        let volume = self.active_volumes.get_enqueued_instance(volume_id)?;
        self.active_volumes.mark_as_used(volume_id).ok()?;
        self.active_volumes.mark_as_completed(volume_id).ok()?;
        Some(volume)
    }

    /// Volumes of a user, oldest first
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub fn get_volumes(&self, user_id: UserId) -> Result<Vec<VolumeRecord>> {
        let mut volumes = self
            .repository
            .find_by::<VolumeRecord>(|volume| volume.user_id == user_id)?;
        volumes.sort_by_key(|volume| volume.created_at);
        Ok(volumes)
    }

    /// Delete a volume with every disk, file and block it holds
    ///
    /// # Errors
    /// Returns `Error::VolumeBusy` while a file of the volume is in flight,
    /// or the first failure met while deleting.
    pub async fn delete_volume(&self, volume_id: VolumeId) -> Result<()> {
        let volume = self.volume_keep_alive(volume_id)?;
        if let Some(file) = self.find_enqueued_volume(volume_id) {
            warn!("Cannot delete volume {}: file {} is in flight", volume_id, file.id());
            return Err(Error::VolumeBusy(volume_id));
        }

        let files = self
            .repository
            .find_by::<FileRecord>(|file| file.volume_id == volume_id)?;
        try_join_all(files.iter().map(|file| self.purge_file(&volume, file))).await?;

        let units: Vec<Arc<dyn Disk>> = volume
            .virtual_disks()
            .into_iter()
            .map(|disk| disk as Arc<dyn Disk>)
            .chain(
                volume
                    .disks()
                    .into_iter()
                    .filter(|disk| disk.virtual_disk_id().is_none()),
            )
            .collect();
        try_join_all(units.into_iter().map(|disk| self.delete_disk_unit(&volume, disk))).await?;

        // Records of disks whose backend could not be loaded
        for disk in self
            .repository
            .find_by::<DiskRecord>(|disk| disk.volume_id == volume_id)?
        {
            self.repository.delete::<DiskRecord>(disk.id)?;
        }
        self.repository.delete::<VolumeRecord>(volume_id)?;
        self.active_volumes.remove_enqueued_instance(volume_id);
        info!("Deleted volume {}", volume_id);
        Ok(())
    }

    // Disks

    /// Attach a new disk to a volume
    ///
    /// On a RAID1 volume the disk is paired with the oldest unpaired disk,
    /// if any.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedOperation` if no backend handles
    /// `provider_type`, `Error::InvalidArgument` if the credentials do not
    /// fit it, or the backend and repository errors.
    pub fn attach_disk(
        &self,
        volume_id: VolumeId,
        user_id: UserId,
        provider_type: ProviderType,
        name: &str,
        credentials: Option<Credentials>,
        quota: u64,
    ) -> Result<DiskId> {
        if provider_type.is_virtual() {
            return Err(Error::invalid_argument(format!(
                "{provider_type} disks are managed by the volume"
            )));
        }
        if !self.registry.supports(provider_type) {
            return Err(Error::unsupported(format!(
                "no disk backend for provider {provider_type}"
            )));
        }
        let volume = self.volume_keep_alive(volume_id)?;

        let mut core = DiskCore::new(volume_id, provider_type, name).with_total_space(quota);
        if let Some(credentials) = credentials {
            if !credentials.supports(provider_type) {
                return Err(Error::invalid_argument(format!(
                    "{credentials} credentials cannot drive a {provider_type} disk"
                )));
            }
            core = core.with_credentials(credentials);
        }
        let record = core.to_record(user_id, ProviderRecord::for_type(provider_type).id)?;

        let disk = self.registry.create(provider_type, &record)?;
        self.repository.create(&record)?;
        volume.add_disk(disk);
        volume.pair_new_disk(record.id, self.repository.as_ref())?;

        info!(
            "Attached {} disk {} ({}) to volume {} with a quota of {} bytes",
            provider_type, record.id, name, volume_id, quota
        );
        Ok(record.id)
    }

    /// Disk records of a volume, oldest first
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub fn get_disks(&self, volume_id: VolumeId) -> Result<Vec<DiskRecord>> {
        let mut disks = self
            .repository
            .find_by::<DiskRecord>(|disk| disk.volume_id == volume_id)?;
        disks.sort_by_key(|disk| disk.created_at);
        Ok(disks)
    }

    /// Detach a disk and delete every file with a block on it
    ///
    /// A mirror takes its virtual disk and the other mirror with it.
    ///
    /// # Errors
    /// Returns `Error::DiskNotFound` if the volume has no such disk,
    /// `Error::DiskBusy` while a file using it is in flight, or the first
    /// failure met while deleting.
    pub async fn delete_disk(&self, volume_id: VolumeId, disk_id: DiskId) -> Result<()> {
        let volume = self.volume_keep_alive(volume_id)?;
        let disk = volume.disk(disk_id).ok_or(Error::DiskNotFound(disk_id))?;
        let target = disk
            .virtual_disk_id()
            .and_then(|virtual_id| volume.disk(virtual_id))
            .unwrap_or(disk);

        if let Some(file) = self.find_enqueued_disk(target.id()) {
            warn!("Cannot delete disk {}: file {} is in flight", target.id(), file.id());
            return Err(Error::DiskBusy(disk_id));
        }
        self.delete_disk_unit(&volume, target).await
    }

    async fn delete_disk_unit(&self, volume: &Volume, disk: Arc<dyn Disk>) -> Result<()> {
        let disk_id = disk.id();
        let affected: BTreeSet<FileId> = self
            .repository
            .find_by::<BlockRecord>(|block| block.disk_id == disk_id)?
            .into_iter()
            .map(|block| block.file_id)
            .collect();

        let mut files = Vec::with_capacity(affected.len());
        for file_id in affected {
            if let Some(file) = self.repository.find::<FileRecord>(file_id)? {
                files.push(file);
            }
        }
        try_join_all(files.iter().map(|file| self.purge_file(volume, file))).await?;

        if disk.is_virtual() {
            for member in self
                .repository
                .find_by::<DiskRecord>(|record| record.virtual_disk_id == Some(disk_id))?
            {
                self.repository.delete::<DiskRecord>(member.id)?;
                self.registry.forget(member.id);
            }
            self.repository.delete::<DiskRecord>(disk_id)?;
            volume.delete_virtual_disk(disk_id);
        } else {
            self.repository.delete::<DiskRecord>(disk_id)?;
            self.registry.forget(disk_id);
            volume.delete_disk(disk_id);
        }

        info!(
            "Deleted disk {} of volume {} and {} files stored on it",
            disk_id,
            volume.id(),
            files.len()
        );
        Ok(())
    }

    /// In-flight file with a block on `disk_id`, directly or through a mirror
    #[must_use]
    pub fn find_enqueued_disk(&self, disk_id: DiskId) -> Option<Arc<File>> {
        self.in_flight().find(|file| {
            file.as_regular()
                .is_some_and(|regular| regular.references_disk(disk_id))
        })
    }

    /// In-flight file of `volume_id`
    #[must_use]
    pub fn find_enqueued_volume(&self, volume_id: VolumeId) -> Option<Arc<File>> {
        self.in_flight().find(|file| file.volume_id() == volume_id)
    }

    fn in_flight(&self) -> impl Iterator<Item = Arc<File>> {
        self.file_uploads
            .instances()
            .into_iter()
            .chain(self.file_downloads.instances())
    }

    // Files

    /// Store `content` as a new file of a volume
    ///
    /// The content is split into blocks placed by the volume's partitioner,
    /// encrypted when the volume asks for it, and uploaded concurrently. If
    /// any block fails, the blocks already stored are removed again.
    ///
    /// # Errors
    /// Returns `Error::VolumeNotReady` if a disk of the volume is not ready,
    /// `Error::NoDiskAvailable` if the file does not fit, or the first block
    /// failure.
    pub async fn upload_file(
        &self,
        volume_id: VolumeId,
        user_id: UserId,
        root_id: Option<FileId>,
        name: &str,
        content: Bytes,
    ) -> Result<FileId> {
        let volume = self.volume_keep_alive(volume_id)?;
        if !volume.is_ready().await {
            warn!("Refusing upload of {} to volume {}: not ready", name, volume_id);
            return Err(Error::VolumeNotReady(volume_id));
        }
        if let Some(root_id) = root_id {
            self.directory(volume_id, root_id)?;
        }

        let regular = volume
            .file_upload_request(name, content.len() as u64, user_id, root_id)
            .await?;
        regular.set_checksum(content_checksum(&content));
        let file_id = regular.id();
        let file = Arc::new(File::Regular(regular));
        self.file_uploads.enqueue_instance(file_id, Arc::clone(&file));
        self.file_uploads.mark_as_used(file_id)?;

        let (stored, outcome) = self.store_blocks(&volume, &file, &content).await;
        if let Err(e) = outcome.and_then(|()| self.persist_upload(&file)) {
            error!(
                "Upload of file {} failed, removing {} stored blocks: {}",
                file_id,
                stored.len(),
                e
            );
            discard_blocks(&file, stored).await;
            self.file_uploads.remove_enqueued_instance(file_id);
            return Err(e);
        }

        if let Err(e) = self.file_uploads.mark_as_completed(file_id) {
            warn!("Upload of file {} left the queue early: {}", file_id, e);
        }
        info!(
            "Uploaded file {} ({}, {} bytes) to volume {}",
            file_id,
            name,
            content.len(),
            volume_id
        );
        Ok(file_id)
    }

    /// Upload every block of a new file
    ///
    /// Returns the blocks that reached their disk, even when another block
    /// failed, together with the first failure.
    async fn store_blocks(
        &self,
        volume: &Volume,
        file: &File,
        content: &Bytes,
    ) -> (Vec<StoredBlock>, Result<()>) {
        let regular = match regular(file) {
            Ok(regular) => regular,
            Err(e) => return (Vec::new(), Err(e)),
        };
        let block_size = volume.block_size();

        let results: Vec<(Option<StoredBlock>, Result<()>)> =
            stream::iter(regular.blocks().into_iter().map(|block| {
                let start = usize::try_from(block.order * block_size).unwrap_or(usize::MAX);
                let end = start.saturating_add(usize::try_from(block.size).unwrap_or(usize::MAX));
                let payload = content.slice(start.min(content.len())..end.min(content.len()));
                async move {
                    let mut transfer = match volume.encrypt(payload) {
                        Ok(sealed) => block.upload_transfer(sealed),
                        Err(e) => return (None, Err(e)),
                    };
                    if let Err(e) = block.disk.upload(&mut transfer).await {
                        return (None, Err(e));
                    }
                    let counted = block.disk.update_used_space(signed(transfer.size)).await;
                    (Some(StoredBlock { block, transfer }), counted)
                }
            }))
            .buffer_unordered(self.config.transport.max_parallel_blocks.max(1))
            .collect()
            .await;

        let mut stored = Vec::with_capacity(results.len());
        let mut outcome = Ok(());
        for (block, result) in results {
            stored.extend(block);
            if let Err(e) = result
                && outcome.is_ok()
            {
                outcome = Err(e);
            }
        }

        if outcome.is_ok() {
            for StoredBlock { block, transfer } in &stored {
                regular.update_block(block.id, |block| {
                    block.size = transfer.size;
                    block.checksum.clone_from(&transfer.checksum);
                    block.status = transfer.status;
                });
            }
        }
        (stored, outcome)
    }

    /// Store the records of an uploaded file
    ///
    /// Records already written are deleted again when a later one fails.
    fn persist_upload(&self, file: &File) -> Result<()> {
        let record = file.to_record();
        let blocks = file
            .as_regular()
            .map(RegularFile::block_records)
            .unwrap_or_default();

        let mut created = Vec::with_capacity(blocks.len());
        let result = self.repository.create(&record).and_then(|()| {
            for block in &blocks {
                self.repository.create(block)?;
                created.push(block.id);
            }
            Ok(())
        });

        if result.is_err() {
            for block_id in created {
                if let Err(e) = self.repository.delete::<BlockRecord>(block_id) {
                    warn!("Cannot delete record of block {}: {}", block_id, e);
                }
            }
            if let Err(e) = self.repository.delete::<FileRecord>(record.id) {
                warn!("Cannot delete record of file {}: {}", record.id, e);
            }
        }
        result
    }

    /// Read a file back
    ///
    /// Blocks are fetched concurrently, verified, decrypted and joined; the
    /// result is checked against the checksum taken at upload time.
    ///
    /// # Errors
    /// Returns `Error::FileNotFound` if the volume has no such regular file,
    /// `Error::MirrorReadUnrecoverable` if both copies of a block are
    /// corrupted, `Error::ChecksumMismatch` if a block or the file does not
    /// match what was stored, or the disk error.
    pub async fn download_file(&self, volume_id: VolumeId, file_id: FileId) -> Result<Bytes> {
        let volume = self.volume_keep_alive(volume_id)?;
        let file = match self.file_downloads.get_enqueued_instance(file_id) {
            Some(file) if self.file_downloads.mark_as_used(file_id).is_ok() => file,
            _ => {
                let file = Arc::new(self.load_file(&volume, file_id)?);
                self.file_downloads
                    .enqueue_instance(file_id, Arc::clone(&file));
                self.file_downloads.mark_as_used(file_id)?;
                file
            }
        };

        let result = self.fetch_blocks(&volume, &file).await;
        if let Err(e) = self.file_downloads.mark_as_completed(file_id) {
            warn!("Download of file {} left the queue early: {}", file_id, e);
        }
        let content = result?;
        debug!("Downloaded file {} ({} bytes)", file_id, content.len());
        Ok(content)
    }

    fn load_file(&self, volume: &Volume, file_id: FileId) -> Result<File> {
        let record = self
            .repository
            .find::<FileRecord>(file_id)?
            .filter(|file| file.volume_id == volume.id() && file.file_type == FileType::Regular)
            .ok_or(Error::FileNotFound(file_id))?;

        let blocks = self
            .repository
            .find_by::<BlockRecord>(|block| block.file_id == file_id)?
            .iter()
            .map(|block| {
                volume
                    .disk(block.disk_id)
                    .map(|disk| Block::from_record(block, disk))
                    .ok_or(Error::DiskNotFound(block.disk_id))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(File::Regular(RegularFile::from_record(&record, blocks)))
    }

    async fn fetch_blocks(&self, volume: &Volume, file: &File) -> Result<Bytes> {
        let regular = regular(file)?;

        let parts: Vec<Bytes> = stream::iter(regular.blocks().into_iter().map(|block| async move {
            let mut transfer = block.download_transfer();
            let outcome = block.disk.download(&mut transfer).await?;
            if outcome == DownloadOutcome::Unrecoverable {
                return Err(Error::MirrorReadUnrecoverable { block_id: block.id });
            }
            if !transfer.is_intact() {
                error!("Block {} of file {} is corrupted", block.id, block.file_id);
                return Err(Error::ChecksumMismatch {
                    expected: transfer.checksum.clone(),
                    actual: content_checksum(&transfer.content),
                });
            }
            volume.decrypt(transfer.content)
        }))
        .buffered(self.config.transport.max_parallel_blocks.max(1))
        .try_collect()
        .await?;

        let mut content = BytesMut::with_capacity(usize::try_from(regular.size()).unwrap_or(0));
        for part in parts {
            content.extend_from_slice(&part);
        }

        let actual = content_checksum(&content);
        let expected = regular.checksum();
        if actual != expected {
            error!("File {} does not match its checksum", regular.id());
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(content.freeze())
    }

    /// Create an empty directory
    ///
    /// # Errors
    /// Returns `Error::FileNotFound` if `root_id` is not a directory of the
    /// volume, or the repository error.
    pub fn create_directory(
        &self,
        volume_id: VolumeId,
        user_id: UserId,
        root_id: Option<FileId>,
        name: &str,
    ) -> Result<FileId> {
        let volume = self.volume_keep_alive(volume_id)?;
        if let Some(root_id) = root_id {
            self.directory(volume_id, root_id)?;
        }

        let directory = File::Directory(Directory::new(FileMeta::new(
            volume.id(),
            root_id,
            user_id,
            name,
        )));
        self.repository.create(&directory.to_record())?;
        debug!("Created directory {} ({}) in volume {}", directory.id(), name, volume_id);
        Ok(directory.id())
    }

    fn directory(&self, volume_id: VolumeId, file_id: FileId) -> Result<FileRecord> {
        self.repository
            .find::<FileRecord>(file_id)?
            .filter(|file| file.volume_id == volume_id && file.file_type == FileType::Directory)
            .ok_or(Error::FileNotFound(file_id))
    }

    /// Entries of a directory, or of the volume root, sorted by name
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub fn list_files(&self, volume_id: VolumeId, root_id: Option<FileId>) -> Result<Vec<FileRecord>> {
        let mut files = self
            .repository
            .find_by::<FileRecord>(|file| file.volume_id == volume_id && file.root_id == root_id)?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Delete a file and its blocks, or an empty directory
    ///
    /// # Errors
    /// Returns `Error::FileNotFound` if the volume has no such entry and
    /// `Error::InvalidArgument` for a directory that still has entries.
    pub async fn remove_file(&self, volume_id: VolumeId, file_id: FileId) -> Result<()> {
        let volume = self.volume_keep_alive(volume_id)?;
        let record = self
            .repository
            .find::<FileRecord>(file_id)?
            .filter(|file| file.volume_id == volume_id)
            .ok_or(Error::FileNotFound(file_id))?;

        if record.file_type == FileType::Directory
            && !self.list_files(volume_id, Some(file_id))?.is_empty()
        {
            return Err(Error::invalid_argument(format!(
                "directory {} is not empty",
                record.name
            )));
        }

        self.purge_file(&volume, &record).await?;
        info!("Removed file {} ({}) from volume {}", file_id, record.name, volume_id);
        Ok(())
    }

    /// Remove a file's blocks from their disks, then its records
    async fn purge_file(&self, volume: &Volume, file: &FileRecord) -> Result<()> {
        let blocks = self
            .repository
            .find_by::<BlockRecord>(|block| block.file_id == file.id)?;

        try_join_all(blocks.iter().map(|record| async move {
            let Some(disk) = volume.disk(record.disk_id) else {
                warn!(
                    "Block {} of file {} is on unknown disk {}",
                    record.id, record.file_id, record.disk_id
                );
                return Ok(());
            };
            let block = Block::from_record(record, Arc::clone(&disk));
            let mut transfer = block.download_transfer();
            disk.remove(&mut transfer).await?;
            disk.update_used_space(-signed(record.size)).await
        }))
        .await?;

        for block in &blocks {
            self.repository.delete::<BlockRecord>(block.id)?;
        }
        self.repository.delete::<FileRecord>(file.id)?;
        Ok(())
    }
}

/// A block that reached its disk during an upload
struct StoredBlock {
    block: Block,
    transfer: BlockTransfer,
}

/// Remove the blocks of a failed upload and give their space back
///
/// The in-memory used space of a disk moves even when persisting it fails,
/// so every stored block is released.
async fn discard_blocks(file: &File, stored: Vec<StoredBlock>) {
    join_all(stored.into_iter().map(|mut stored| async move {
        if let Some(regular) = file.as_regular() {
            regular.set_block_status(stored.block.id, BlockStatus::Failed);
        }
        let disk = &stored.block.disk;
        if let Err(e) = disk.remove(&mut stored.transfer).await {
            warn!("Cannot remove block {} from disk {}: {}", stored.block.id, disk.id(), e);
            return;
        }
        if let Err(e) = disk.update_used_space(-signed(stored.transfer.size)).await {
            warn!("Cannot release space of block {} on disk {}: {}", stored.block.id, disk.id(), e);
        }
    }))
    .await;
}

fn regular(file: &File) -> Result<&RegularFile> {
    file.as_regular()
        .ok_or_else(|| Error::invalid_argument(format!("{} is a directory", file.name())))
}

fn signed(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
