//! Disk factory
//!
//! Maps a provider type to the constructor of its backend, so that disks can
//! be restored from their records without knowing the concrete type.

use crate::disk::Disk;
use crate::local::LocalDisk;
use crate::memory::{MemoryDisk, MemoryStore};
use cumulus_common::config::ReadinessConfig;
use cumulus_common::{DiskId, DiskRecord, Error, ProviderType, Repository, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Settings handed to every disk constructor
#[derive(Clone)]
pub struct DiskContext {
    /// Repository used to persist used-space updates
    pub repository: Option<Arc<dyn Repository>>,
    pub readiness: ReadinessConfig,
}

impl DiskContext {
    #[must_use]
    pub fn new(repository: Option<Arc<dyn Repository>>, readiness: ReadinessConfig) -> Self {
        Self {
            repository,
            readiness,
        }
    }
}

/// Builds a disk of one provider type from its record
pub type DiskConstructor =
    Arc<dyn Fn(&DiskRecord, &DiskContext) -> Result<Arc<dyn Disk>> + Send + Sync>;

/// Shared block stores of in-memory disks, keyed by disk id
///
/// Restoring a memory disk reconnects it to the blocks it held before.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    stores: Arc<Mutex<HashMap<DiskId, Arc<MemoryStore>>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn store(&self, disk_id: DiskId) -> Arc<MemoryStore> {
        Arc::clone(self.stores.lock().entry(disk_id).or_default())
    }

    /// Drop the blocks of a deleted disk
    pub fn forget(&self, disk_id: DiskId) -> bool {
        self.stores.lock().remove(&disk_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, disk_id: DiskId) -> bool {
        self.stores.lock().contains_key(&disk_id)
    }
}

/// Provider type to backend constructor table
pub struct DiskRegistry {
    constructors: HashMap<ProviderType, DiskConstructor>,
    context: DiskContext,
    memory: MemoryBackend,
}

impl DiskRegistry {
    /// Empty registry
    #[must_use]
    pub fn new(context: DiskContext) -> Self {
        Self {
            constructors: HashMap::new(),
            context,
            memory: MemoryBackend::default(),
        }
    }

    /// Registry with the built-in local and in-memory backends
    #[must_use]
    pub fn with_defaults(context: DiskContext) -> Self {
        let mut registry = Self::new(context);
        registry.register(
            ProviderType::Local,
            Arc::new(|record: &DiskRecord, context: &DiskContext| {
                let mut disk = LocalDisk::from_record(record, &context.readiness)?;
                if let Some(repository) = &context.repository {
                    disk = disk.with_repository(Arc::clone(repository));
                }
                Ok(Arc::new(disk) as Arc<dyn Disk>)
            }),
        );

        let memory = registry.memory.clone();
        registry.register(
            ProviderType::Memory,
            Arc::new(move |record: &DiskRecord, context: &DiskContext| {
                let store = memory.store(record.id);
                let mut disk = MemoryDisk::from_record(record, store, &context.readiness)?;
                if let Some(repository) = &context.repository {
                    disk = disk.with_repository(Arc::clone(repository));
                }
                Ok(Arc::new(disk) as Arc<dyn Disk>)
            }),
        );
        registry
    }

    /// Register (or replace) the constructor of a provider type
    pub fn register(&mut self, provider_type: ProviderType, constructor: DiskConstructor) {
        debug!("Registered disk backend for provider {}", provider_type);
        self.constructors.insert(provider_type, constructor);
    }

    #[must_use]
    pub fn supports(&self, provider_type: ProviderType) -> bool {
        self.constructors.contains_key(&provider_type)
    }

    #[must_use]
    pub const fn context(&self) -> &DiskContext {
        &self.context
    }

    /// Block stores backing the in-memory disks
    #[must_use]
    pub const fn memory(&self) -> &MemoryBackend {
        &self.memory
    }

    /// Release what the backends keep for a deleted disk
    pub fn forget(&self, disk_id: DiskId) {
        if self.memory.forget(disk_id) {
            debug!("Dropped the memory store of disk {}", disk_id);
        }
    }

    /// Build the disk described by `record`
    ///
    /// # Errors
    /// Returns `Error::UnsupportedOperation` if no backend is registered for
    /// `provider_type`, or the constructor's error.
    pub fn create(&self, provider_type: ProviderType, record: &DiskRecord) -> Result<Arc<dyn Disk>> {
        let constructor = self.constructors.get(&provider_type).ok_or_else(|| {
            Error::unsupported(format!("no disk backend for provider {provider_type}"))
        })?;
        constructor(record, &self.context)
    }
}
