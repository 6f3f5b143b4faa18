//! In-memory repository
//!
//! Same contract as [`MetaStore`](crate::MetaStore) without durability.

use cumulus_common::{Repository, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

type Table = BTreeMap<Uuid, Vec<u8>>;

/// Repository holding every table in process memory
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<HashMap<&'static str, Table>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table
    #[must_use]
    pub fn len(&self, table: &'static str) -> usize {
        self.tables.lock().get(table).map_or(0, BTreeMap::len)
    }
}

impl Repository for MemoryRepository {
    fn get_raw(&self, table: &'static str, key: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .and_then(|t| t.get(&key))
            .cloned())
    }

    fn put_raw(&self, table: &'static str, key: Uuid, value: &[u8]) -> Result<()> {
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .insert(key, value.to_vec());
        Ok(())
    }

    fn modify_raw(
        &self,
        table: &'static str,
        key: Uuid,
        modify: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(value) = tables.get_mut(table).and_then(|t| t.get_mut(&key)) else {
            return Ok(false);
        };
        *value = modify(value)?;
        Ok(true)
    }

    fn delete_raw(&self, table: &'static str, key: Uuid) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .get_mut(table)
            .and_then(|t| t.remove(&key))
            .is_some())
    }

    fn scan_raw(&self, table: &'static str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cumulus_common::{DiskId, DiskRecord, ProviderId, Record, RepositoryExt, UserId, VolumeId};

    fn disk(volume_id: VolumeId) -> DiskRecord {
        DiskRecord {
            id: DiskId::new(),
            user_id: UserId::new(),
            volume_id,
            provider_id: ProviderId::new(),
            credentials: String::new(),
            name: "disk".into(),
            total_space: 100,
            used_space: 0,
            created_at: Utc::now(),
            is_virtual: false,
            virtual_disk_id: None,
        }
    }

    #[test]
    fn test_crud() {
        let repo = MemoryRepository::new();
        let volume_id = VolumeId::new();
        let record = disk(volume_id);

        repo.create(&record).unwrap();
        repo.create(&disk(VolumeId::new())).unwrap();
        assert_eq!(repo.len(DiskRecord::TABLE), 2);

        let updated = repo
            .update(record.id, |d: &mut DiskRecord| d.used_space = 42)
            .unwrap();
        assert_eq!(updated.used_space, 42);

        let in_volume: Vec<DiskRecord> = repo.find_by(|d: &DiskRecord| d.volume_id == volume_id).unwrap();
        assert_eq!(in_volume, vec![updated]);

        assert!(repo.delete::<DiskRecord>(record.id).unwrap());
        assert!(repo.find::<DiskRecord>(record.id).unwrap().is_none());
    }

    #[test]
    fn test_unknown_table_is_empty() {
        let repo = MemoryRepository::new();
        assert!(repo.scan_raw("nothing").unwrap().is_empty());
        assert!(!repo.delete_raw("nothing", Uuid::nil()).unwrap());
    }
}
