//! Persistent metadata store backed by redb.
//!
//! Every record kind lives in its own table. All writes are synchronous
//! (write txn + commit); `modify_raw` reads and rewrites inside a single
//! write transaction so field updates never race each other.

use crate::tables;
use cumulus_common::{Error, Repository};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, error};
use uuid::Uuid;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Repository(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for table_def in tables::ALL {
            let _t = write_txn.open_table(table_def)?;
        }
        write_txn.commit()?;

        debug!("Opened metadata store at {}", path.display());
        Ok(Self { db })
    }

    fn get_bytes(&self, table: &'static str, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(tables::table(table)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    fn put_bytes(&self, table: &'static str, key: &str, value: &[u8]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::table(table))?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn modify_bytes(
        &self,
        table: &'static str,
        key: &str,
        modify: &mut dyn FnMut(&[u8]) -> cumulus_common::Result<Vec<u8>>,
    ) -> cumulus_common::Result<bool> {
        let write_txn = self.db.begin_write().map_err(MetaStoreError::from)?;
        {
            let mut table = write_txn
                .open_table(tables::table(table))
                .map_err(MetaStoreError::from)?;
            let current = table
                .get(key)
                .map_err(MetaStoreError::from)?
                .map(|guard| guard.value().to_vec());
            let Some(current) = current else {
                return Ok(false);
            };
            let updated = modify(&current)?;
            table
                .insert(key, updated.as_slice())
                .map_err(MetaStoreError::from)?;
        }
        write_txn.commit().map_err(MetaStoreError::from)?;
        Ok(true)
    }

    fn delete_key(&self, table: &'static str, key: &str) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(tables::table(table))?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn load_table(&self, table: &'static str) -> MetaStoreResult<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(tables::table(table)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push(entry.1.value().to_vec());
        }
        Ok(result)
    }
}

impl Repository for MetaStore {
    fn get_raw(&self, table: &'static str, key: Uuid) -> cumulus_common::Result<Option<Vec<u8>>> {
        Ok(self.get_bytes(table, &key.to_string())?)
    }

    fn put_raw(&self, table: &'static str, key: Uuid, value: &[u8]) -> cumulus_common::Result<()> {
        self.put_bytes(table, &key.to_string(), value).map_err(|e| {
            error!("Failed to persist {} entry '{}': {}", table, key, e);
            e.into()
        })
    }

    fn modify_raw(
        &self,
        table: &'static str,
        key: Uuid,
        modify: &mut dyn FnMut(&[u8]) -> cumulus_common::Result<Vec<u8>>,
    ) -> cumulus_common::Result<bool> {
        self.modify_bytes(table, &key.to_string(), modify)
    }

    fn delete_raw(&self, table: &'static str, key: Uuid) -> cumulus_common::Result<bool> {
        self.delete_key(table, &key.to_string()).map_err(|e| {
            error!("Failed to delete {} entry '{}': {}", table, key, e);
            e.into()
        })
    }

    fn scan_raw(&self, table: &'static str) -> cumulus_common::Result<Vec<Vec<u8>>> {
        Ok(self.load_table(table)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cumulus_common::{RepositoryExt, UserId, VolumeId, VolumeRecord, VolumeSettings};
    use tempfile::TempDir;

    fn volume(name: &str, user_id: UserId) -> VolumeRecord {
        VolumeRecord {
            id: VolumeId::new(),
            name: name.to_string(),
            user_id,
            settings: VolumeSettings::default(),
            block_size: 1024,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("cumulus.redb");
        let record = volume("photos", UserId::new());

        {
            let store = MetaStore::open(&path).unwrap();
            store.create(&record).unwrap();
        }

        let store = MetaStore::open(&path).unwrap();
        let found: VolumeRecord = store.find(record.id).unwrap().unwrap();
        assert_eq!(found, record);
    }

    #[test]
    fn test_update_and_filter() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path().join("cumulus.redb")).unwrap();
        let owner = UserId::new();
        let a = volume("a", owner);
        let b = volume("b", UserId::new());
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        let renamed: VolumeRecord = store.update(a.id, |v: &mut VolumeRecord| {
            v.name = "renamed".into();
        })
        .unwrap();
        assert_eq!(renamed.name, "renamed");

        let owned: Vec<VolumeRecord> = store.find_by(|v: &VolumeRecord| v.user_id == owner).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "renamed");
    }

    #[test]
    fn test_update_missing_record_fails() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path().join("cumulus.redb")).unwrap();
        let result = store.update(VolumeId::new(), |_: &mut VolumeRecord| {});
        assert_eq!(result.unwrap_err().code(), "DB-001");
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path().join("cumulus.redb")).unwrap();
        let record = volume("tmp", UserId::new());
        store.create(&record).unwrap();

        assert!(store.delete::<VolumeRecord>(record.id).unwrap());
        assert!(!store.delete::<VolumeRecord>(record.id).unwrap());
        assert!(store.find::<VolumeRecord>(record.id).unwrap().is_none());
    }
}
