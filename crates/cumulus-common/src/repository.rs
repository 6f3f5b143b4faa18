//! Persistence collaborator interface
//!
//! [`Repository`] is a small, object-safe key/value contract over named
//! tables holding bincode-encoded records. Typed find/create/update/delete
//! operations live on [`RepositoryExt`], which every repository gets for free.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// A record stored in its own table, keyed by UUID
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table holding every record of this kind
    const TABLE: &'static str;

    /// Primary key of the record
    fn key(&self) -> Uuid;
}

/// Raw table storage
///
/// Implementations must make `modify_raw` atomic with respect to every other
/// call on the same key.
pub trait Repository: Send + Sync {
    /// Fetch the encoded value stored under `key`
    fn get_raw(&self, table: &'static str, key: Uuid) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the encoded value stored under `key`
    fn put_raw(&self, table: &'static str, key: Uuid, value: &[u8]) -> Result<()>;

    /// Rewrite the value stored under `key` in place
    ///
    /// Returns `Ok(false)` when there is no such key.
    fn modify_raw(
        &self,
        table: &'static str,
        key: Uuid,
        modify: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<bool>;

    /// Remove `key`, returning whether it existed
    fn delete_raw(&self, table: &'static str, key: Uuid) -> Result<bool>;

    /// Every encoded value of `table`, in key order
    fn scan_raw(&self, table: &'static str) -> Result<Vec<Vec<u8>>>;
}

/// Typed operations over any [`Repository`]
pub trait RepositoryExt: Repository {
    /// Store a new record (replacing any record with the same key)
    fn create<R: Record>(&self, record: &R) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.put_raw(R::TABLE, record.key(), &bytes)
    }

    /// Find a record by primary key
    fn find<R: Record>(&self, id: impl Into<Uuid>) -> Result<Option<R>> {
        self.get_raw(R::TABLE, id.into())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    /// Every record of a table matching `filter`
    fn find_by<R: Record>(&self, filter: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let mut found = Vec::new();
        for bytes in self.scan_raw(R::TABLE)? {
            let record: R = bincode::deserialize(&bytes)?;
            if filter(&record) {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Apply `update` to the stored record and persist it atomically
    ///
    /// # Errors
    /// Returns `Error::Repository` if no record exists under `id`.
    fn update<R: Record>(&self, id: impl Into<Uuid>, update: impl FnOnce(&mut R)) -> Result<R> {
        let id = id.into();
        let mut update = Some(update);
        let mut updated = None;
        let found = self.modify_raw(R::TABLE, id, &mut |bytes| {
            let mut record: R = bincode::deserialize(bytes)?;
            if let Some(update) = update.take() {
                update(&mut record);
            }
            let encoded = bincode::serialize(&record)?;
            updated = Some(record);
            Ok(encoded)
        })?;

        match updated {
            Some(record) if found => Ok(record),
            _ => Err(Error::repository(format!(
                "no record {id} in table {}",
                R::TABLE
            ))),
        }
    }

    /// Delete a record by primary key, returning whether it existed
    fn delete<R: Record>(&self, id: impl Into<Uuid>) -> Result<bool> {
        self.delete_raw(R::TABLE, id.into())
    }
}

impl<T: Repository + ?Sized> RepositoryExt for T {}
