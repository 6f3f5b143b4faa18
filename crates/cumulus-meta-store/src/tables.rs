//! Redb table definitions for persistent metadata storage.
//!
//! Every table maps a hyphenated UUID string to a bincode-encoded record.

use cumulus_common::{BlockRecord, DiskRecord, FileRecord, ProviderRecord, Record, VolumeRecord};
use redb::TableDefinition;

pub type RecordTable<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

/// Table definition for a record table name
#[must_use]
pub const fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

// Volume layout
pub const VOLUMES: RecordTable<'static> = table(VolumeRecord::TABLE);
pub const DISKS: RecordTable<'static> = table(DiskRecord::TABLE);
pub const PROVIDERS: RecordTable<'static> = table(ProviderRecord::TABLE);

// File tree
pub const FILES: RecordTable<'static> = table(FileRecord::TABLE);
pub const BLOCKS: RecordTable<'static> = table(BlockRecord::TABLE);

/// Every table created when a store is opened
pub const ALL: [RecordTable<'static>; 5] = [VOLUMES, DISKS, PROVIDERS, FILES, BLOCKS];
