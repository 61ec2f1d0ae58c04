// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable key-value store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `keys`: identifier → value bytes (master key, PIN metadata, flags)
//! - `token`: `{enclave}.{field}` → value bytes (single-use enclave tokens)

use std::path::Path;

use redb::{Database as RedbDatabase, ReadableDatabase, ReadableTable, TableDefinition};

use super::kv::{Collection, KeyValueStore, StoreResult, WriteBatch, WriteOp};

// =============================================================================
// Table Definitions
// =============================================================================

const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");

const TOKEN: TableDefinition<&str, &[u8]> = TableDefinition::new("token");

fn table(collection: Collection) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match collection {
        Collection::Keys => KEYS,
        Collection::Token => TOKEN,
    }
}

// =============================================================================
// Database
// =============================================================================

/// File database holding the key backup state.
pub struct Database {
    db: RedbDatabase,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = RedbDatabase::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            for collection in Collection::ALL {
                let _ = write_txn.open_table(table(collection))?;
            }
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "Opened key backup database");
        Ok(Self { db })
    }
}

impl KeyValueStore for Database {
    fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table(collection))?;
        Ok(table.get(key)?.map(|value| value.value().to_vec()))
    }

    fn get_many(&self, collection: Collection, keys: &[&str]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table(collection))?;
        keys.iter()
            .map(|key| Ok(table.get(*key)?.map(|value| value.value().to_vec())))
            .collect()
    }

    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write()?;
        {
            for op in batch.into_ops() {
                match op {
                    WriteOp::Set {
                        collection,
                        key,
                        value,
                    } => {
                        let mut t = write_txn.open_table(table(collection))?;
                        t.insert(key.as_str(), value.as_slice())?;
                    }
                    WriteOp::Remove { collection, key } => {
                        let mut t = write_txn.open_table(table(collection))?;
                        t.remove(key.as_str())?;
                    }
                    WriteOp::Clear(collection) => {
                        let mut t = write_txn.open_table(table(collection))?;
                        let keys = t
                            .iter()?
                            .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                            .collect::<Result<Vec<_>, _>>()?;
                        for key in keys {
                            t.remove(key.as_str())?;
                        }
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
