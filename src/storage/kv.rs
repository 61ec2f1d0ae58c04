// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transactional key-value store abstraction.
//!
//! Values live in named collections. Reads are point lookups. Writes are
//! collected in a `WriteBatch` and applied atomically by `commit`, so a
//! reader never sees half of a batch.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt value for {collection}/{key}: {reason}")]
    Corrupt {
        collection: &'static str,
        key: String,
        reason: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Collections and Batches
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Master key, PIN metadata, flags and synced derived keys.
    Keys,
    /// Per-enclave single-use tokens.
    Token,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Keys, Collection::Token];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Keys => "keys",
            Collection::Token => "token",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        collection: Collection,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        collection: Collection,
        key: String,
    },
    Clear(Collection),
}

/// Ordered set of writes applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: Collection, key: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection,
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn set_bool(&mut self, collection: Collection, key: &str, value: bool) -> &mut Self {
        self.set(collection, key, vec![u8::from(value)])
    }

    pub fn set_string(&mut self, collection: Collection, key: &str, value: &str) -> &mut Self {
        self.set(collection, key, value.as_bytes())
    }

    pub fn set_u32(&mut self, collection: Collection, key: &str, value: u32) -> &mut Self {
        self.set(collection, key, value.to_be_bytes())
    }

    /// Set when `Some`, remove when `None`.
    pub fn set_optional(
        &mut self,
        collection: Collection,
        key: &str,
        value: Option<&[u8]>,
    ) -> &mut Self {
        match value {
            Some(value) => self.set(collection, key, value),
            None => self.remove(collection, key),
        }
    }

    pub fn remove(&mut self, collection: Collection, key: &str) -> &mut Self {
        self.ops.push(WriteOp::Remove {
            collection,
            key: key.to_string(),
        });
        self
    }

    pub fn clear(&mut self, collection: Collection) -> &mut Self {
        self.ops.push(WriteOp::Clear(collection));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

// =============================================================================
// Store Trait
// =============================================================================

pub trait KeyValueStore: Send + Sync {
    fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Apply every operation in `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Read several keys from one consistent view.
    fn get_many(&self, collection: Collection, keys: &[&str]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(collection, key)).collect()
    }
}

fn corrupt(collection: Collection, key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        collection: collection.name(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

pub fn decode_bool(collection: Collection, key: &str, bytes: &[u8]) -> StoreResult<bool> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(corrupt(collection, key, "expected a one-byte boolean")),
    }
}

pub fn decode_string(collection: Collection, key: &str, bytes: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(bytes).map_err(|e| corrupt(collection, key, e.to_string()))
}

pub fn decode_u32(collection: Collection, key: &str, bytes: &[u8]) -> StoreResult<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| corrupt(collection, key, "expected a 4-byte integer"))?;
    Ok(u32::from_be_bytes(raw))
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Non-durable store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(Collection, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: Collection) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.keys().filter(|(c, _)| *c == collection).count()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&(collection, key.to_string())).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for op in batch.into_ops() {
            match op {
                WriteOp::Set {
                    collection,
                    key,
                    value,
                } => {
                    entries.insert((collection, key), value);
                }
                WriteOp::Remove { collection, key } => {
                    entries.remove(&(collection, key));
                }
                WriteOp::Clear(collection) => {
                    entries.retain(|(c, _), _| *c != collection);
                }
            }
        }
        Ok(())
    }
}
