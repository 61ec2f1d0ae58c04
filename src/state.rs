// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cached local key state.
//!
//! `RecoveryStore` is the single mutual-exclusion point for the persisted
//! key state. The snapshot is loaded lazily from the durable store, and every
//! write commits the batch and reloads the snapshot while the same lock is held,
//! so no reader sees the cache and the store disagree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::crypto::derived::SYNCABLE_KEYS;
use crate::crypto::{DerivedKeyName, MasterKey, PinType};
use crate::error::{KbsError, KbsResult};
use crate::storage::kv::{decode_bool, decode_string};
use crate::storage::{Collection, KeyValueStore, StoreError, WriteBatch};

/// Identifiers in the `keys` collection.
pub mod keys {
    pub const MASTER_KEY: &str = "masterKey";
    pub const PIN_TYPE: &str = "pinType";
    pub const VERIFICATION_STRING: &str = "encodedVerificationString";
    pub const IS_MASTER_KEY_BACKED_UP: &str = "isMasterKeyBackedUp";
    pub const HAS_BACKUP_KEY_REQUEST_FAILED: &str = "hasBackupKeyRequestFailed";
    pub const HAS_PENDING_RESTORATION: &str = "hasPendingRestoration";
    pub const ENCLAVE_NAME: &str = "enclaveName";
}

/// Point-in-time view of the persisted key state.
#[derive(Clone, Default)]
pub struct LocalState {
    pub master_key: Option<MasterKey>,
    pub pin_type: Option<PinType>,
    pub encoded_verification_string: Option<String>,
    pub is_master_key_backed_up: bool,
    pub has_backup_key_request_failed: bool,
    pub has_pending_restoration: bool,
    pub synced_derived_keys: HashMap<DerivedKeyName, Vec<u8>>,
    pub enclave_name: Option<String>,
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState")
            .field("has_master_key", &self.master_key.is_some())
            .field("pin_type", &self.pin_type)
            .field(
                "has_verification_string",
                &self.encoded_verification_string.is_some(),
            )
            .field("is_master_key_backed_up", &self.is_master_key_backed_up)
            .field(
                "has_backup_key_request_failed",
                &self.has_backup_key_request_failed,
            )
            .field("has_pending_restoration", &self.has_pending_restoration)
            .field(
                "synced_derived_keys",
                &self.synced_derived_keys.keys().collect::<Vec<_>>(),
            )
            .field("enclave_name", &self.enclave_name)
            .finish()
    }
}

impl LocalState {
    fn load(store: &dyn KeyValueStore) -> KbsResult<Self> {
        let synced_labels: Vec<String> = SYNCABLE_KEYS.iter().map(|k| k.label()).collect();
        let mut identifiers = vec![
            keys::MASTER_KEY,
            keys::PIN_TYPE,
            keys::VERIFICATION_STRING,
            keys::IS_MASTER_KEY_BACKED_UP,
            keys::HAS_BACKUP_KEY_REQUEST_FAILED,
            keys::HAS_PENDING_RESTORATION,
            keys::ENCLAVE_NAME,
        ];
        identifiers.extend(synced_labels.iter().map(String::as_str));

        let mut values = store.get_many(Collection::Keys, &identifiers)?.into_iter();
        let mut next = || values.next().flatten();

        let master_key = next()
            .map(|bytes| {
                MasterKey::from_slice(&bytes)
                    .map_err(|_| corrupt(keys::MASTER_KEY, "expected 32 bytes"))
            })
            .transpose()?;
        let pin_type = next()
            .map(|bytes| match bytes.as_slice() {
                [raw] => PinType::from_raw(*raw)
                    .ok_or_else(|| corrupt(keys::PIN_TYPE, "unknown pin type")),
                _ => Err(corrupt(keys::PIN_TYPE, "expected one byte")),
            })
            .transpose()?;
        let encoded_verification_string = next()
            .map(|bytes| decode_string(Collection::Keys, keys::VERIFICATION_STRING, bytes))
            .transpose()?;
        let is_master_key_backed_up = flag(next(), keys::IS_MASTER_KEY_BACKED_UP)?;
        let has_backup_key_request_failed = flag(next(), keys::HAS_BACKUP_KEY_REQUEST_FAILED)?;
        let has_pending_restoration = flag(next(), keys::HAS_PENDING_RESTORATION)?;
        let enclave_name = next()
            .map(|bytes| decode_string(Collection::Keys, keys::ENCLAVE_NAME, bytes))
            .transpose()?;

        let mut synced_derived_keys = HashMap::new();
        for name in SYNCABLE_KEYS {
            if let Some(bytes) = next() {
                synced_derived_keys.insert(name, bytes);
            }
        }

        Ok(Self {
            master_key,
            pin_type,
            encoded_verification_string,
            is_master_key_backed_up,
            has_backup_key_request_failed,
            has_pending_restoration,
            synced_derived_keys,
            enclave_name,
        })
    }
}

fn flag(bytes: Option<Vec<u8>>, key: &str) -> KbsResult<bool> {
    match bytes {
        Some(bytes) => Ok(decode_bool(Collection::Keys, key, &bytes)?),
        None => Ok(false),
    }
}

fn corrupt(key: &str, reason: &str) -> KbsError {
    KbsError::Storage(StoreError::Corrupt {
        collection: Collection::Keys.name(),
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

/// Values written by a successful backup or restore.
pub struct StoredKeys<'a> {
    pub master_key: &'a MasterKey,
    pub is_master_key_backed_up: bool,
    pub pin_type: PinType,
    pub encoded_verification_string: Option<&'a str>,
    pub enclave_name: Option<&'a str>,
}

/// Lock-guarded cache over the durable key state.
pub struct RecoveryStore {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<Option<LocalState>>,
}

impl RecoveryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LocalState>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_load<'a>(&self, cache: &'a mut Option<LocalState>) -> KbsResult<&'a LocalState> {
        let state = match cache.take() {
            Some(state) => state,
            None => LocalState::load(self.store.as_ref())?,
        };
        Ok(cache.insert(state))
    }

    /// Run `f` against the current snapshot, loading it on first use.
    pub fn read<R>(&self, f: impl FnOnce(&LocalState) -> R) -> KbsResult<R> {
        let mut cache = self.lock();
        let state = self.get_or_load(&mut *cache)?;
        Ok(f(state))
    }

    pub fn snapshot(&self) -> KbsResult<LocalState> {
        self.read(LocalState::clone)
    }

    /// Commit `batch` and reload the snapshot as one unit.
    pub fn write(&self, batch: WriteBatch) -> KbsResult<()> {
        let mut cache = self.lock();
        // A failed commit leaves the old snapshot untouched.
        self.store.commit(batch)?;
        *cache = None;
        *cache = Some(LocalState::load(self.store.as_ref())?);
        Ok(())
    }

    pub fn store_keys(&self, stored: StoredKeys<'_>) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        batch
            .set(Collection::Keys, keys::MASTER_KEY, stored.master_key.as_bytes().to_vec())
            .set_bool(
                Collection::Keys,
                keys::IS_MASTER_KEY_BACKED_UP,
                stored.is_master_key_backed_up,
            )
            .set(Collection::Keys, keys::PIN_TYPE, vec![stored.pin_type as u8])
            .set_optional(
                Collection::Keys,
                keys::VERIFICATION_STRING,
                stored.encoded_verification_string.map(str::as_bytes),
            )
            .set_optional(
                Collection::Keys,
                keys::ENCLAVE_NAME,
                stored.enclave_name.map(str::as_bytes),
            )
            .set_bool(Collection::Keys, keys::HAS_BACKUP_KEY_REQUEST_FAILED, false);
        self.write(batch)
    }

    pub fn set_flag(&self, key: &str, value: bool) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        batch.set_bool(Collection::Keys, key, value);
        self.write(batch)
    }

    pub fn set_synced_derived_key(&self, name: &DerivedKeyName, value: Option<&[u8]>) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        batch.set_optional(Collection::Keys, &name.label(), value);
        self.write(batch)
    }

    /// Remove local keys and every cached enclave token. Pending-restoration
    /// and failure flags are kept.
    pub fn clear_keys(&self) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        batch
            .remove(Collection::Keys, keys::MASTER_KEY)
            .remove(Collection::Keys, keys::IS_MASTER_KEY_BACKED_UP)
            .remove(Collection::Keys, keys::PIN_TYPE)
            .remove(Collection::Keys, keys::VERIFICATION_STRING)
            .clear(Collection::Token);
        for name in SYNCABLE_KEYS {
            batch.remove(Collection::Keys, &name.label());
        }
        self.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, MemoryStore};

    fn memory_store() -> RecoveryStore {
        RecoveryStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn empty_store_loads_default_state() {
        let store = memory_store();
        let state = store.snapshot().unwrap();
        assert!(state.master_key.is_none());
        assert!(state.pin_type.is_none());
        assert!(!state.is_master_key_backed_up);
        assert!(state.synced_derived_keys.is_empty());
    }

    #[test]
    fn store_keys_is_visible_to_next_read() {
        let store = memory_store();
        store.set_flag(keys::HAS_BACKUP_KEY_REQUEST_FAILED, true).unwrap();
        assert!(store.read(|s| s.has_backup_key_request_failed).unwrap());

        let master_key = MasterKey::from([7u8; 32]);
        store
            .store_keys(StoredKeys {
                master_key: &master_key,
                is_master_key_backed_up: true,
                pin_type: PinType::Numeric,
                encoded_verification_string: Some("$argon2i$test"),
                enclave_name: Some("enclave-a"),
            })
            .unwrap();

        let state = store.snapshot().unwrap();
        assert_eq!(state.master_key, Some(master_key));
        assert_eq!(state.pin_type, Some(PinType::Numeric));
        assert!(state.is_master_key_backed_up);
        assert!(!state.has_backup_key_request_failed);
        assert_eq!(state.enclave_name.as_deref(), Some("enclave-a"));
    }

    #[test]
    fn clear_keys_removes_keys_and_tokens() {
        let backing = Arc::new(MemoryStore::new());
        let store = RecoveryStore::new(backing.clone());

        store
            .store_keys(StoredKeys {
                master_key: &MasterKey::from([1u8; 32]),
                is_master_key_backed_up: true,
                pin_type: PinType::Alphanumeric,
                encoded_verification_string: Some("v"),
                enclave_name: Some("enclave-a"),
            })
            .unwrap();
        store
            .set_synced_derived_key(&DerivedKeyName::StorageService, Some(&[9u8; 32][..]))
            .unwrap();
        store.set_flag(keys::HAS_PENDING_RESTORATION, true).unwrap();

        let mut batch = WriteBatch::new();
        batch.set(Collection::Token, "enclave-a.data", vec![0u8; 32]);
        backing.commit(batch).unwrap();

        store.clear_keys().unwrap();

        let state = store.snapshot().unwrap();
        assert!(state.master_key.is_none());
        assert!(state.pin_type.is_none());
        assert!(state.encoded_verification_string.is_none());
        assert!(!state.is_master_key_backed_up);
        assert!(state.synced_derived_keys.is_empty());
        assert!(state.has_pending_restoration);
        assert_eq!(backing.len(Collection::Token), 0);
    }

    #[test]
    fn synced_key_is_loaded_by_label() {
        let store = memory_store();
        store
            .set_synced_derived_key(&DerivedKeyName::StorageService, Some(&[4u8; 32][..]))
            .unwrap();
        let state = store.snapshot().unwrap();
        assert_eq!(
            state.synced_derived_keys.get(&DerivedKeyName::StorageService),
            Some(&vec![4u8; 32])
        );

        store
            .set_synced_derived_key(&DerivedKeyName::StorageService, None)
            .unwrap();
        assert!(store.snapshot().unwrap().synced_derived_keys.is_empty());
    }

    #[test]
    fn corrupt_master_key_is_a_storage_error() {
        let backing = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.set(Collection::Keys, keys::MASTER_KEY, vec![1u8; 5]);
        backing.commit(batch).unwrap();

        let store = RecoveryStore::new(backing);
        assert!(matches!(
            store.snapshot(),
            Err(KbsError::Storage(StoreError::Corrupt { .. }))
        ));
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbs.redb");
        {
            let db: Arc<dyn KeyValueStore> = Arc::new(Database::open(&path).unwrap());
            let store = RecoveryStore::new(db);
            store
                .store_keys(StoredKeys {
                    master_key: &MasterKey::from([3u8; 32]),
                    is_master_key_backed_up: false,
                    pin_type: PinType::Alphanumeric,
                    encoded_verification_string: None,
                    enclave_name: None,
                })
                .unwrap();
        }

        let db: Arc<dyn KeyValueStore> = Arc::new(Database::open(&path).unwrap());
        let state = RecoveryStore::new(db).snapshot().unwrap();
        assert_eq!(state.master_key, Some(MasterKey::from([3u8; 32])));
        assert_eq!(state.pin_type, Some(PinType::Alphanumeric));
        assert!(state.enclave_name.is_none());
    }
}
