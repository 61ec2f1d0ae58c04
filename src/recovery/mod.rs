// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Backup Service
//!
//! Sequences enclave calls into the user-facing recovery flows.
//!
//! ## Enclave Order
//!
//! Restores walk the configured enclaves newest first. A `missing` backup
//! moves on to the next older enclave. A rejected PIN stops the walk, since
//! the same PIN is wrong everywhere. Backups always go to the current enclave.
//!
//! ## Local State
//!
//! `LocalState` is written only after a round trip fully succeeds. The one
//! exception is `delete`, which clears local keys whatever the network says.
//!
//! ## Key Derivation
//!
//! Argon2 runs on tokio's blocking pool. Callers await it like any other
//! network step.

use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::KbsConfig;
use crate::crypto::derived::DerivationBase;
use crate::crypto::kdf::{self, BACKUP_ID_LEN};
use crate::crypto::{aead, master_key, DerivedKeyName, DerivedMaterial, MasterKey, PinType};
use crate::enclave::client::CallOutcome;
use crate::enclave::{
    AttestationProvider, EnclaveClient, EnclaveRequest, KeyBackupEnclave, TokenStore, Transport,
};
use crate::error::{KbsError, KbsResult};
use crate::state::{keys, LocalState, RecoveryStore, StoredKeys};
use crate::storage::KeyValueStore;

/// Master key recovered from one enclave, with the material that unwrapped it.
struct RestoredKeys<'a> {
    master_key: MasterKey,
    material: DerivedMaterial,
    enclave: &'a KeyBackupEnclave,
}

async fn run_blocking<R, F>(f: F) -> KbsResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> KbsResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KbsError::assertion(format!("key derivation task failed: {e}")))?
}

async fn derive_material(pin: &str, backup_id: [u8; BACKUP_ID_LEN]) -> KbsResult<DerivedMaterial> {
    let pin = Zeroizing::new(pin.to_string());
    run_blocking(move || kdf::derive_material(&pin, &backup_id)).await
}

async fn derive_verification_string(pin: &str) -> KbsResult<String> {
    let pin = Zeroizing::new(pin.to_string());
    run_blocking(move || kdf::derive_verification_string(&pin)).await
}

pub struct KeyBackupService<A, T> {
    config: KbsConfig,
    client: EnclaveClient<A, T>,
    state: RecoveryStore,
}

impl<A: AttestationProvider, T: Transport> KeyBackupService<A, T> {
    /// Keys and tokens share one durable store.
    pub fn new(
        config: KbsConfig,
        store: Arc<dyn KeyValueStore>,
        attestation: A,
        transport: T,
    ) -> Self {
        let tokens = TokenStore::new(Arc::clone(&store));
        let client = EnclaveClient::new(attestation, transport, tokens, &config);
        Self {
            config,
            client,
            state: RecoveryStore::new(store),
        }
    }

    pub fn config(&self) -> &KbsConfig {
        &self.config
    }

    pub fn state(&self) -> &RecoveryStore {
        &self.state
    }

    // =========================================================================
    // Local state
    // =========================================================================

    pub fn master_key_is_present(&self) -> KbsResult<bool> {
        self.state.read(|s| s.master_key.is_some())
    }

    pub fn is_backed_up(&self) -> KbsResult<bool> {
        self.state.read(|s| s.is_master_key_backed_up)
    }

    pub fn pin_type(&self) -> KbsResult<Option<PinType>> {
        self.state.read(|s| s.pin_type)
    }

    /// Enclave that holds the current backup, if any.
    pub fn current_enclave_name(&self) -> KbsResult<Option<String>> {
        self.state.read(|s| s.enclave_name.clone())
    }

    pub fn has_backup_key_request_failed(&self) -> KbsResult<bool> {
        self.state.read(|s| s.has_backup_key_request_failed)
    }

    pub fn has_pending_restoration(&self) -> KbsResult<bool> {
        self.state.read(|s| s.has_pending_restoration)
    }

    pub fn record_pending_restoration(&self) -> KbsResult<()> {
        self.state.set_flag(keys::HAS_PENDING_RESTORATION, true)
    }

    pub fn clear_pending_restoration(&self) -> KbsResult<()> {
        self.state.set_flag(keys::HAS_PENDING_RESTORATION, false)
    }

    pub fn set_master_key_backed_up(&self, backed_up: bool) -> KbsResult<()> {
        self.state.set_flag(keys::IS_MASTER_KEY_BACKED_UP, backed_up)
    }

    /// Check `pin` against the stored verification string. No network.
    pub async fn verify_pin_locally(&self, pin: &str) -> KbsResult<bool> {
        let Some(encoded) = self.state.read(|s| s.encoded_verification_string.clone())? else {
            tracing::warn!("No verification string stored, cannot verify PIN locally");
            return Ok(false);
        };
        let pin = Zeroizing::new(pin.to_string());
        run_blocking(move || Ok(kdf::verify_pin(&pin, &encoded))).await
    }

    /// Forget the local keys and tokens. The remote backup is untouched.
    pub fn clear_keys(&self) -> KbsResult<()> {
        self.state.clear_keys()
    }

    /// Generate a master key that is never escrowed.
    pub fn use_device_local_master_key_only(&self) -> KbsResult<()> {
        let master_key = MasterKey::generate()?;
        tracing::info!("Using a device-local master key");
        self.state.store_keys(StoredKeys {
            master_key: &master_key,
            is_master_key_backed_up: false,
            pin_type: PinType::Alphanumeric,
            encoded_verification_string: None,
            enclave_name: None,
        })
    }

    // =========================================================================
    // Derived keys
    // =========================================================================

    fn derive_with(&self, state: &LocalState, name: &DerivedKeyName) -> KbsResult<Option<Vec<u8>>> {
        if name.is_syncable() && self.config.uses_synced_keys() {
            if let Some(synced) = state.synced_derived_keys.get(name) {
                return Ok(Some(synced.clone()));
            }
        }

        let base = match name.base() {
            DerivationBase::MasterKey => match &state.master_key {
                Some(master_key) => master_key.as_bytes().to_vec(),
                None => return Ok(None),
            },
            DerivationBase::Derived(parent) => match self.derive_with(state, &parent)? {
                Some(parent_key) => parent_key,
                None => return Ok(None),
            },
        };
        Ok(Some(name.derive_from(&base)?.to_vec()))
    }

    /// Subkey `name`, or `None` without the base material to compute it.
    pub fn derive(&self, name: &DerivedKeyName) -> KbsResult<Option<Vec<u8>>> {
        self.state.read(|state| self.derive_with(state, name))?
    }

    pub fn is_key_available(&self, name: &DerivedKeyName) -> KbsResult<bool> {
        Ok(self.derive(name)?.is_some())
    }

    fn require_key(&self, name: &DerivedKeyName) -> KbsResult<Zeroizing<Vec<u8>>> {
        self.derive(name)?
            .map(Zeroizing::new)
            .ok_or_else(|| KbsError::assertion(format!("derived key {name} is unavailable")))
    }

    /// AES-GCM encrypt under subkey `name`. Output is `nonce || ct || tag`.
    pub fn encrypt_under_derived_key(
        &self,
        name: &DerivedKeyName,
        plaintext: &[u8],
    ) -> KbsResult<Vec<u8>> {
        let key = self.require_key(name)?;
        aead::seal_concatenated(&key, plaintext)
    }

    pub fn decrypt_under_derived_key(
        &self,
        name: &DerivedKeyName,
        ciphertext: &[u8],
    ) -> KbsResult<Vec<u8>> {
        let key = self.require_key(name)?;
        aead::open_concatenated(&key, ciphertext)
    }

    pub fn derive_registration_lock_token(&self) -> KbsResult<Option<String>> {
        Ok(self.derive(&DerivedKeyName::RegistrationLock)?.map(hex::encode))
    }

    /// Cache a subkey pushed from the primary device. `None` removes it.
    pub fn store_synced_derived_key(
        &self,
        name: &DerivedKeyName,
        data: Option<&[u8]>,
    ) -> KbsResult<()> {
        if !name.is_syncable() {
            return Err(KbsError::assertion(format!(
                "{name} is not a syncable derived key"
            )));
        }
        if !self.config.uses_synced_keys() {
            return Err(KbsError::assertion(
                "primary device should never store synced derived keys",
            ));
        }
        self.state.set_synced_derived_key(name, data)
    }

    // =========================================================================
    // Enclave operations
    // =========================================================================

    async fn restore_from<'a>(
        &self,
        enclave: &'a KeyBackupEnclave,
        pin: &str,
        ignore_cached_token: bool,
    ) -> KbsResult<RestoredKeys<'a>> {
        let backup_id = self
            .client
            .fetch_backup_id(enclave, ignore_cached_token)
            .await?;
        let material = derive_material(pin, backup_id).await?;

        let outcome = self
            .client
            .call(
                enclave,
                EnclaveRequest::Restore {
                    access_key: Zeroizing::new(material.access_key),
                },
                ignore_cached_token,
            )
            .await?;
        let encrypted_master_key = match outcome {
            CallOutcome::Restored {
                encrypted_master_key,
            } => encrypted_master_key,
            other => {
                return Err(KbsError::assertion(format!(
                    "restore from {} returned {other:?}",
                    enclave.name
                )))
            }
        };

        let master_key = master_key::decrypt(&encrypted_master_key, &material.encryption_key)?;
        Ok(RestoredKeys {
            master_key,
            material,
            enclave,
        })
    }

    async fn restore_with_fallback(
        &self,
        pin: &str,
        ignore_cached_token: bool,
    ) -> KbsResult<RestoredKeys<'_>> {
        let enclaves = self.config.enclaves_newest_first();
        let oldest = enclaves.len() - 1;

        for (index, enclave) in enclaves.into_iter().enumerate() {
            match self.restore_from(enclave, pin, ignore_cached_token).await {
                Err(KbsError::BackupMissing) if index < oldest => {
                    tracing::info!(enclave = %enclave.name, "Trying the next older enclave");
                }
                result => return result,
            }
        }
        Err(KbsError::BackupMissing)
    }

    /// Recover the master key with `pin` and store it locally.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn restore(&self, pin: &str) -> KbsResult<MasterKey> {
        let restored = self.restore_with_fallback(pin, false).await?;
        let verification_string = derive_verification_string(pin).await?;

        self.state.store_keys(StoredKeys {
            master_key: &restored.master_key,
            is_master_key_backed_up: true,
            pin_type: PinType::for_pin(pin),
            encoded_verification_string: Some(&verification_string),
            enclave_name: Some(&restored.enclave.name),
        })?;
        tracing::info!(enclave = %restored.enclave.name, "Restored master key");
        Ok(restored.master_key)
    }

    /// Recover the master key, then back it up again to the current enclave.
    ///
    /// The fresh backup resets the enclave's guess counter. A backup found on
    /// an older enclave is moved forward and deleted from the old one.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn restore_and_rebackup(&self, pin: &str) -> KbsResult<()> {
        let RestoredKeys {
            master_key,
            material,
            enclave: source,
        } = self.restore_with_fallback(pin, false).await?;
        let current = &self.config.current_enclave;

        let material = if source.name == current.name {
            material
        } else {
            let backup_id = self.client.fetch_backup_id(current, false).await?;
            derive_material(pin, backup_id).await?
        };
        let encrypted_master_key = master_key::encrypt(&master_key, &material.encryption_key)?;

        match self
            .client
            .call(
                current,
                EnclaveRequest::Backup {
                    access_key: Zeroizing::new(material.access_key),
                    encrypted_master_key,
                },
                false,
            )
            .await?
        {
            CallOutcome::BackedUp => {}
            other => {
                return Err(KbsError::assertion(format!(
                    "backup to {} returned {other:?}",
                    current.name
                )))
            }
        }

        let verification_string = derive_verification_string(pin).await?;
        self.state.store_keys(StoredKeys {
            master_key: &master_key,
            is_master_key_backed_up: true,
            pin_type: PinType::for_pin(pin),
            encoded_verification_string: Some(&verification_string),
            enclave_name: Some(&current.name),
        })?;

        if source.name != current.name {
            tracing::info!(from = %source.name, to = %current.name, "Moved backup to current enclave");
            self.delete_best_effort(source).await;
        }
        Ok(())
    }

    async fn backup_to_current(&self, pin: &str, rotate_master_key: bool) -> KbsResult<()> {
        let current = &self.config.current_enclave;
        let backup_id = self.client.fetch_backup_id(current, false).await?;

        let master_key = match self.state.read(|s| s.master_key.clone())? {
            Some(existing) if !rotate_master_key => existing,
            _ => MasterKey::generate()?,
        };
        let material = derive_material(pin, backup_id).await?;
        let encrypted_master_key = master_key::encrypt(&master_key, &material.encryption_key)?;

        match self
            .client
            .call(
                current,
                EnclaveRequest::Backup {
                    access_key: Zeroizing::new(material.access_key),
                    encrypted_master_key,
                },
                false,
            )
            .await?
        {
            CallOutcome::BackedUp => {}
            other => {
                return Err(KbsError::assertion(format!(
                    "backup to {} returned {other:?}",
                    current.name
                )))
            }
        }

        let verification_string = derive_verification_string(pin).await?;
        self.state.store_keys(StoredKeys {
            master_key: &master_key,
            is_master_key_backed_up: true,
            pin_type: PinType::for_pin(pin),
            encoded_verification_string: Some(&verification_string),
            enclave_name: Some(&current.name),
        })?;
        tracing::info!(enclave = %current.name, rotated = rotate_master_key, "Backed up master key");
        Ok(())
    }

    /// Escrow the master key on the current enclave under `pin`.
    ///
    /// Generates a key when `rotate_master_key` is set or none is stored.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn backup(&self, pin: &str, rotate_master_key: bool) -> KbsResult<()> {
        let result = self.backup_to_current(pin, rotate_master_key).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Key backup failed");
            if let Err(store_err) = self
                .state
                .set_flag(keys::HAS_BACKUP_KEY_REQUEST_FAILED, true)
            {
                tracing::error!(error = %store_err, "Failed to record backup failure");
            }
        }
        result
    }

    /// Delete the remote backup and every local key.
    ///
    /// Local keys are cleared even when the enclave call fails. The network
    /// error is still returned.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn delete(&self) -> KbsResult<()> {
        let current = &self.config.current_enclave;
        let remote = self
            .client
            .call(current, EnclaveRequest::Delete, false)
            .await
            .map(|_| ());

        self.state.clear_keys()?;

        match &remote {
            Ok(()) => tracing::info!(enclave = %current.name, "Deleted keys"),
            Err(e) => tracing::warn!(
                enclave = %current.name,
                error = %e,
                "Remote delete failed, local keys cleared anyway"
            ),
        }
        remote
    }

    async fn delete_best_effort(&self, enclave: &KeyBackupEnclave) {
        if let Err(e) = self
            .client
            .call(enclave, EnclaveRequest::Delete, false)
            .await
        {
            tracing::warn!(enclave = %enclave.name, error = %e, "Failed to delete backup from old enclave");
        }
    }

    /// Move a confirmed backup from an old enclave to the current one.
    ///
    /// Returns whether a migration ran.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn migrate_enclave_if_needed(&self, current_pin: &str) -> KbsResult<bool> {
        let state = self.state.snapshot()?;
        let current = &self.config.current_enclave;

        if state.enclave_name.as_deref() == Some(current.name.as_str()) {
            return Ok(false);
        }
        if state.master_key.is_none() || !state.is_master_key_backed_up {
            tracing::warn!("Can't migrate enclave without a backed up master key");
            return Ok(false);
        }

        tracing::info!(
            from = state.enclave_name.as_deref().unwrap_or("unknown"),
            to = %current.name,
            "Migrating backup to current enclave"
        );
        self.backup(current_pin, false).await?;

        let previous = state
            .enclave_name
            .as_deref()
            .and_then(|name| self.config.previous_enclave(name));
        match previous {
            Some(previous) => self.delete_best_effort(previous).await,
            None => tracing::warn!(
                enclave = state.enclave_name.as_deref().unwrap_or("unknown"),
                "Previous enclave is not configured, skipping delete"
            ),
        }
        Ok(true)
    }

    /// Registration-lock token for re-registering under a new number.
    ///
    /// Restores with `pin` without spending cached tokens. Local state is
    /// left as it is.
    #[tracing::instrument(skip_all, fields(operation_id = %Uuid::new_v4()))]
    pub async fn acquire_registration_lock_for_new_number(&self, pin: &str) -> KbsResult<String> {
        let restored = self.restore_with_fallback(pin, true).await?;
        let token = DerivedKeyName::RegistrationLock.derive_from(restored.master_key.as_bytes())?;
        Ok(hex::encode(token))
    }
}
