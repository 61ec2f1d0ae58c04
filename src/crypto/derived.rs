// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Named subkeys derived from the master key.
//!
//! Every subkey is `HMAC-SHA256(key = base, data = utf8(label))`. Most subkeys
//! use the master key as `base`. Storage-service manifest and record keys
//! instead derive from the storage-service subkey, so the hierarchy is two
//! levels deep:
//!
//! ```text
//! master key
//!   ├── "Registration Lock"
//!   └── "Storage Service Encryption"
//!         ├── "Manifest_{version}"
//!         └── "Item_{base64(identifier)}"
//! ```

use base64ct::{Base64, Encoding};

use crate::error::KbsResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DerivedKeyName {
    RegistrationLock,
    StorageService,
    StorageServiceManifest { version: u64 },
    StorageServiceRecord { identifier: Vec<u8> },
}

/// Keys a primary device pushes to its linked devices.
pub const SYNCABLE_KEYS: [DerivedKeyName; 1] = [DerivedKeyName::StorageService];

/// Where a subkey's base material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationBase {
    MasterKey,
    Derived(DerivedKeyName),
}

impl DerivedKeyName {
    /// HMAC input label. Also the storage key for synced copies.
    pub fn label(&self) -> String {
        match self {
            DerivedKeyName::RegistrationLock => "Registration Lock".to_string(),
            DerivedKeyName::StorageService => "Storage Service Encryption".to_string(),
            DerivedKeyName::StorageServiceManifest { version } => format!("Manifest_{version}"),
            DerivedKeyName::StorageServiceRecord { identifier } => {
                format!("Item_{}", Base64::encode_string(identifier))
            }
        }
    }

    pub fn base(&self) -> DerivationBase {
        match self {
            DerivedKeyName::StorageServiceManifest { .. }
            | DerivedKeyName::StorageServiceRecord { .. } => {
                DerivationBase::Derived(DerivedKeyName::StorageService)
            }
            DerivedKeyName::RegistrationLock | DerivedKeyName::StorageService => {
                DerivationBase::MasterKey
            }
        }
    }

    pub fn is_syncable(&self) -> bool {
        SYNCABLE_KEYS.contains(self)
    }

    /// Compute this subkey from its base material.
    pub fn derive_from(&self, base_material: &[u8]) -> KbsResult<[u8; 32]> {
        super::hmac_sha256(base_material, self.label().as_bytes())
    }
}

impl std::fmt::Display for DerivedKeyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DerivedKeyName::RegistrationLock => write!(f, "registration-lock"),
            DerivedKeyName::StorageService => write!(f, "storage-service"),
            DerivedKeyName::StorageServiceManifest { version } => {
                write!(f, "storage-service-manifest-{version}")
            }
            DerivedKeyName::StorageServiceRecord { .. } => write!(f, "storage-service-record"),
        }
    }
}
