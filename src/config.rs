// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used by
//! the key backup client. Configuration is loaded from the environment at
//! startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the key backup database | `./data` |
//! | `KBS_ENCLAVE` | Current enclave, `name:serviceIdHex[:mrenclave]` | Required |
//! | `KBS_PREVIOUS_ENCLAVES` | Previous enclaves, comma-separated, newest first | Empty |
//! | `KBS_DEVICE_ROLE` | `primary` or `linked` | `primary` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::time::Duration;

use crate::enclave::KeyBackupEnclave;

/// Environment variable name for the data directory.
///
/// # Default
/// `./data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

pub const DEFAULT_DATA_DIR: &str = "./data";

/// File name of the redb database inside the data directory.
pub const DATABASE_FILE: &str = "kbs.redb";

/// Environment variable name for the current enclave.
///
/// # Format
/// `name:serviceIdHex` or `name:serviceIdHex:mrenclave`
pub const ENCLAVE_ENV: &str = "KBS_ENCLAVE";

/// Environment variable name for enclaves that may still hold older backups.
pub const PREVIOUS_ENCLAVES_ENV: &str = "KBS_PREVIOUS_ENCLAVES";

/// Environment variable name for the device role.
pub const DEVICE_ROLE_ENV: &str = "KBS_DEVICE_ROLE";

/// Environment variable name for log output format.
///
/// # Values
/// - `json`: Structured JSON logs (recommended for production)
/// - `pretty`: Human-readable logs (default)
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Guesses allowed by the enclave before a backup is destroyed.
pub const DEFAULT_MAXIMUM_KEY_ATTEMPTS: u32 = 10;

/// How far `validFrom` is set behind the local clock.
pub const DEFAULT_VALID_FROM_SKEW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceRole {
    #[default]
    Primary,
    Linked,
}

impl std::str::FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(DeviceRole::Primary),
            "linked" => Ok(DeviceRole::Linked),
            other => Err(format!("expected `primary` or `linked`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KbsConfig {
    pub current_enclave: KeyBackupEnclave,
    /// Newest first.
    pub previous_enclaves: Vec<KeyBackupEnclave>,
    pub device_role: DeviceRole,
    /// Read synced derived keys even on a primary device. Test harnesses only.
    pub honor_synced_keys_on_primary: bool,
    pub maximum_key_attempts: u32,
    pub valid_from_skew: Duration,
}

impl KbsConfig {
    pub fn new(current_enclave: KeyBackupEnclave) -> Self {
        Self {
            current_enclave,
            previous_enclaves: Vec::new(),
            device_role: DeviceRole::Primary,
            honor_synced_keys_on_primary: false,
            maximum_key_attempts: DEFAULT_MAXIMUM_KEY_ATTEMPTS,
            valid_from_skew: DEFAULT_VALID_FROM_SKEW,
        }
    }

    pub fn with_previous_enclaves(mut self, previous: Vec<KeyBackupEnclave>) -> Self {
        self.previous_enclaves = previous;
        self
    }

    pub fn with_device_role(mut self, role: DeviceRole) -> Self {
        self.device_role = role;
        self
    }

    pub fn with_synced_keys_on_primary(mut self, honor: bool) -> Self {
        self.honor_synced_keys_on_primary = honor;
        self
    }

    /// Load from `KBS_ENCLAVE`, `KBS_PREVIOUS_ENCLAVES` and `KBS_DEVICE_ROLE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let current = env_optional(ENCLAVE_ENV).ok_or(ConfigError::Missing(ENCLAVE_ENV))?;
        let current_enclave = parse_enclave(ENCLAVE_ENV, &current)?;

        let previous_enclaves = match env_optional(PREVIOUS_ENCLAVES_ENV) {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_enclave(PREVIOUS_ENCLAVES_ENV, s))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let device_role = match env_optional(DEVICE_ROLE_ENV) {
            Some(role) => role.parse().map_err(|reason| ConfigError::Invalid {
                name: DEVICE_ROLE_ENV,
                reason,
            })?,
            None => DeviceRole::Primary,
        };

        Ok(Self::new(current_enclave)
            .with_previous_enclaves(previous_enclaves)
            .with_device_role(device_role))
    }

    /// Current enclave followed by previous enclaves, newest to oldest.
    pub fn enclaves_newest_first(&self) -> Vec<&KeyBackupEnclave> {
        std::iter::once(&self.current_enclave)
            .chain(self.previous_enclaves.iter())
            .collect()
    }

    pub fn previous_enclave(&self, name: &str) -> Option<&KeyBackupEnclave> {
        self.previous_enclaves.iter().find(|e| e.name == name)
    }

    /// Whether synced derived keys take precedence over local derivation.
    pub fn uses_synced_keys(&self) -> bool {
        self.device_role == DeviceRole::Linked || self.honor_synced_keys_on_primary
    }
}

fn parse_enclave(name: &'static str, value: &str) -> Result<KeyBackupEnclave, ConfigError> {
    let enclave = KeyBackupEnclave::parse(value).ok_or_else(|| ConfigError::Invalid {
        name,
        reason: format!("expected name:serviceIdHex[:mrenclave], got `{}`", value.trim()),
    })?;
    hex::decode(&enclave.service_id).map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("service id of {} is not hex: {e}", enclave.name),
    })?;
    Ok(enclave)
}

/// Path of the redb database, from `DATA_DIR`.
pub fn database_path() -> PathBuf {
    let dir = env_optional(DATA_DIR_ENV).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    PathBuf::from(dir).join(DATABASE_FILE)
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
