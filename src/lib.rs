// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! KBS Client - PIN-protected master key escrow
//!
//! Escrows a 32-byte master key with remote key backup enclaves, recoverable
//! only with the user's PIN, and derives the subkeys other subsystems use.
//!
//! ## Modules
//!
//! - `config` - Environment configuration and the enclave list
//! - `crypto` - Argon2 derivation, master key envelope, derived keys, AES-GCM
//! - `enclave` - Attested enclave protocol, tokens and HTTP transport
//! - `recovery` - `KeyBackupService`, the backup/restore/migrate flows
//! - `state` - Cached local key state
//! - `storage` - Durable key-value store (redb)

pub mod config;
pub mod crypto;
pub mod enclave;
pub mod error;
pub mod recovery;
pub mod state;
pub mod storage;

pub use config::KbsConfig;
pub use error::{KbsError, KbsResult, RestoreKeysResult};
pub use recovery::KeyBackupService;
