// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Error taxonomy for key backup operations.
//!
//! - `Assertion`: a protocol or cryptographic invariant was violated. Fatal to
//!   the current operation and always logged.
//! - `InvalidPin`: the enclave rejected the PIN. Expected, user-facing.
//! - `BackupMissing`: no escrowed key exists on any enclave tried. Expected.
//! - `Network` / `Attestation`: transport-level failures, surfaced for the
//!   caller's retry policy.
//! - `Storage`: the durable store failed.

use crate::enclave::TransportError;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum KbsError {
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("invalid PIN, {tries_remaining} tries remaining")]
    InvalidPin { tries_remaining: u32 },

    #[error("no backup exists on the enclave")]
    BackupMissing,

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    #[error("remote attestation failed: {0}")]
    Attestation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type KbsResult<T> = Result<T, KbsError>;

impl KbsError {
    /// Build an `Assertion` error, logging it at error level.
    pub fn assertion(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "KBS assertion failed");
        KbsError::Assertion(message)
    }

    /// Whether the failure is a connectivity problem worth retrying.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, KbsError::Network(_) | KbsError::Attestation(_))
    }
}

/// Caller-facing classification of a restore attempt.
#[derive(Debug)]
pub enum RestoreKeysResult {
    Success,
    InvalidPin { remaining_attempts: u32 },
    BackupMissing,
    NetworkError(KbsError),
    GenericError(KbsError),
}

impl From<KbsResult<()>> for RestoreKeysResult {
    fn from(result: KbsResult<()>) -> Self {
        match result {
            Ok(()) => RestoreKeysResult::Success,
            Err(KbsError::InvalidPin { tries_remaining }) => RestoreKeysResult::InvalidPin {
                remaining_attempts: tries_remaining,
            },
            Err(KbsError::BackupMissing) => RestoreKeysResult::BackupMissing,
            Err(e) if e.is_network_failure() => RestoreKeysResult::NetworkError(e),
            Err(e) => RestoreKeysResult::GenericError(e),
        }
    }
}
