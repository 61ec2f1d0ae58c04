// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Typed enclave payloads.
//!
//! Binary fields are base64 strings on the wire. The inner request and
//! response are externally tagged (`{"restore": {...}}`), so exactly one
//! request kind is carried per message.

use serde::{Deserialize, Serialize};

/// Serde adapters for base64-encoded byte fields.
pub(crate) mod base64_bytes {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| Base64::decode_vec(&encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// =============================================================================
// Token Fetch
// =============================================================================

/// Body of `GET /v1/token/{enclave}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(with = "base64_bytes")]
    pub backup_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
    pub tries: u32,
}

// =============================================================================
// Encrypted Envelope
// =============================================================================

/// Body of `PUT /v1/backup/{enclave}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveRequestEnvelope {
    #[serde(with = "base64_bytes")]
    pub request_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub mac: Vec<u8>,
    #[serde(rename = "type")]
    pub request_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveResponseEnvelope {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub mac: Vec<u8>,
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyBackupRequest {
    Backup(BackupRequest),
    Restore(RestoreRequest),
    Delete(DeleteRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    #[serde(with = "base64_bytes")]
    pub service_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub backup_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
    /// Unix seconds after which the request is valid.
    pub valid_from: u64,
    /// Encrypted master key envelope.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Access key derived from the PIN.
    #[serde(with = "base64_bytes")]
    pub pin: Vec<u8>,
    pub tries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(with = "base64_bytes")]
    pub service_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub backup_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
    pub valid_from: u64,
    #[serde(with = "base64_bytes")]
    pub pin: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    #[serde(with = "base64_bytes")]
    pub service_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub backup_id: Vec<u8>,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyBackupResponse {
    Backup(BackupResponse),
    Restore(RestoreResponse),
    Delete(DeleteResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupStatus {
    Ok,
    AlreadyExists,
    NotYetValid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreStatus {
    Ok,
    TokenMismatch,
    PinMismatch,
    Missing,
    NotYetValid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RestoreStatus>,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,
    /// Encrypted master key envelope, present on `ok`.
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {}
