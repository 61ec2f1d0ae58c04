// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Enclave Access
//!
//! Everything needed to talk to one remote key backup enclave:
//!
//! - `KeyBackupEnclave`: identity of an enclave (name + service id)
//! - `AttestationProvider`: performs remote attestation and yields the
//!   channel keys, request id, credentials and cookies for one exchange
//! - `Transport`: moves opaque HTTP requests, implemented by `http::HttpTransport`
//! - `token`: the persisted single-use token per enclave
//! - `protocol`: typed request/response payloads
//! - `client`: `EnclaveClient`, which ties the pieces together
//!
//! Attestation itself is external to this crate. Callers supply an
//! `AttestationProvider` for their deployment.

pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;
pub mod protocol;
pub mod token;

pub use client::{EnclaveClient, EnclaveRequest, RequestKind};
pub use http::HttpTransport;
pub use token::{Token, TokenStore};

use std::future::Future;

use zeroize::Zeroizing;

use crate::error::{KbsError, KbsResult};

// =============================================================================
// Enclave Identity
// =============================================================================

/// A remote enclave the master key can be escrowed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBackupEnclave {
    /// Enclave name, used in request paths and to scope tokens.
    pub name: String,
    /// Hex-encoded service id sent with every request.
    pub service_id: String,
    /// Expected enclave measurement, checked by the attestation provider.
    pub mrenclave: Option<String>,
}

impl KeyBackupEnclave {
    pub fn new(name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            mrenclave: None,
        }
    }

    pub fn with_mrenclave(mut self, mrenclave: impl Into<String>) -> Self {
        self.mrenclave = Some(mrenclave.into());
        self
    }

    /// Decoded service id.
    pub fn service_id_bytes(&self) -> KbsResult<Vec<u8>> {
        hex::decode(&self.service_id).map_err(|e| {
            KbsError::assertion(format!(
                "enclave {} has an invalid service id: {e}",
                self.name
            ))
        })
    }

    /// Parse `name:serviceIdHex[:mrenclave]`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(':');
        let name = parts.next().filter(|s| !s.is_empty())?;
        let service_id = parts.next().filter(|s| !s.is_empty())?;
        let enclave = Self::new(name, service_id);
        let enclave = match parts.next().filter(|s| !s.is_empty()) {
            Some(mrenclave) => enclave.with_mrenclave(mrenclave),
            None => enclave,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(enclave)
    }
}

impl std::fmt::Display for KeyBackupEnclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

// =============================================================================
// Attestation
// =============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("username", &self.username)
            .field("password", &"..")
            .finish()
    }
}

/// Result of a successful attestation handshake.
pub struct RemoteAttestation {
    pub client_key: Zeroizing<[u8; 32]>,
    pub server_key: Zeroizing<[u8; 32]>,
    pub request_id: Vec<u8>,
    pub enclave_name: String,
    pub auth: AuthCredentials,
    pub cookies: Vec<String>,
}

impl std::fmt::Debug for RemoteAttestation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAttestation")
            .field("enclave_name", &self.enclave_name)
            .field("request_id", &hex::encode(&self.request_id))
            .field("auth", &self.auth)
            .field("cookies", &self.cookies.len())
            .finish_non_exhaustive()
    }
}

pub trait AttestationProvider: Send + Sync {
    /// Establish an attested channel with `enclave`.
    ///
    /// Failures should be reported as `KbsError::Attestation` or
    /// `KbsError::Network`.
    fn attest(
        &self,
        enclave: &KeyBackupEnclave,
    ) -> impl Future<Output = KbsResult<RemoteAttestation>> + Send;
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("enclave returned HTTP {0}")]
    HttpStatus(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    /// Path relative to the service base URL, e.g. `/v1/token/{enclave}`.
    pub path: String,
    /// JSON body.
    pub body: Option<Vec<u8>>,
    pub auth: AuthCredentials,
    pub cookies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_enclave_string() {
        let enclave = KeyBackupEnclave::parse("enclave-a:0a0b0c").unwrap();
        assert_eq!(enclave.name, "enclave-a");
        assert_eq!(enclave.service_id_bytes().unwrap(), vec![0x0a, 0x0b, 0x0c]);
        assert!(enclave.mrenclave.is_none());

        let enclave = KeyBackupEnclave::parse(" enclave-b:00ff:abcdef ").unwrap();
        assert_eq!(enclave.mrenclave.as_deref(), Some("abcdef"));

        assert!(KeyBackupEnclave::parse("enclave-c").is_none());
        assert!(KeyBackupEnclave::parse(":00").is_none());
        assert!(KeyBackupEnclave::parse("a:b:c:d").is_none());
    }

    #[test]
    fn bad_service_id_is_an_assertion() {
        let enclave = KeyBackupEnclave::new("enclave-a", "not-hex");
        assert!(matches!(
            enclave.service_id_bytes(),
            Err(KbsError::Assertion(_))
        ));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let auth = AuthCredentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{auth:?}").contains("secret"));
    }
}
