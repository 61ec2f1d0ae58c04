// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! One request/response exchange with a named enclave.
//!
//! ## Call Sequence
//!
//! ```text
//! lock enclave → attest → token (cached or fetched) → build request
//!   → seal (client key, AAD = request id) → PUT /v1/backup/{enclave}
//!   → open (server key) → parse → rotate token → map status
//! ```
//!
//! The per-enclave lock is held for the whole sequence. Tokens are single
//! use, so two in-flight calls to the same enclave would otherwise spend the
//! same token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use zeroize::Zeroizing;

use super::protocol::{
    BackupRequest, BackupStatus, DeleteRequest, EnclaveRequestEnvelope, EnclaveResponseEnvelope,
    KeyBackupRequest, KeyBackupResponse, RestoreRequest, RestoreStatus, TokenResponse,
};
use super::token::{Token, TokenStore};
use super::{
    AttestationProvider, HttpMethod, KeyBackupEnclave, RemoteAttestation, Transport,
    TransportError, TransportRequest, TransportResponse,
};
use crate::config::KbsConfig;
use crate::crypto::aead::{self, SealedBox};
use crate::crypto::master_key::ENVELOPE_LEN;
use crate::error::{KbsError, KbsResult};

pub fn token_path(enclave_name: &str) -> String {
    format!("/v1/token/{enclave_name}")
}

pub fn backup_path(enclave_name: &str) -> String {
    format!("/v1/backup/{enclave_name}")
}

// =============================================================================
// Requests and Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Backup,
    Restore,
    Delete,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Backup => "backup",
            RequestKind::Restore => "restore",
            RequestKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub enum EnclaveRequest {
    Backup {
        access_key: Zeroizing<[u8; 32]>,
        encrypted_master_key: [u8; ENVELOPE_LEN],
    },
    Restore {
        access_key: Zeroizing<[u8; 32]>,
    },
    Delete,
}

impl std::fmt::Debug for EnclaveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnclaveRequest::{}", self.kind())
    }
}

impl EnclaveRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            EnclaveRequest::Backup { .. } => RequestKind::Backup,
            EnclaveRequest::Restore { .. } => RequestKind::Restore,
            EnclaveRequest::Delete => RequestKind::Delete,
        }
    }

    fn build(
        &self,
        token: &Token,
        service_id: Vec<u8>,
        valid_from: u64,
        maximum_tries: u32,
    ) -> KeyBackupRequest {
        match self {
            EnclaveRequest::Backup {
                access_key,
                encrypted_master_key,
            } => KeyBackupRequest::Backup(BackupRequest {
                service_id,
                backup_id: token.backup_id.to_vec(),
                token: token.data.to_vec(),
                valid_from,
                data: encrypted_master_key.to_vec(),
                pin: access_key.to_vec(),
                tries: maximum_tries,
            }),
            EnclaveRequest::Restore { access_key } => KeyBackupRequest::Restore(RestoreRequest {
                service_id,
                backup_id: token.backup_id.to_vec(),
                token: token.data.to_vec(),
                valid_from,
                pin: access_key.to_vec(),
            }),
            EnclaveRequest::Delete => KeyBackupRequest::Delete(DeleteRequest {
                service_id,
                backup_id: token.backup_id.to_vec(),
            }),
        }
    }
}

/// Successful result of one enclave call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    BackedUp,
    Restored { encrypted_master_key: Vec<u8> },
    Deleted,
}

// =============================================================================
// Client
// =============================================================================

pub struct EnclaveClient<A, T> {
    attestation: A,
    transport: T,
    tokens: TokenStore,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    maximum_key_attempts: u32,
    valid_from_skew: Duration,
}

impl<A: AttestationProvider, T: Transport> EnclaveClient<A, T> {
    pub fn new(attestation: A, transport: T, tokens: TokenStore, config: &KbsConfig) -> Self {
        Self {
            attestation,
            transport,
            tokens,
            locks: Mutex::new(HashMap::new()),
            maximum_key_attempts: config.maximum_key_attempts,
            valid_from_skew: config.valid_from_skew,
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    async fn lock_enclave(&self, enclave_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(enclave_name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn valid_from(&self) -> u64 {
        let skew = i64::try_from(self.valid_from_skew.as_secs()).unwrap_or(i64::MAX);
        let valid_from = chrono::Utc::now().timestamp().saturating_sub(skew);
        u64::try_from(valid_from).unwrap_or(0)
    }

    async fn send(&self, request: TransportRequest) -> KbsResult<TransportResponse> {
        let path = request.path.clone();
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            tracing::warn!(%path, status = response.status, "Enclave request failed");
            return Err(TransportError::HttpStatus(response.status).into());
        }
        Ok(response)
    }

    /// Backup id for `enclave`, from the cached token or a fresh token fetch.
    pub async fn fetch_backup_id(
        &self,
        enclave: &KeyBackupEnclave,
        ignore_cached_token: bool,
    ) -> KbsResult<[u8; 32]> {
        let _guard = self.lock_enclave(&enclave.name).await;

        if !ignore_cached_token {
            if let Some(token) = self.tokens.next(&enclave.name)? {
                return Ok(token.backup_id);
            }
        }

        let attestation = self.attestation.attest(enclave).await?;
        let token = self
            .obtain_token(enclave, &attestation, ignore_cached_token)
            .await?;
        Ok(token.backup_id)
    }

    async fn obtain_token(
        &self,
        enclave: &KeyBackupEnclave,
        attestation: &RemoteAttestation,
        ignore_cached_token: bool,
    ) -> KbsResult<Token> {
        // A cached token must be spent before another is fetched.
        if !ignore_cached_token {
            if let Some(token) = self.tokens.next(&enclave.name)? {
                return Ok(token);
            }
        }

        tracing::debug!(enclave = %enclave.name, "Fetching enclave token");
        let response = self
            .send(TransportRequest {
                method: HttpMethod::Get,
                path: token_path(&attestation.enclave_name),
                body: None,
                auth: attestation.auth.clone(),
                cookies: attestation.cookies.clone(),
            })
            .await?;

        let parsed: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            TransportError::InvalidResponse(format!("token response is not valid JSON: {e}"))
        })?;
        let token = Token::new(&parsed.backup_id, &parsed.token, parsed.tries, &enclave.name)?;

        if !ignore_cached_token {
            self.tokens.record(&token)?;
        }
        Ok(token)
    }

    /// Run one request against `enclave` and rotate its token.
    pub async fn call(
        &self,
        enclave: &KeyBackupEnclave,
        request: EnclaveRequest,
        ignore_cached_token: bool,
    ) -> KbsResult<CallOutcome> {
        let kind = request.kind();
        let _guard = self.lock_enclave(&enclave.name).await;

        let attestation = self.attestation.attest(enclave).await?;
        let token = self
            .obtain_token(enclave, &attestation, ignore_cached_token)
            .await?;

        let payload = request.build(
            &token,
            enclave.service_id_bytes()?,
            self.valid_from(),
            self.maximum_key_attempts,
        );
        let plaintext = serde_json::to_vec(&payload)
            .map_err(|e| KbsError::assertion(format!("failed to encode {kind} request: {e}")))?;
        let sealed = aead::seal(&attestation.client_key[..], &plaintext, &attestation.request_id)?;

        let envelope = EnclaveRequestEnvelope {
            request_id: attestation.request_id.clone(),
            iv: sealed.nonce.to_vec(),
            data: sealed.ciphertext,
            mac: sealed.tag.to_vec(),
            request_type: kind.as_str().to_string(),
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| KbsError::assertion(format!("failed to encode request envelope: {e}")))?;

        tracing::debug!(enclave = %enclave.name, kind = kind.as_str(), "Sending enclave request");
        let response = self
            .send(TransportRequest {
                method: HttpMethod::Put,
                path: backup_path(&attestation.enclave_name),
                body: Some(body),
                auth: attestation.auth.clone(),
                cookies: attestation.cookies.clone(),
            })
            .await?;

        let response = open_response(&attestation, &response.body)?;
        self.handle_response(enclave, kind, response, ignore_cached_token)
    }

    fn handle_response(
        &self,
        enclave: &KeyBackupEnclave,
        kind: RequestKind,
        response: KeyBackupResponse,
        ignore_cached_token: bool,
    ) -> KbsResult<CallOutcome> {
        match (kind, response) {
            (RequestKind::Backup, KeyBackupResponse::Backup(response)) => {
                let status = response
                    .status
                    .ok_or_else(|| KbsError::assertion("backup response is missing status"))?;
                let next_token = response
                    .token
                    .ok_or_else(|| KbsError::assertion("backup response is missing token"))?;
                if !ignore_cached_token {
                    self.tokens
                        .update_next(&enclave.name, None, &next_token, None)?;
                }

                match status {
                    BackupStatus::Ok => Ok(CallOutcome::BackedUp),
                    BackupStatus::AlreadyExists => Err(KbsError::assertion(format!(
                        "enclave {} reported the backup was replaced",
                        enclave.name
                    ))),
                    BackupStatus::NotYetValid => Err(KbsError::assertion(format!(
                        "enclave {} rejected validFrom as being in the future",
                        enclave.name
                    ))),
                }
            }
            (RequestKind::Restore, KeyBackupResponse::Restore(response)) => {
                let status = response
                    .status
                    .ok_or_else(|| KbsError::assertion("restore response is missing status"))?;

                // Every response except `missing` spends the token.
                if !ignore_cached_token && status != RestoreStatus::Missing {
                    let next_token = response
                        .token
                        .as_deref()
                        .ok_or_else(|| KbsError::assertion("restore response is missing token"))?;
                    self.tokens
                        .update_next(&enclave.name, None, next_token, response.tries)?;
                }

                match status {
                    RestoreStatus::Ok => {
                        let encrypted_master_key = response.data.ok_or_else(|| {
                            KbsError::assertion("restore response is missing the master key")
                        })?;
                        Ok(CallOutcome::Restored {
                            encrypted_master_key,
                        })
                    }
                    RestoreStatus::PinMismatch => {
                        let tries_remaining = response.tries.unwrap_or(0);
                        tracing::info!(
                            enclave = %enclave.name,
                            tries_remaining,
                            "Enclave rejected PIN"
                        );
                        Err(KbsError::InvalidPin { tries_remaining })
                    }
                    RestoreStatus::Missing => {
                        tracing::info!(enclave = %enclave.name, "No backup on enclave");
                        Err(KbsError::BackupMissing)
                    }
                    RestoreStatus::TokenMismatch => Err(KbsError::assertion(format!(
                        "restore from enclave {} used a spent token",
                        enclave.name
                    ))),
                    RestoreStatus::NotYetValid => Err(KbsError::assertion(format!(
                        "enclave {} rejected validFrom as being in the future",
                        enclave.name
                    ))),
                }
            }
            (RequestKind::Delete, KeyBackupResponse::Delete(_)) => {
                // The backup the token guarded is gone.
                if !ignore_cached_token {
                    self.tokens.clear(&enclave.name)?;
                }
                Ok(CallOutcome::Deleted)
            }
            (kind, _) => Err(KbsError::assertion(format!(
                "enclave {} answered a {kind} request with another response kind",
                enclave.name
            ))),
        }
    }
}

fn open_response(attestation: &RemoteAttestation, body: &[u8]) -> KbsResult<KeyBackupResponse> {
    let envelope: EnclaveResponseEnvelope = serde_json::from_slice(body).map_err(|e| {
        TransportError::InvalidResponse(format!("enclave response is not valid JSON: {e}"))
    })?;
    if envelope.data.is_empty() {
        return Err(KbsError::assertion("enclave response data is empty"));
    }

    let sealed = SealedBox::from_parts(&envelope.iv, envelope.data, &envelope.mac)?;
    let plaintext = aead::open(&attestation.server_key[..], &sealed, &[])
        .map_err(|_| KbsError::assertion("failed to decrypt enclave response"))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| KbsError::assertion(format!("enclave response payload is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::fake::FakeEnclave;
    use crate::storage::MemoryStore;

    fn enclave(name: &str) -> KeyBackupEnclave {
        KeyBackupEnclave::new(name, "0102")
    }

    fn client(fake: &FakeEnclave) -> EnclaveClient<FakeEnclave, FakeEnclave> {
        let config = KbsConfig::new(enclave("enclave-a"));
        EnclaveClient::new(
            fake.clone(),
            fake.clone(),
            TokenStore::new(Arc::new(MemoryStore::new())),
            &config,
        )
    }

    #[tokio::test]
    async fn fetch_backup_id_caches_the_token() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");

        let backup_id = client.fetch_backup_id(&a, false).await.unwrap();
        assert_eq!(backup_id, fake.backup_id("enclave-a"));
        assert!(client.tokens().next("enclave-a").unwrap().is_some());

        // Second lookup is served from the cache.
        client.fetch_backup_id(&a, false).await.unwrap();
        assert_eq!(fake.calls_to("enclave-a"), vec!["token"]);
    }

    #[tokio::test]
    async fn ignored_cache_is_not_written() {
        let fake = FakeEnclave::new();
        let client = client(&fake);

        client
            .fetch_backup_id(&enclave("enclave-a"), true)
            .await
            .unwrap();
        assert!(client.tokens().next("enclave-a").unwrap().is_none());
    }

    #[tokio::test]
    async fn backup_then_restore_rotates_tokens() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");

        client.fetch_backup_id(&a, false).await.unwrap();
        let before = client.tokens().next("enclave-a").unwrap().unwrap();

        let outcome = client
            .call(
                &a,
                EnclaveRequest::Backup {
                    access_key: Zeroizing::new([7u8; 32]),
                    encrypted_master_key: [9u8; ENVELOPE_LEN],
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::BackedUp);

        let after_backup = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(after_backup.data, before.data);
        assert_eq!(after_backup.backup_id, before.backup_id);

        let outcome = client
            .call(&a, EnclaveRequest::Restore {
                    access_key: Zeroizing::new([7u8; 32]),
                }, false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallOutcome::Restored {
                encrypted_master_key: vec![9u8; ENVELOPE_LEN]
            }
        );
        let after_restore = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(after_restore.data, after_backup.data);
    }

    #[tokio::test]
    async fn wrong_access_key_is_invalid_pin_and_rotates_token() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");
        fake.seed_backup("enclave-a", [1u8; 32], vec![0u8; ENVELOPE_LEN], 10);

        client.fetch_backup_id(&a, false).await.unwrap();
        let before = client.tokens().next("enclave-a").unwrap().unwrap();

        let err = client
            .call(&a, EnclaveRequest::Restore {
                    access_key: Zeroizing::new([2u8; 32]),
                }, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KbsError::InvalidPin { tries_remaining: 9 }));

        let after = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(after.data, before.data);
        assert_eq!(after.tries, 9);
    }

    #[tokio::test]
    async fn missing_backup_keeps_token() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");

        client.fetch_backup_id(&a, false).await.unwrap();
        let before = client.tokens().next("enclave-a").unwrap().unwrap();

        let err = client
            .call(&a, EnclaveRequest::Restore {
                    access_key: Zeroizing::new([2u8; 32]),
                }, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KbsError::BackupMissing));
        assert_eq!(client.tokens().next("enclave-a").unwrap().unwrap(), before);
    }

    /// Replace the cached token data with one the enclave never issued.
    fn spend_cached_token(client: &EnclaveClient<FakeEnclave, FakeEnclave>) {
        client
            .tokens()
            .update_next("enclave-a", None, &[0u8; 32], None)
            .unwrap();
    }

    fn backup_request() -> EnclaveRequest {
        EnclaveRequest::Backup {
            access_key: Zeroizing::new([7u8; 32]),
            encrypted_master_key: [9u8; ENVELOPE_LEN],
        }
    }

    fn restore_request(access_key: [u8; 32]) -> EnclaveRequest {
        EnclaveRequest::Restore {
            access_key: Zeroizing::new(access_key),
        }
    }

    #[tokio::test]
    async fn backup_with_spent_token_keeps_the_fresh_one() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");

        client.fetch_backup_id(&a, false).await.unwrap();
        spend_cached_token(&client);

        let err = client.call(&a, backup_request(), false).await.unwrap_err();
        assert!(matches!(err, KbsError::Assertion(_)));
        assert!(!fake.has_backup("enclave-a"));

        let rotated = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(rotated.data, [0u8; 32]);

        let outcome = client.call(&a, backup_request(), false).await.unwrap();
        assert_eq!(outcome, CallOutcome::BackedUp);
        assert!(fake.has_backup("enclave-a"));
    }

    #[tokio::test]
    async fn restore_with_spent_token_keeps_the_fresh_one() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");
        fake.seed_backup("enclave-a", [1u8; 32], vec![5u8; ENVELOPE_LEN], 10);

        client.fetch_backup_id(&a, false).await.unwrap();
        spend_cached_token(&client);

        let err = client.call(&a, restore_request([1u8; 32]), false).await.unwrap_err();
        assert!(matches!(err, KbsError::Assertion(_)));

        let rotated = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(rotated.data, [0u8; 32]);
        assert_eq!(rotated.tries, 10);

        let outcome = client.call(&a, restore_request([1u8; 32]), false).await.unwrap();
        assert_eq!(
            outcome,
            CallOutcome::Restored {
                encrypted_master_key: vec![5u8; ENVELOPE_LEN]
            }
        );
    }

    #[tokio::test]
    async fn not_yet_valid_keeps_the_fresh_token() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");

        client.fetch_backup_id(&a, false).await.unwrap();
        fake.reject_valid_from("enclave-a");

        let before = client.tokens().next("enclave-a").unwrap().unwrap();
        let err = client.call(&a, backup_request(), false).await.unwrap_err();
        assert!(matches!(err, KbsError::Assertion(_)));
        let after_backup = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(after_backup.data, before.data);

        let err = client.call(&a, restore_request([7u8; 32]), false).await.unwrap_err();
        assert!(matches!(err, KbsError::Assertion(_)));
        let after_restore = client.tokens().next("enclave-a").unwrap().unwrap();
        assert_ne!(after_restore.data, after_backup.data);

        fake.accept_valid_from("enclave-a");
        let outcome = client.call(&a, backup_request(), false).await.unwrap();
        assert_eq!(outcome, CallOutcome::BackedUp);
    }

    #[test]
    fn request_keeps_access_key_zeroizing() {
        let request = restore_request([0xabu8; 32]);
        assert_eq!(format!("{request:?}"), "EnclaveRequest::restore");

        let EnclaveRequest::Restore { access_key } = &request else {
            panic!("expected a restore request");
        };
        let access_key: &Zeroizing<[u8; 32]> = access_key;
        assert_eq!(**access_key, [0xabu8; 32]);
    }

    #[tokio::test]
    async fn delete_clears_token() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let a = enclave("enclave-a");
        fake.seed_backup("enclave-a", [1u8; 32], vec![0u8; ENVELOPE_LEN], 10);

        client.call(&a, EnclaveRequest::Delete, false).await.unwrap();
        assert!(!fake.has_backup("enclave-a"));
        assert!(client.tokens().next("enclave-a").unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_a_network_error() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        fake.fail_requests("enclave-a");

        let err = client
            .call(&enclave("enclave-a"), EnclaveRequest::Delete, false)
            .await
            .unwrap_err();
        assert!(err.is_network_failure());
    }

    #[tokio::test]
    async fn attestation_failure_is_reported() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        fake.fail_attestation("enclave-a");

        let err = client
            .call(&enclave("enclave-a"), EnclaveRequest::Delete, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KbsError::Attestation(_)));
        assert!(fake.calls_to("enclave-a").is_empty());
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        fake.respond_with_status("enclave-a", 503);

        let err = client
            .fetch_backup_id(&enclave("enclave-a"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KbsError::Network(TransportError::HttpStatus(503))
        ));
    }

    #[test]
    fn valid_from_is_behind_the_clock() {
        let fake = FakeEnclave::new();
        let client = client(&fake);
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap();
        let valid_from = client.valid_from();
        assert!(valid_from <= now - 24 * 60 * 60 + 1);
        assert!(valid_from + 24 * 60 * 60 + 5 >= now);
    }
}
