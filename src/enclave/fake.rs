// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process enclave used by tests.
//!
//! Implements both `AttestationProvider` and `Transport`. Each enclave keeps
//! a backup id, the token it expects next and at most one stored backup.
//! Every exchange is appended to a call log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use zeroize::Zeroizing;

use super::client::{backup_path, token_path};
use super::protocol::{
    BackupResponse, BackupStatus, DeleteResponse, EnclaveRequestEnvelope,
    EnclaveResponseEnvelope, KeyBackupRequest, KeyBackupResponse, RestoreResponse, RestoreStatus,
    TokenResponse,
};
use super::{
    AttestationProvider, AuthCredentials, HttpMethod, KeyBackupEnclave, RemoteAttestation,
    Transport, TransportError, TransportRequest, TransportResponse,
};
use crate::crypto::aead::{self, SealedBox};
use crate::crypto::random_bytes;
use crate::error::{KbsError, KbsResult};

struct StoredBackup {
    access_key: Vec<u8>,
    data: Vec<u8>,
    tries: u32,
}

struct EnclaveRecord {
    backup_id: [u8; 32],
    expected_token: Option<[u8; 32]>,
    backup: Option<StoredBackup>,
}

impl EnclaveRecord {
    fn new() -> Self {
        Self {
            backup_id: random_bytes().unwrap_or([0x5a; 32]),
            expected_token: None,
            backup: None,
        }
    }

    fn issue_token(&mut self) -> [u8; 32] {
        let token = random_bytes().unwrap_or([0xa5; 32]);
        self.expected_token = Some(token);
        token
    }

    fn tries(&self) -> u32 {
        self.backup.as_ref().map_or(0, |b| b.tries)
    }
}

#[derive(Default)]
struct FakeState {
    enclaves: HashMap<String, EnclaveRecord>,
    channels: HashMap<Vec<u8>, ([u8; 32], [u8; 32])>,
    calls: Vec<(String, &'static str)>,
    failing: HashSet<String>,
    failing_attestation: HashSet<String>,
    rejecting_valid_from: HashSet<String>,
    status_overrides: HashMap<String, u16>,
}

impl FakeState {
    fn record(&mut self, name: &str) -> &mut EnclaveRecord {
        self.enclaves
            .entry(name.to_string())
            .or_insert_with(EnclaveRecord::new)
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeEnclave {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEnclave {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backup_id(&self, enclave_name: &str) -> [u8; 32] {
        self.lock().record(enclave_name).backup_id
    }

    /// Store a backup as if a client had already written it.
    pub fn seed_backup(&self, enclave_name: &str, access_key: [u8; 32], data: Vec<u8>, tries: u32) {
        self.lock().record(enclave_name).backup = Some(StoredBackup {
            access_key: access_key.to_vec(),
            data,
            tries,
        });
    }

    pub fn has_backup(&self, enclave_name: &str) -> bool {
        self.lock()
            .enclaves
            .get(enclave_name)
            .is_some_and(|r| r.backup.is_some())
    }

    pub fn stored_backup(&self, enclave_name: &str) -> Option<(Vec<u8>, u32)> {
        self.lock()
            .enclaves
            .get(enclave_name)
            .and_then(|r| r.backup.as_ref())
            .map(|b| (b.data.clone(), b.tries))
    }

    /// Request kinds sent to `enclave_name`, in order (`token` for fetches).
    pub fn calls_to(&self, enclave_name: &str) -> Vec<&'static str> {
        self.lock()
            .calls
            .iter()
            .filter(|(name, _)| name == enclave_name)
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub fn called_enclaves(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in &self.lock().calls {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Fail every transport request to `enclave_name` with a connection error.
    pub fn fail_requests(&self, enclave_name: &str) {
        self.lock().failing.insert(enclave_name.to_string());
    }

    pub fn fail_attestation(&self, enclave_name: &str) {
        self.lock()
            .failing_attestation
            .insert(enclave_name.to_string());
    }

    /// Answer backup and restore requests with `notYetValid` until
    /// `accept_valid_from` is called.
    pub fn reject_valid_from(&self, enclave_name: &str) {
        self.lock()
            .rejecting_valid_from
            .insert(enclave_name.to_string());
    }

    pub fn accept_valid_from(&self, enclave_name: &str) {
        self.lock().rejecting_valid_from.remove(enclave_name);
    }

    pub fn respond_with_status(&self, enclave_name: &str, status: u16) {
        self.lock()
            .status_overrides
            .insert(enclave_name.to_string(), status);
    }

    fn handle_token(state: &mut FakeState, enclave_name: &str) -> TransportResponse {
        state.calls.push((enclave_name.to_string(), "token"));
        let record = state.record(enclave_name);
        let token = record.issue_token();
        let response = TokenResponse {
            backup_id: record.backup_id.to_vec(),
            token: token.to_vec(),
            tries: record.tries(),
        };
        json_response(&response)
    }

    fn handle_request(
        state: &mut FakeState,
        enclave_name: &str,
        body: &[u8],
    ) -> Result<TransportResponse, TransportError> {
        let envelope: EnclaveRequestEnvelope = serde_json::from_slice(body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let Some((client_key, server_key)) = state.channels.get(&envelope.request_id).copied()
        else {
            return Ok(TransportResponse {
                status: 401,
                body: Vec::new(),
            });
        };

        let sealed = SealedBox::from_parts(&envelope.iv, envelope.data, &envelope.mac)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let plaintext = aead::open(&client_key, &sealed, &envelope.request_id)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let request: KeyBackupRequest = serde_json::from_slice(&plaintext)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let kind = match &request {
            KeyBackupRequest::Backup(_) => "backup",
            KeyBackupRequest::Restore(_) => "restore",
            KeyBackupRequest::Delete(_) => "delete",
        };
        state.calls.push((enclave_name.to_string(), kind));
        let not_yet_valid = state.rejecting_valid_from.contains(enclave_name);
        let record = state.record(enclave_name);

        let response = match request {
            KeyBackupRequest::Backup(_) if not_yet_valid => {
                KeyBackupResponse::Backup(BackupResponse {
                    status: Some(BackupStatus::NotYetValid),
                    token: Some(record.issue_token().to_vec()),
                })
            }
            KeyBackupRequest::Restore(_) if not_yet_valid => {
                KeyBackupResponse::Restore(RestoreResponse {
                    status: Some(RestoreStatus::NotYetValid),
                    token: Some(record.issue_token().to_vec()),
                    ..Default::default()
                })
            }
            KeyBackupRequest::Backup(backup) => {
                let status = if Some(backup.token.as_slice())
                    != record.expected_token.as_ref().map(|t| &t[..])
                {
                    BackupStatus::AlreadyExists
                } else {
                    record.backup = Some(StoredBackup {
                        access_key: backup.pin,
                        data: backup.data,
                        tries: backup.tries,
                    });
                    BackupStatus::Ok
                };
                KeyBackupResponse::Backup(BackupResponse {
                    status: Some(status),
                    token: Some(record.issue_token().to_vec()),
                })
            }
            KeyBackupRequest::Restore(restore) => {
                let token_ok = Some(restore.token.as_slice())
                    == record.expected_token.as_ref().map(|t| &t[..]);
                let pin_ok = record
                    .backup
                    .as_ref()
                    .map(|b| b.access_key == restore.pin);
                match pin_ok {
                    Some(_) if restore.backup_id != record.backup_id => {
                        KeyBackupResponse::Restore(RestoreResponse {
                            status: Some(RestoreStatus::Missing),
                            ..Default::default()
                        })
                    }
                    None => KeyBackupResponse::Restore(RestoreResponse {
                        status: Some(RestoreStatus::Missing),
                        ..Default::default()
                    }),
                    Some(_) if !token_ok => KeyBackupResponse::Restore(RestoreResponse {
                        status: Some(RestoreStatus::TokenMismatch),
                        token: Some(record.issue_token().to_vec()),
                        ..Default::default()
                    }),
                    Some(true) => {
                        let (data, tries) = record
                            .backup
                            .as_ref()
                            .map(|b| (b.data.clone(), b.tries))
                            .unwrap_or_default();
                        KeyBackupResponse::Restore(RestoreResponse {
                            status: Some(RestoreStatus::Ok),
                            token: Some(record.issue_token().to_vec()),
                            data: Some(data),
                            tries: Some(tries),
                        })
                    }
                    Some(false) => {
                        let tries = match record.backup.as_mut() {
                            Some(stored) => {
                                stored.tries = stored.tries.saturating_sub(1);
                                stored.tries
                            }
                            None => 0,
                        };
                        // Out of guesses: the backup is destroyed.
                        if tries == 0 {
                            record.backup = None;
                        }
                        KeyBackupResponse::Restore(RestoreResponse {
                            status: Some(RestoreStatus::PinMismatch),
                            token: Some(record.issue_token().to_vec()),
                            tries: Some(tries),
                            ..Default::default()
                        })
                    }
                }
            }
            KeyBackupRequest::Delete(_) => {
                record.backup = None;
                record.expected_token = None;
                KeyBackupResponse::Delete(DeleteResponse {})
            }
        };

        let plaintext = serde_json::to_vec(&response)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let sealed = aead::seal(&server_key, &plaintext, &[])
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(json_response(&EnclaveResponseEnvelope {
            iv: sealed.nonce.to_vec(),
            data: sealed.ciphertext,
            mac: sealed.tag.to_vec(),
        }))
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> TransportResponse {
    TransportResponse {
        status: 200,
        body: serde_json::to_vec(value).unwrap_or_default(),
    }
}

impl AttestationProvider for FakeEnclave {
    async fn attest(&self, enclave: &KeyBackupEnclave) -> KbsResult<RemoteAttestation> {
        let mut state = self.lock();
        if state.failing_attestation.contains(&enclave.name) {
            return Err(KbsError::Attestation(format!(
                "quote from {} did not verify",
                enclave.name
            )));
        }

        let client_key: [u8; 32] = random_bytes()?;
        let server_key: [u8; 32] = random_bytes()?;
        let request_id: [u8; 16] = random_bytes()?;
        state
            .channels
            .insert(request_id.to_vec(), (client_key, server_key));

        Ok(RemoteAttestation {
            client_key: Zeroizing::new(client_key),
            server_key: Zeroizing::new(server_key),
            request_id: request_id.to_vec(),
            enclave_name: enclave.name.clone(),
            auth: AuthCredentials {
                username: "fake-user".to_string(),
                password: "fake-password".to_string(),
            },
            cookies: vec!["session=fake".to_string()],
        })
    }
}

impl Transport for FakeEnclave {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut state = self.lock();

        let (enclave_name, is_token) = match request.method {
            HttpMethod::Get => (request.path.strip_prefix(&token_path("")), true),
            HttpMethod::Put => (request.path.strip_prefix(&backup_path("")), false),
        };
        let Some(enclave_name) = enclave_name.map(str::to_string) else {
            return Ok(TransportResponse {
                status: 404,
                body: Vec::new(),
            });
        };

        if state.failing.contains(&enclave_name) {
            return Err(TransportError::Request(format!(
                "connection to {enclave_name} refused"
            )));
        }
        if let Some(status) = state.status_overrides.get(&enclave_name) {
            return Ok(TransportResponse {
                status: *status,
                body: Vec::new(),
            });
        }

        if is_token {
            Ok(Self::handle_token(&mut state, &enclave_name))
        } else {
            let body = request.body.unwrap_or_default();
            Self::handle_request(&mut state, &enclave_name, &body)
        }
    }
}
