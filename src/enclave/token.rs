// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Single-use enclave tokens.
//!
//! The enclave issues a fresh token with every response that still has a
//! backup behind it. The previous token is spent at that point, so the new
//! one replaces it in the `token` collection before the caller sees the
//! result. Tokens are stored per enclave under `{enclave}.{field}` keys.

use std::sync::Arc;

use crate::crypto::kdf::BACKUP_ID_LEN;
use crate::error::{KbsError, KbsResult};
use crate::storage::kv::decode_u32;
use crate::storage::{Collection, KeyValueStore, WriteBatch};

pub const TOKEN_DATA_LEN: usize = 32;

const BACKUP_ID_FIELD: &str = "backupId";
const DATA_FIELD: &str = "data";
const TRIES_FIELD: &str = "tries";
const ENCLAVE_NAME_FIELD: &str = "enclaveName";

/// Nonce and attempt counter for the next request to one enclave.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub backup_id: [u8; BACKUP_ID_LEN],
    pub data: [u8; TOKEN_DATA_LEN],
    pub tries: u32,
    pub enclave_name: String,
}

impl Token {
    pub fn new(backup_id: &[u8], data: &[u8], tries: u32, enclave_name: &str) -> KbsResult<Self> {
        let backup_id: [u8; BACKUP_ID_LEN] = backup_id.try_into().map_err(|_| {
            KbsError::assertion(format!(
                "token backup id must be {BACKUP_ID_LEN} bytes, got {}",
                backup_id.len()
            ))
        })?;
        let data: [u8; TOKEN_DATA_LEN] = data.try_into().map_err(|_| {
            KbsError::assertion(format!(
                "token data must be {TOKEN_DATA_LEN} bytes, got {}",
                data.len()
            ))
        })?;
        Ok(Self {
            backup_id,
            data,
            tries,
            enclave_name: enclave_name.to_string(),
        })
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("enclave_name", &self.enclave_name)
            .field("tries", &self.tries)
            .finish_non_exhaustive()
    }
}

fn field_key(enclave_name: &str, field: &str) -> String {
    format!("{enclave_name}.{field}")
}

/// Persisted per-enclave token cache.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached token for `enclave_name`, if one is stored and well formed.
    pub fn next(&self, enclave_name: &str) -> KbsResult<Option<Token>> {
        let keys = [
            field_key(enclave_name, BACKUP_ID_FIELD),
            field_key(enclave_name, DATA_FIELD),
            field_key(enclave_name, TRIES_FIELD),
            field_key(enclave_name, ENCLAVE_NAME_FIELD),
        ];
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut values = self.store.get_many(Collection::Token, &key_refs)?.into_iter();
        let mut next = || values.next().flatten();

        // A token missing any field was only partly written.
        let (Some(backup_id), Some(data), Some(tries), Some(_)) = (next(), next(), next(), next())
        else {
            return Ok(None);
        };

        let tries = match decode_u32(Collection::Token, &keys[2], &tries) {
            Ok(tries) => tries,
            Err(e) => {
                tracing::warn!(
                    enclave = %enclave_name,
                    error = %e,
                    "Cached token has a malformed try count, ignoring it"
                );
                return Ok(None);
            }
        };

        match Token::new(&backup_id, &data, tries, enclave_name) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!(
                    enclave = %enclave_name,
                    error = %e,
                    "Cached token is malformed, ignoring it"
                );
                Ok(None)
            }
        }
    }

    /// Replace the cached token for `enclave_name`.
    ///
    /// A missing `backup_id` or `tries` reuses the cached value. With nothing
    /// cached to reuse this is an assertion failure.
    pub fn update_next(
        &self,
        enclave_name: &str,
        backup_id: Option<&[u8]>,
        data: &[u8],
        tries: Option<u32>,
    ) -> KbsResult<Token> {
        let previous = match (backup_id, tries) {
            (Some(_), Some(_)) => None,
            _ => self.next(enclave_name)?,
        };

        let backup_id = match backup_id {
            Some(backup_id) => backup_id.to_vec(),
            None => previous
                .as_ref()
                .map(|t| t.backup_id.to_vec())
                .ok_or_else(|| KbsError::assertion("no cached backup id to reuse for token"))?,
        };
        let tries = match tries {
            Some(tries) => tries,
            None => previous
                .as_ref()
                .map(|t| t.tries)
                .ok_or_else(|| KbsError::assertion("no cached try count to reuse for token"))?,
        };

        let token = Token::new(&backup_id, data, tries, enclave_name)?;
        self.record(&token)?;
        Ok(token)
    }

    pub fn record(&self, token: &Token) -> KbsResult<()> {
        let name = &token.enclave_name;
        let mut batch = WriteBatch::new();
        batch
            .set(Collection::Token, &field_key(name, BACKUP_ID_FIELD), token.backup_id)
            .set(Collection::Token, &field_key(name, DATA_FIELD), token.data)
            .set_u32(Collection::Token, &field_key(name, TRIES_FIELD), token.tries)
            .set_string(Collection::Token, &field_key(name, ENCLAVE_NAME_FIELD), name);
        self.store.commit(batch)?;
        Ok(())
    }

    pub fn clear(&self, enclave_name: &str) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        for field in [BACKUP_ID_FIELD, DATA_FIELD, TRIES_FIELD, ENCLAVE_NAME_FIELD] {
            batch.remove(Collection::Token, &field_key(enclave_name, field));
        }
        self.store.commit(batch)?;
        Ok(())
    }

    pub fn clear_all(&self) -> KbsResult<()> {
        let mut batch = WriteBatch::new();
        batch.clear(Collection::Token);
        self.store.commit(batch)?;
        Ok(())
    }
}
