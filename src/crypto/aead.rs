// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM helpers (ring).
//!
//! Two shapes are used:
//! - `SealedBox` keeps nonce, ciphertext and tag apart, matching the attested
//!   channel's `{iv, data, mac}` framing.
//! - `seal_concatenated` / `open_concatenated` produce `nonce || ciphertext || tag`
//!   for payloads encrypted under derived keys.

use ring::aead::{Aad, LessSafeKey, Nonce, Tag, UnboundKey, AES_256_GCM, NONCE_LEN};

use crate::error::{KbsError, KbsResult};

pub const TAG_LEN: usize = 16;

/// A sealed AES-GCM message with its parts kept separate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

fn less_safe_key(key: &[u8]) -> KbsResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| {
        KbsError::assertion(format!("AES-256-GCM key must be 32 bytes, got {}", key.len()))
    })?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt under a fresh random nonce.
pub fn seal(key: &[u8], plaintext: &[u8], associated_data: &[u8]) -> KbsResult<SealedBox> {
    let key = less_safe_key(key)?;
    let nonce_bytes: [u8; NONCE_LEN] = super::random_bytes()?;

    let mut in_out = plaintext.to_vec();
    let tag: Tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(associated_data),
            &mut in_out,
        )
        .map_err(|_| KbsError::assertion("AES-GCM encryption failed"))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok(SealedBox {
        nonce: nonce_bytes,
        ciphertext: in_out,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate a `SealedBox`.
pub fn open(key: &[u8], sealed: &SealedBox, associated_data: &[u8]) -> KbsResult<Vec<u8>> {
    let key = less_safe_key(key)?;

    let mut in_out = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(&sealed.ciphertext);
    in_out.extend_from_slice(&sealed.tag);

    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            Aad::from(associated_data),
            &mut in_out,
        )
        .map_err(|_| KbsError::assertion("AES-GCM authentication failed"))?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

impl SealedBox {
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>, tag: &[u8]) -> KbsResult<Self> {
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| {
            KbsError::assertion(format!("AES-GCM nonce must be {NONCE_LEN} bytes"))
        })?;
        let tag: [u8; TAG_LEN] = tag
            .try_into()
            .map_err(|_| KbsError::assertion(format!("AES-GCM tag must be {TAG_LEN} bytes")))?;
        Ok(Self {
            nonce,
            ciphertext,
            tag,
        })
    }

    pub fn concatenate(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_concatenated(data: &[u8]) -> KbsResult<Self> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(KbsError::assertion("AES-GCM payload is too short"));
        }
        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Self::from_parts(nonce, ciphertext.to_vec(), tag)
    }
}

/// Encrypt to `nonce || ciphertext || tag`.
pub fn seal_concatenated(key: &[u8], plaintext: &[u8]) -> KbsResult<Vec<u8>> {
    Ok(seal(key, plaintext, &[])?.concatenate())
}

/// Decrypt `nonce || ciphertext || tag`.
pub fn open_concatenated(key: &[u8], data: &[u8]) -> KbsResult<Vec<u8>> {
    open(key, &SealedBox::from_concatenated(data)?, &[])
}
