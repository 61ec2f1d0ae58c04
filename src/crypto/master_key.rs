// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Master key and its escrow envelope.
//!
//! The envelope is a deterministic synthetic-IV construction over
//! HMAC-SHA256:
//!
//! ```text
//! auth_key   = HMAC(encryption_key, "auth")
//! enc_key    = HMAC(encryption_key, "enc")
//! iv         = HMAC(auth_key, master_key)[..16]
//! keystream  = HMAC(enc_key, iv)
//! envelope   = iv || (master_key XOR keystream)
//! ```
//!
//! Identical inputs always give identical envelopes, so the enclave can spot a
//! duplicate submission without learning anything about the key. Decryption
//! recomputes the IV and rejects any mismatch.

use hmac::Mac;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{hmac_sha256, HmacSha256};
use crate::error::{KbsError, KbsResult};

pub const MASTER_KEY_LEN: usize = 32;
pub const ENCRYPTION_KEY_LEN: usize = 32;
pub const SIV_LEN: usize = 16;
pub const ENVELOPE_LEN: usize = SIV_LEN + MASTER_KEY_LEN;

/// The 32-byte root secret. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn generate() -> KbsResult<Self> {
        Ok(Self(super::random_bytes()?))
    }

    pub fn from_slice(bytes: &[u8]) -> KbsResult<Self> {
        let key: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|_| {
            KbsError::assertion(format!(
                "master key must be {MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }
}

impl From<[u8; MASTER_KEY_LEN]> for MasterKey {
    fn from(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

struct SivKeys {
    auth: Zeroizing<[u8; 32]>,
    enc: Zeroizing<[u8; 32]>,
}

fn siv_keys(encryption_key: &[u8]) -> KbsResult<SivKeys> {
    if encryption_key.len() != ENCRYPTION_KEY_LEN {
        return Err(KbsError::assertion(format!(
            "encryption key must be {ENCRYPTION_KEY_LEN} bytes, got {}",
            encryption_key.len()
        )));
    }
    Ok(SivKeys {
        auth: Zeroizing::new(hmac_sha256(encryption_key, b"auth")?),
        enc: Zeroizing::new(hmac_sha256(encryption_key, b"enc")?),
    })
}

fn xor_keystream(
    enc_key: &[u8],
    iv: &[u8],
    data: &[u8; MASTER_KEY_LEN],
) -> KbsResult<[u8; MASTER_KEY_LEN]> {
    let keystream = Zeroizing::new(hmac_sha256(enc_key, iv)?);
    let mut out = [0u8; MASTER_KEY_LEN];
    for (o, (d, k)) in out.iter_mut().zip(data.iter().zip(keystream.iter())) {
        *o = d ^ k;
    }
    Ok(out)
}

/// Wrap the master key into a 48-byte envelope.
pub fn encrypt(master_key: &MasterKey, encryption_key: &[u8]) -> KbsResult<[u8; ENVELOPE_LEN]> {
    let keys = siv_keys(encryption_key)?;

    let tag = hmac_sha256(&keys.auth[..], master_key.as_bytes())?;
    let iv = &tag[..SIV_LEN];
    let ciphertext = xor_keystream(&keys.enc[..], iv, master_key.as_bytes())?;

    let mut envelope = [0u8; ENVELOPE_LEN];
    envelope[..SIV_LEN].copy_from_slice(iv);
    envelope[SIV_LEN..].copy_from_slice(&ciphertext);
    Ok(envelope)
}

/// Unwrap a 48-byte envelope, verifying its synthetic IV.
pub fn decrypt(envelope: &[u8], encryption_key: &[u8]) -> KbsResult<MasterKey> {
    if envelope.len() != ENVELOPE_LEN {
        return Err(KbsError::assertion(format!(
            "master key envelope must be {ENVELOPE_LEN} bytes, got {}",
            envelope.len()
        )));
    }
    let keys = siv_keys(encryption_key)?;

    let (iv, ciphertext) = envelope.split_at(SIV_LEN);
    let ciphertext: &[u8; MASTER_KEY_LEN] = ciphertext
        .try_into()
        .map_err(|_| KbsError::assertion("master key ciphertext has wrong length"))?;
    let candidate = MasterKey(xor_keystream(&keys.enc[..], iv, ciphertext)?);

    let mut mac = HmacSha256::new_from_slice(&keys.auth[..])
        .map_err(|_| KbsError::assertion("invalid SIV authentication key"))?;
    mac.update(candidate.as_bytes());
    mac.verify_truncated_left(iv)
        .map_err(|_| KbsError::assertion("master key envelope failed authentication"))?;

    Ok(candidate)
}
