// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Backup Cryptography
//!
//! Pure functions, no I/O:
//!
//! - `kdf` - PIN normalization, Argon2id access/encryption key derivation and
//!   the Argon2i local verification string
//! - `master_key` - the 32-byte master key and its 48-byte escrow envelope
//! - `derived` - named subkeys derived from the master key
//! - `aead` - AES-256-GCM used for the attested channel and derived-key payloads
//!
//! Argon2 derivations are deliberately slow. Async callers must run them on a
//! blocking pool (`tokio::task::spawn_blocking`), never on a reactor thread.

pub mod aead;
pub mod derived;
pub mod kdf;
pub mod master_key;

pub use derived::DerivedKeyName;
pub use kdf::{DerivedMaterial, PinType};
pub use master_key::MasterKey;

use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;

use crate::error::{KbsError, KbsResult};

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `data` keyed with `key`.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> KbsResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| KbsError::assertion("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Fill a fixed-size array from the system CSPRNG.
pub fn random_bytes<const N: usize>() -> KbsResult<[u8; N]> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| KbsError::assertion("system random number generator failed"))?;
    Ok(out)
}
