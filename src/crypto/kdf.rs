// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PIN-based key derivation.
//!
//! Two independent Argon2 derivations:
//!
//! | Use | Variant | t | m (KiB) | p | Salt | Output |
//! |-----|---------|---|---------|---|------|--------|
//! | Enclave access + master key wrapping | Argon2id | 32 | 16384 | 1 | backup id (32 B) | 64 B raw |
//! | Local PIN verification | Argon2i | 64 | 512 | 1 | random (16 B) | PHC string |
//!
//! The enclave derivation must stay deterministic: a reinstalled client
//! re-derives the same encryption key to unwrap the escrowed master key.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KbsError, KbsResult};

/// Length of an enclave-issued backup id.
pub const BACKUP_ID_LEN: usize = 32;

const MATERIAL_ITERATIONS: u32 = 32;
const MATERIAL_MEMORY_KIB: u32 = 16 * 1024;
const MATERIAL_THREADS: u32 = 1;
const MATERIAL_OUTPUT_LEN: usize = 64;

const VERIFICATION_ITERATIONS: u32 = 64;
const VERIFICATION_MEMORY_KIB: u32 = 512;
const VERIFICATION_THREADS: u32 = 1;
const VERIFICATION_OUTPUT_LEN: usize = 32;

/// Length of the random salt embedded in a verification string.
pub const VERIFICATION_SALT_LEN: usize = 16;

/// First code point of each Unicode decimal digit block (`0`..`9` contiguous).
const DIGIT_ZEROS: [u32; 21] = [
    0x0030, 0x0660, 0x06F0, 0x07C0, 0x0966, 0x09E6, 0x0A66, 0x0AE6, 0x0B66, 0x0BE6, 0x0C66,
    0x0CE6, 0x0D66, 0x0DE6, 0x0E50, 0x0ED0, 0x0F20, 0x1040, 0x17E0, 0x1810, 0xFF10,
];

/// Key material derived from `(pin, backup_id)`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedMaterial {
    /// Wraps and unwraps the master key. Never leaves the device.
    pub encryption_key: [u8; 32],
    /// Authenticates backup/restore requests to the enclave.
    pub access_key: [u8; 32],
}

impl std::fmt::Debug for DerivedMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedMaterial(..)")
    }
}

/// Shape of the user's PIN, recorded so the UI can offer the right keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PinType {
    Numeric = 1,
    Alphanumeric = 2,
}

impl PinType {
    pub fn for_pin(pin: &str) -> Self {
        if normalize_pin(pin).chars().all(|c| c.is_ascii_digit()) {
            PinType::Numeric
        } else {
            PinType::Alphanumeric
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PinType::Numeric),
            2 => Some(PinType::Alphanumeric),
            _ => None,
        }
    }
}

fn ascii_digit(c: char) -> Option<char> {
    let cp = c as u32;
    DIGIT_ZEROS
        .iter()
        .find(|&&zero| (zero..zero + 10).contains(&cp))
        .map(|&zero| char::from(b'0' + (cp - zero) as u8))
}

/// Normalize a PIN before any cryptographic use.
///
/// Surrounding whitespace is stripped. A PIN made only of decimal digits from
/// any script is mapped to ASCII digits. The result is NFKD-normalized.
pub fn normalize_pin(pin: &str) -> String {
    let stripped = pin.trim();

    let digits: Option<String> = stripped.chars().map(ascii_digit).collect();
    match digits {
        Some(ascii) => ascii.nfkd().collect(),
        None => stripped.nfkd().collect(),
    }
}

/// Derive `(encryption_key, access_key)` for one enclave backup.
pub fn derive_material(pin: &str, backup_id: &[u8]) -> KbsResult<DerivedMaterial> {
    if backup_id.len() != BACKUP_ID_LEN {
        return Err(KbsError::assertion(format!(
            "backup id must be {BACKUP_ID_LEN} bytes, got {}",
            backup_id.len()
        )));
    }

    let params = Params::new(
        MATERIAL_MEMORY_KIB,
        MATERIAL_ITERATIONS,
        MATERIAL_THREADS,
        Some(MATERIAL_OUTPUT_LEN),
    )
    .map_err(|e| KbsError::assertion(format!("invalid Argon2id params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let pin = Zeroizing::new(normalize_pin(pin));
    let mut raw = Zeroizing::new([0u8; MATERIAL_OUTPUT_LEN]);
    argon2
        .hash_password_into(pin.as_bytes(), backup_id, &mut raw[..])
        .map_err(|e| KbsError::assertion(format!("Argon2id derivation failed: {e}")))?;

    let mut material = DerivedMaterial {
        encryption_key: [0u8; 32],
        access_key: [0u8; 32],
    };
    material.encryption_key.copy_from_slice(&raw[..32]);
    material.access_key.copy_from_slice(&raw[32..]);
    Ok(material)
}

fn verification_hasher() -> KbsResult<Argon2<'static>> {
    let params = Params::new(
        VERIFICATION_MEMORY_KIB,
        VERIFICATION_ITERATIONS,
        VERIFICATION_THREADS,
        Some(VERIFICATION_OUTPUT_LEN),
    )
    .map_err(|e| KbsError::assertion(format!("invalid Argon2i params: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2i, Version::V0x13, params))
}

/// Derive a self-describing verification string under a fresh random salt.
pub fn derive_verification_string(pin: &str) -> KbsResult<String> {
    let salt: [u8; VERIFICATION_SALT_LEN] = super::random_bytes()?;
    derive_verification_string_with_salt(pin, &salt)
}

/// Derive a verification string under a caller-chosen 16-byte salt.
pub fn derive_verification_string_with_salt(pin: &str, salt: &[u8]) -> KbsResult<String> {
    if salt.len() != VERIFICATION_SALT_LEN {
        return Err(KbsError::assertion(format!(
            "verification salt must be {VERIFICATION_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }

    let salt = SaltString::encode_b64(salt)
        .map_err(|e| KbsError::assertion(format!("invalid verification salt: {e}")))?;
    let pin = Zeroizing::new(normalize_pin(pin));
    let hash = verification_hasher()?
        .hash_password(pin.as_bytes(), &salt)
        .map_err(|e| KbsError::assertion(format!("Argon2i derivation failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check a PIN against a stored verification string. Local only.
pub fn verify_pin(pin: &str, encoded_verification_string: &str) -> bool {
    let parsed = match PasswordHash::new(encoded_verification_string) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Stored verification string is malformed");
            return false;
        }
    };

    let pin = Zeroizing::new(normalize_pin(pin));
    // Parameters and salt come from the encoded string itself.
    Argon2::default()
        .verify_password(pin.as_bytes(), &parsed)
        .is_ok()
}
