//! Key derivation functions
//!
//! `derive_master_key`: Argon2id, derives the 32-byte vault master key from a
//!   passphrase and the persisted salt. The parameters are persisted with the
//!   salt so every unlock re-derives with exactly the same cost.
//!
//! `hkdf_expand`: HKDF-SHA256, used for one-time wrapping keys.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const MASTER_KEY_LEN: usize = 32;

// ── Master key ────────────────────────────────────────────────────────────────

/// 32-byte symmetric master key. Lives in memory only; zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

// ── Argon2id ──────────────────────────────────────────────────────────────────

/// Argon2id cost parameters. `iterations` is the Argon2 time cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub iterations: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_kib: 64 * 1024, // 64 MiB
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Lowest cost Argon2 accepts. Only for tests and tooling.
    pub const fn minimal() -> Self {
        Self {
            iterations: 1,
            memory_kib: 8,
            parallelism: 1,
        }
    }

    fn argon2_params(&self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(MASTER_KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))
    }
}

/// Derive the master key from a passphrase + salt.
/// The salt is stored alongside the settings (not secret).
pub fn derive_master_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<MasterKey, CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?);
    let mut output = [0u8; MASTER_KEY_LEN];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(MasterKey(output))
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
