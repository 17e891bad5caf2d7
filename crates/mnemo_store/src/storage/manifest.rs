//! Integrity record written next to an in-flight temp file.

use mnemo_crypto::hash::sha256_hex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub size: u64,
    /// SHA-256 hex of the payload.
    pub hash: String,
}

impl Manifest {
    pub fn compute(bytes: &[u8]) -> Self {
        Self {
            version: MANIFEST_VERSION,
            size: bytes.len() as u64,
            hash: sha256_hex(bytes),
        }
    }

    /// `Err(actual)` describes what was found when `bytes` does not match.
    pub fn check(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if bytes.len() as u64 != self.size {
            return Err(format!("size {}", bytes.len()));
        }
        let actual = sha256_hex(bytes);
        if actual != self.hash {
            return Err(actual);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::InvalidRecord(format!("manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(VaultError::InvalidRecord(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}
