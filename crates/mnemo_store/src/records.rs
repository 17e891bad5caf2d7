//! Persisted record shapes.
//!
//! Every record carries a `version` and passes `validate()` before anything
//! reads its fields. Binary fields are standard base64; content ids are
//! lowercase BLAKE3 hex.

use chrono::{DateTime, Utc};
use mnemo_crypto::aead::Sealed;
use mnemo_crypto::encoding::{b64_decode, b64_decode_array, b64_encode};
use mnemo_crypto::random::{IV_LEN, SALT_LEN};
use mnemo_crypto::{KdfParams, PublicIdentity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub const RECORD_VERSION: u32 = 1;

/// Schema check applied after JSON decoding.
pub trait Record: Serialize + DeserializeOwned {
    fn validate(&self) -> Result<()>;
}

/// Decode and validate a stored record.
pub fn decode<T: Record>(raw: &str) -> Result<T> {
    let record: T =
        serde_json::from_str(raw).map_err(|e| VaultError::InvalidRecord(e.to_string()))?;
    record.validate()?;
    Ok(record)
}

pub fn encode<T: Record>(record: &T) -> Result<String> {
    record.validate()?;
    Ok(serde_json::to_string(record)?)
}

fn check_version(version: u32) -> Result<()> {
    if version != RECORD_VERSION {
        return Err(VaultError::InvalidRecord(format!(
            "unsupported record version {version}"
        )));
    }
    Ok(())
}

fn check_iv(iv: &str) -> Result<[u8; IV_LEN]> {
    b64_decode_array::<IV_LEN>(iv)
        .map_err(|_| VaultError::InvalidRecord(format!("iv must be {IV_LEN} bytes")))
}

fn is_content_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ── Ciphertext fields ───────────────────────────────────────────────────────

/// An AEAD ciphertext with its IV, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
    pub iv: String,
    pub data: String,
}

impl EncryptedField {
    pub fn from_sealed(sealed: &Sealed) -> Self {
        Self {
            iv: b64_encode(sealed.iv),
            data: b64_encode(&sealed.data),
        }
    }

    pub fn to_parts(&self) -> Result<([u8; IV_LEN], Vec<u8>)> {
        let iv = check_iv(&self.iv)?;
        let data = b64_decode(&self.data)?;
        Ok((iv, data))
    }

    fn validate(&self) -> Result<()> {
        check_iv(&self.iv)?;
        b64_decode(&self.data)?;
        Ok(())
    }
}

// ── Keyring settings ────────────────────────────────────────────────────────

/// Per-vault key derivation settings. Created once, never rewritten except to
/// add the verifier on first unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyringSettings {
    pub version: u32,
    pub salt: String,
    pub iterations: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<EncryptedField>,
}

impl KeyringSettings {
    pub fn new(salt: &[u8; SALT_LEN], params: KdfParams) -> Self {
        Self {
            version: RECORD_VERSION,
            salt: b64_encode(salt),
            iterations: params.iterations,
            memory_kib: params.memory_kib,
            parallelism: params.parallelism,
            verifier: None,
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.iterations,
            memory_kib: self.memory_kib,
            parallelism: self.parallelism,
        }
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN]> {
        b64_decode_array::<SALT_LEN>(&self.salt)
            .map_err(|_| VaultError::InvalidRecord(format!("salt must be {SALT_LEN} bytes")))
    }
}

impl Record for KeyringSettings {
    fn validate(&self) -> Result<()> {
        check_version(self.version)?;
        self.salt_bytes()?;
        if self.iterations == 0 || self.parallelism == 0 || self.memory_kib == 0 {
            return Err(VaultError::InvalidRecord(
                "kdf cost parameters must be non-zero".into(),
            ));
        }
        if let Some(verifier) = &self.verifier {
            verifier.validate()?;
        }
        Ok(())
    }
}

// ── Capsule log ─────────────────────────────────────────────────────────────

/// Pointer from a log entry to its encrypted body in the blobs table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub iv: String,
    pub content_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleEntry {
    pub version: u32,
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub header: EncryptedField,
    pub blob: BlobRef,
}

/// Marks an earlier capsule as deleted. The capsule entry itself is never
/// rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub version: u32,
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogRecord {
    Capsule(CapsuleEntry),
    Tombstone(Tombstone),
}

impl LogRecord {
    pub fn seq(&self) -> u64 {
        match self {
            LogRecord::Capsule(c) => c.seq,
            LogRecord::Tombstone(t) => t.seq,
        }
    }
}

impl Record for LogRecord {
    fn validate(&self) -> Result<()> {
        match self {
            LogRecord::Capsule(entry) => {
                check_version(entry.version)?;
                if entry.id.is_empty() {
                    return Err(VaultError::InvalidRecord("capsule id is empty".into()));
                }
                entry.header.validate()?;
                check_iv(&entry.blob.iv)?;
                if !is_content_id(&entry.blob.content_id) {
                    return Err(VaultError::InvalidRecord(format!(
                        "malformed content id {}",
                        entry.blob.content_id
                    )));
                }
                if entry.header.iv == entry.blob.iv {
                    return Err(VaultError::InvalidRecord(
                        "header and body share an iv".into(),
                    ));
                }
            }
            LogRecord::Tombstone(tombstone) => {
                check_version(tombstone.version)?;
                if tombstone.target.is_empty() {
                    return Err(VaultError::InvalidRecord("tombstone has no target".into()));
                }
            }
        }
        Ok(())
    }
}

/// Log table key for a sequence number. Zero-padded so lexical order matches
/// append order.
pub fn log_key(seq: u64) -> String {
    format!("{seq:020}")
}

// ── Identity ────────────────────────────────────────────────────────────────

/// Long-term identity: public half in the clear, secrets sealed under the
/// master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedIdentity {
    pub version: u32,
    pub public: PublicIdentity,
    pub secret: EncryptedField,
}

impl Record for SealedIdentity {
    fn validate(&self) -> Result<()> {
        check_version(self.version)?;
        if !self.public.fingerprint_is_consistent() {
            return Err(VaultError::InvalidRecord(
                "identity fingerprint does not match its signing key".into(),
            ));
        }
        self.secret.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_crypto::random::{generate_iv, generate_salt};

    fn field() -> EncryptedField {
        EncryptedField {
            iv: b64_encode(generate_iv()),
            data: b64_encode(b"ciphertext"),
        }
    }

    fn capsule(seq: u64) -> LogRecord {
        LogRecord::Capsule(CapsuleEntry {
            version: RECORD_VERSION,
            id: format!("capsule-{seq}"),
            seq,
            timestamp: Utc::now(),
            header: field(),
            blob: BlobRef {
                iv: b64_encode(generate_iv()),
                content_id: "a".repeat(64),
            },
        })
    }

    #[test]
    fn log_records_are_tagged_by_kind() {
        let raw = encode(&capsule(1)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["kind"], "capsule");
        assert_eq!(value["blob"]["contentId"], "a".repeat(64));

        let tomb = LogRecord::Tombstone(Tombstone {
            version: RECORD_VERSION,
            id: "t".into(),
            seq: 2,
            timestamp: Utc::now(),
            target: "capsule-1".into(),
        });
        let raw = encode(&tomb).unwrap();
        assert!(raw.contains("\"kind\":\"tombstone\""));
        assert_eq!(decode::<LogRecord>(&raw).unwrap(), tomb);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut record = capsule(1);
        if let LogRecord::Capsule(entry) = &mut record {
            entry.version = 2;
        }
        let raw = serde_json::to_string(&record).unwrap();
        assert!(matches!(
            decode::<LogRecord>(&raw),
            Err(VaultError::InvalidRecord(_))
        ));
    }

    #[test]
    fn short_iv_is_rejected() {
        let mut record = capsule(1);
        if let LogRecord::Capsule(entry) = &mut record {
            entry.header.iv = b64_encode([0u8; 12]);
        }
        assert!(record.validate().is_err());
    }

    #[test]
    fn bad_content_id_is_rejected() {
        let mut record = capsule(1);
        if let LogRecord::Capsule(entry) = &mut record {
            entry.blob.content_id = "ABC".into();
        }
        assert!(record.validate().is_err());
    }

    #[test]
    fn garbage_json_is_invalid_record() {
        assert!(matches!(
            decode::<KeyringSettings>("{not json"),
            Err(VaultError::InvalidRecord(_))
        ));
    }

    #[test]
    fn settings_carry_kdf_params() {
        let params = KdfParams::minimal();
        let settings = KeyringSettings::new(&generate_salt(), params);
        let raw = encode(&settings).unwrap();
        assert!(raw.contains("memoryKib"));
        assert!(!raw.contains("verifier"));
        let back: KeyringSettings = decode(&raw).unwrap();
        assert_eq!(back.kdf_params(), params);
    }

    #[test]
    fn log_keys_sort_in_append_order() {
        assert!(log_key(9) < log_key(10));
        assert!(log_key(99) < log_key(1000));
    }
}
