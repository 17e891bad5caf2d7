use std::fmt;

use mnemo_crypto::CryptoError;
use thiserror::Error;

/// Which authentication check rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The passphrase-derived key did not open the verifier.
    Passphrase,
    /// A supplied master key did not open the verifier.
    MasterKey,
    /// A stored ciphertext failed its authentication tag (tampering or corruption).
    Ciphertext,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Passphrase => f.write_str("incorrect passphrase"),
            AuthFailure::MasterKey => f.write_str("master key does not match this vault"),
            AuthFailure::Ciphertext => f.write_str("stored data failed authentication"),
        }
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{0}")]
    AuthenticationFailure(AuthFailure),

    #[error("integrity check failed (expected {expected}, got {actual}); bytes preserved as {recovery}")]
    IntegrityFailure {
        expected: String,
        actual: String,
        recovery: String,
    },

    #[error("insufficient storage: need {required} bytes, {available} available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend unavailable: {0}")]
    UnsupportedBackend(String),

    #[error("shared key could not be opened")]
    ShareProtocolFailure,

    #[error("vault is locked; unlock with passphrase first")]
    Locked,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid vault name: {0}")]
    InvalidVaultName(String),

    #[error("vault writer has shut down")]
    WriterClosed,

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for VaultError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AeadDecrypt => VaultError::AuthenticationFailure(AuthFailure::Ciphertext),
            CryptoError::ShareProtocol(_) => VaultError::ShareProtocolFailure,
            CryptoError::Base64Decode(e) => VaultError::InvalidRecord(format!("base64: {e}")),
            CryptoError::HexDecode(e) => VaultError::InvalidRecord(format!("hex: {e}")),
            other => VaultError::Crypto(other),
        }
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_passphrase_reads_simply() {
        let err = VaultError::AuthenticationFailure(AuthFailure::Passphrase);
        assert_eq!(err.to_string(), "incorrect passphrase");
    }

    #[test]
    fn aead_failures_become_authentication_failures() {
        let err: VaultError = CryptoError::AeadDecrypt.into();
        assert!(matches!(
            err,
            VaultError::AuthenticationFailure(AuthFailure::Ciphertext)
        ));
        let err: VaultError = CryptoError::ShareProtocol("x".into()).into();
        assert!(matches!(err, VaultError::ShareProtocolFailure));
    }
}
