//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  IV: 24 bytes (random, fresh per seal).  Tag: 16 bytes.
//!
//! Unlike a nonce-prefixed wire format, the IV is returned separately so that
//! persisted records can carry `{iv, data}` pairs.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::{generate_iv, IV_LEN};

/// One ciphertext plus the IV it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    pub data: Vec<u8>,
}

/// Encrypt `plaintext` under a 32-byte key with a fresh random IV.
/// `aad` is additional associated data (authenticated but not encrypted).
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let iv = generate_iv();
    let data = seal_with_iv(key, &iv, plaintext, aad)?;
    Ok(Sealed { iv, data })
}

fn seal_with_iv(
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(XNonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Decrypt and authenticate. Any tag mismatch (wrong key, tampered data or
/// mismatched `aad`) yields `CryptoError::AeadDecrypt`.
pub fn open(
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(iv), Payload { msg: data, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal(&KEY, b"memory capsule", b"ctx").unwrap();
        assert_ne!(sealed.data, b"memory capsule");
        let opened = open(&KEY, &sealed.iv, &sealed.data, b"ctx").unwrap();
        assert_eq!(opened.as_slice(), b"memory capsule");
    }

    #[test]
    fn every_seal_uses_a_fresh_iv() {
        let a = seal(&KEY, b"same", b"").unwrap();
        let b = seal(&KEY, b"same", b"").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = seal(&KEY, b"secret", b"").unwrap();
        let err = open(&[0x43; 32], &sealed.iv, &sealed.data, b"").unwrap_err();
        assert!(matches!(err, CryptoError::AeadDecrypt));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let mut sealed = seal(&KEY, b"secret", b"").unwrap();
        sealed.data[0] ^= 0x01;
        assert!(open(&KEY, &sealed.iv, &sealed.data, b"").is_err());
    }

    #[test]
    fn mismatched_aad_fails_authentication() {
        let sealed = seal(&KEY, b"secret", b"header:a").unwrap();
        assert!(open(&KEY, &sealed.iv, &sealed.data, b"header:b").is_err());
    }
}
