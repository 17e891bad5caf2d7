//! Encoding helpers for persisted records.
//!
//! Binary fields (IVs, ciphertexts, salts) use standard padded base64;
//! digests and fingerprints use hex.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::CryptoError;

pub fn b64_encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(STANDARD.decode(s)?)
}

/// Decode base64 into a fixed-size array, rejecting any other length.
pub fn b64_decode_array<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = b64_decode(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}

/// Uppercase hex pairs joined by `:`, e.g. `3F:A0:19`.
pub fn hex_groups(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_groups_formats_pairs() {
        assert_eq!(hex_groups(&[0x3f, 0xa0, 0x19]), "3F:A0:19");
        assert_eq!(hex_groups(&[]), "");
    }

    #[test]
    fn decode_array_rejects_wrong_length() {
        let encoded = b64_encode([1u8; 10]);
        assert!(b64_decode_array::<24>(&encoded).is_err());
        assert_eq!(b64_decode_array::<10>(&encoded).unwrap(), [1u8; 10]);
    }
}
