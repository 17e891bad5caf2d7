//! Hash utilities
//!
//! - SHA-256 for manifests, fingerprints and rendezvous identifiers
//! - BLAKE3 for content-addressed blob identifiers

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Content identifier for a ciphertext blob.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn blake3_is_hex_of_expected_length() {
        let digest = blake3_hex(b"blob");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, blake3_hex(b"blob"));
        assert_ne!(digest, blake3_hex(b"blob2"));
    }
}
