//! Secure random generation backed by the OS RNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the Argon2 salt persisted in keyring settings.
pub const SALT_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length.
pub const IV_LEN: usize = 24;

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Generate a fresh random salt (call once per vault; store alongside settings).
pub fn generate_salt() -> [u8; SALT_LEN] {
    random_bytes::<SALT_LEN>()
}

/// Fresh IV for a single seal operation. Never reuse under the same key.
pub fn generate_iv() -> [u8; IV_LEN] {
    random_bytes::<IV_LEN>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ivs_are_not_repeated() {
        let a = generate_iv();
        let b = generate_iv();
        assert_ne!(a, b);
    }

    #[test]
    fn salt_has_expected_length() {
        assert_eq!(generate_salt().len(), SALT_LEN);
    }
}
