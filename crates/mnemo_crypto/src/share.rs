//! Vault-key sharing
//!
//! A vault owner delegates access by wrapping the master key for a recipient's
//! X25519 agreement key:
//!
//!   EK          = fresh ephemeral X25519 keypair (one per share event)
//!   DH          = X25519(EK_secret, recipient_pub)
//!   wrap_key    = HKDF-SHA256(salt = EK_pub || recipient_pub, ikm = DH, info = "mnemo-share-v1")
//!   wrapped_key = XChaCha20-Poly1305(wrap_key, fresh IV, master_key, aad = EK_pub)
//!
//! The ephemeral secret is consumed by the DH step and never stored, so a later
//! compromise of the sender reveals nothing about past bundles. The recipient
//! re-derives `wrap_key` from their agreement secret and `EK_pub`.
//!
//! Rendezvous identifiers let two parties derive the same channel name from
//! their fingerprints without a directory.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::aead;
use crate::encoding::{b64_decode, b64_decode_array, b64_encode};
use crate::error::CryptoError;
use crate::hash::sha256_hex;
use crate::identity::{Fingerprint, Identity, PublicKeyBytes};
use crate::kdf::hkdf_expand;
use crate::random::IV_LEN;

pub const SHARE_ALGORITHM: &str = "X25519-HKDF-SHA256/XChaCha20-Poly1305";
pub const RENDEZVOUS_TAG: &str = "mnemo-rendezvous-v1";
const SHARE_INFO: &[u8] = b"mnemo-share-v1";

/// Transport-agnostic wrapped-key bundle. Single use: every call to
/// `wrap_vault_key` produces a new ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub wrapped_key: String,
    pub ephemeral_public_key: PublicKeyBytes,
    pub iv: String,
    pub algorithm: String,
}

fn derive_wrapping_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(shared_secret, Some(&salt), SHARE_INFO, &mut key[..])?;
    Ok(key)
}

/// Wrap `master_key` so that only the holder of `recipient`'s agreement secret
/// can recover it.
pub fn wrap_vault_key(
    master_key: &[u8],
    recipient: &PublicKeyBytes,
) -> Result<WrappedKey, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519Public::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::ShareProtocol(
            "recipient key produced a non-contributory shared secret".into(),
        ));
    }

    let ephemeral_bytes = ephemeral_public.to_bytes();
    let wrapping_key = derive_wrapping_key(shared.as_bytes(), &ephemeral_bytes, &recipient.0)?;
    let sealed = aead::seal(&wrapping_key, master_key, &ephemeral_bytes)?;
    debug!(algorithm = SHARE_ALGORITHM, "wrapped vault key");

    Ok(WrappedKey {
        wrapped_key: b64_encode(&sealed.data),
        ephemeral_public_key: PublicKeyBytes(ephemeral_bytes),
        iv: b64_encode(sealed.iv),
        algorithm: SHARE_ALGORITHM.to_string(),
    })
}

/// Recover the master key from a bundle. Fails closed on any mismatch.
pub fn unwrap_vault_key(
    bundle: &WrappedKey,
    recipient: &Identity,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if bundle.algorithm != SHARE_ALGORITHM {
        return Err(CryptoError::ShareProtocol(format!(
            "unsupported algorithm {}",
            bundle.algorithm
        )));
    }
    let iv: [u8; IV_LEN] = b64_decode_array(&bundle.iv)?;
    let wrapped = b64_decode(&bundle.wrapped_key)?;

    let secret = recipient.agreement_secret();
    let ephemeral_public = X25519Public::from(bundle.ephemeral_public_key.0);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::ShareProtocol(
            "ephemeral key produced a non-contributory shared secret".into(),
        ));
    }

    let wrapping_key = derive_wrapping_key(
        shared.as_bytes(),
        &bundle.ephemeral_public_key.0,
        &recipient.public().agreement_key.0,
    )?;
    aead::open(&wrapping_key, &iv, &wrapped, &bundle.ephemeral_public_key.0)
        .map_err(|_| CryptoError::ShareProtocol("wrapped key failed authentication".into()))
}

/// Deterministic discovery identifier for a pair of identities. Symmetric:
/// both parties compute the same value regardless of who initiates.
pub fn calculate_rendezvous_id(a: &Fingerprint, b: &Fingerprint) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let material = format!("{}\n{}\n{}", first, second, RENDEZVOUS_TAG);
    sha256_hex(material.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let bob = Identity::generate().unwrap();
        let key = [0x5Au8; 32];
        let bundle = wrap_vault_key(&key, &bob.public().agreement_key).unwrap();
        assert_eq!(bundle.algorithm, SHARE_ALGORITHM);
        let recovered = unwrap_vault_key(&bundle, &bob).unwrap();
        assert_eq!(recovered.as_slice(), &key);
    }

    #[test]
    fn every_share_uses_a_fresh_ephemeral_key() {
        let bob = Identity::generate().unwrap();
        let a = wrap_vault_key(&[1u8; 32], &bob.public().agreement_key).unwrap();
        let b = wrap_vault_key(&[1u8; 32], &bob.public().agreement_key).unwrap();
        assert_ne!(a.ephemeral_public_key, b.ephemeral_public_key);
        assert_ne!(a.wrapped_key, b.wrapped_key);
    }

    #[test]
    fn wrong_recipient_fails_closed() {
        let bob = Identity::generate().unwrap();
        let eve = Identity::generate().unwrap();
        let bundle = wrap_vault_key(&[9u8; 32], &bob.public().agreement_key).unwrap();
        assert!(matches!(
            unwrap_vault_key(&bundle, &eve),
            Err(CryptoError::ShareProtocol(_))
        ));
    }

    #[test]
    fn tampered_bundle_fails_closed() {
        let bob = Identity::generate().unwrap();
        let mut bundle = wrap_vault_key(&[9u8; 32], &bob.public().agreement_key).unwrap();
        let mut raw = b64_decode(&bundle.wrapped_key).unwrap();
        raw[3] ^= 0xFF;
        bundle.wrapped_key = b64_encode(&raw);
        assert!(unwrap_vault_key(&bundle, &bob).is_err());
    }

    #[test]
    fn swapped_ephemeral_key_fails_closed() {
        let bob = Identity::generate().unwrap();
        let mut first = wrap_vault_key(&[9u8; 32], &bob.public().agreement_key).unwrap();
        let second = wrap_vault_key(&[9u8; 32], &bob.public().agreement_key).unwrap();
        first.ephemeral_public_key = second.ephemeral_public_key;
        assert!(unwrap_vault_key(&first, &bob).is_err());
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let bob = Identity::generate().unwrap();
        let mut bundle = wrap_vault_key(&[9u8; 32], &bob.public().agreement_key).unwrap();
        bundle.algorithm = "RSA-OAEP".into();
        assert!(matches!(
            unwrap_vault_key(&bundle, &bob),
            Err(CryptoError::ShareProtocol(_))
        ));
    }

    #[test]
    fn low_order_recipient_key_rejected() {
        let zero = PublicKeyBytes([0u8; 32]);
        assert!(matches!(
            wrap_vault_key(&[1u8; 32], &zero),
            Err(CryptoError::ShareProtocol(_))
        ));
    }

    #[test]
    fn bundle_json_shape() {
        let bob = Identity::generate().unwrap();
        let bundle = wrap_vault_key(&[1u8; 32], &bob.public().agreement_key).unwrap();
        let json = serde_json::to_value(&bundle).unwrap();
        for field in ["wrappedKey", "ephemeralPublicKey", "iv", "algorithm"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let back: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn rendezvous_differs_per_pair() {
        let a = Fingerprint::of(&PublicKeyBytes([1u8; 32]));
        let b = Fingerprint::of(&PublicKeyBytes([2u8; 32]));
        let c = Fingerprint::of(&PublicKeyBytes([3u8; 32]));
        assert_ne!(calculate_rendezvous_id(&a, &b), calculate_rendezvous_id(&a, &c));
        assert_eq!(calculate_rendezvous_id(&a, &b).len(), 64);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn unwrap_recovers_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..96)) {
            let bob = Identity::generate().unwrap();
            let bundle = wrap_vault_key(&payload, &bob.public().agreement_key).unwrap();
            let recovered = unwrap_vault_key(&bundle, &bob).unwrap();
            prop_assert_eq!(recovered.as_slice(), payload.as_slice());
        }

        #[test]
        fn rendezvous_is_symmetric(x in any::<[u8; 32]>(), y in any::<[u8; 32]>()) {
            let a = Fingerprint::of(&PublicKeyBytes(x));
            let b = Fingerprint::of(&PublicKeyBytes(y));
            prop_assert_eq!(calculate_rendezvous_id(&a, &b), calculate_rendezvous_id(&b, &a));
        }
    }
}
