//! Identity key management
//!
//! Each person owns one `Identity`:
//!   - an Ed25519 signing keypair (authenticates payloads),
//!   - an X25519 key-agreement keypair (receives wrapped vault keys),
//!   - a `Fingerprint`: SHA-256 of the public signing key, rendered as hex
//!     byte groups for out-of-band comparison.
//!
//! Only the public half (`PublicIdentity`) ever leaves the process. Secret
//! halves are zeroized on drop.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::encoding::hex_groups;
use crate::error::CryptoError;
use crate::hash::sha256;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte public key (Ed25519 or X25519), base64url-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s.trim())?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("Public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }
}

impl TryFrom<String> for PublicKeyBytes {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_b64(&value)
    }
}

impl From<PublicKeyBytes> for String {
    fn from(value: PublicKeyBytes) -> Self {
        value.to_b64()
    }
}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_b64())
    }
}

/// Human-verifiable fingerprint of a public signing key.
///
/// Example: `3F:A0:19:...` (32 uppercase hex byte pairs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(signing_key: &PublicKeyBytes) -> Self {
        Self(hex_groups(&sha256(&signing_key.0)))
    }

    /// Parse a fingerprint typed or pasted by a person. Case-insensitive.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let normalized = s.trim().to_ascii_uppercase();
        let groups: Vec<&str> = normalized.split(':').collect();
        let well_formed = groups.len() == 32
            && groups
                .iter()
                .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed {
            return Err(CryptoError::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison, for manual verification flows.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Public identity ───────────────────────────────────────────────────────────

/// The exportable half of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub signing_key: PublicKeyBytes,
    pub agreement_key: PublicKeyBytes,
    pub fingerprint: Fingerprint,
}

impl PublicIdentity {
    /// True when the advertised fingerprint was computed from the advertised
    /// signing key.
    pub fn fingerprint_is_consistent(&self) -> bool {
        Fingerprint::of(&self.signing_key).matches(&self.fingerprint)
    }
}

// ── Identity keypairs ─────────────────────────────────────────────────────────

/// Length of `Identity::to_secret_bytes` output: signing seed || agreement secret.
pub const IDENTITY_SECRET_LEN: usize = 64;

/// Signing + key-agreement keypairs. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_secret: [u8; 32],
    agreement_secret: [u8; 32],
    #[zeroize(skip)]
    public: PublicIdentity,
}

impl Identity {
    pub fn generate() -> Result<Self, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement = StaticSecret::random_from_rng(OsRng);
        Ok(Self::from_parts(signing_key.to_bytes(), agreement.to_bytes()))
    }

    fn from_parts(signing_secret: [u8; 32], agreement_secret: [u8; 32]) -> Self {
        let signing_public =
            PublicKeyBytes(SigningKey::from_bytes(&signing_secret).verifying_key().to_bytes());
        let agreement_public =
            PublicKeyBytes(X25519Public::from(&StaticSecret::from(agreement_secret)).to_bytes());
        let public = PublicIdentity {
            signing_key: signing_public,
            agreement_key: agreement_public,
            fingerprint: Fingerprint::of(&signing_public),
        };
        Self {
            signing_secret,
            agreement_secret,
            public,
        }
    }

    /// Restore an identity from `to_secret_bytes` output.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_SECRET_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "Identity secret must be {} bytes, got {}",
                IDENTITY_SECRET_LEN,
                bytes.len()
            )));
        }
        let mut signing = [0u8; 32];
        let mut agreement = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        agreement.copy_from_slice(&bytes[32..]);
        Ok(Self::from_parts(signing, agreement))
    }

    pub fn to_secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(IDENTITY_SECRET_LEN));
        out.extend_from_slice(&self.signing_secret);
        out.extend_from_slice(&self.agreement_secret);
        out
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.public.fingerprint
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign_data(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.signing_secret)
            .sign(msg)
            .to_bytes()
            .to_vec()
    }

    pub(crate) fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.agreement_secret)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.public.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by `public` over `msg`.
pub fn verify_signature(
    public: &PublicKeyBytes,
    msg: &[u8],
    sig_bytes: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(&public.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
    );
    vk.verify_strict(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}
