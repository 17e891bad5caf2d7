//! mnemo_crypto: Mnemo Vault cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Ciphertexts carry their IV separately so records can store `{iv, data}`.
//!
//! # Module layout
//! - `random`: OS-backed salts, IVs and key material
//! - `encoding`: base64 / hex helpers used by persisted records
//! - `kdf`: Argon2id master-key derivation, HKDF-SHA256 expansion
//! - `aead`: XChaCha20-Poly1305 seal/open with explicit IVs
//! - `hash`: SHA-256 and BLAKE3 digests
//! - `identity`: Ed25519 signing + X25519 agreement keypairs, fingerprints
//! - `share`: master-key wrapping for a recipient, rendezvous identifiers
//! - `error`: unified error type

pub mod aead;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod random;
pub mod share;

pub use error::CryptoError;
pub use identity::{Fingerprint, Identity, PublicIdentity, PublicKeyBytes};
pub use kdf::{KdfParams, MasterKey};
pub use share::WrappedKey;
