//! Mnemo Vault storage layer.
//!
//! An encrypted, append-only capsule log held in three key-value tables and
//! persisted as a single vault file. Every persisted change goes through a
//! journal (temp file, manifest, verify, rename) so a reader never sees a
//! torn vault.
//!
//! Layout:
//! - `keyring`: passphrase unlock, verifier, in-memory master key
//! - `capsule`: sealed headers and bodies, tombstones, listing
//! - `kv`: table abstraction, memory and file-backed stores
//! - `storage`: backends, journal, preflight, recent vaults, writer actor
//! - `vault`: the facade tying them together

pub mod capsule;
pub mod config;
pub mod error;
pub mod identity_store;
pub mod keyring;
pub mod kv;
pub mod paths;
pub mod records;
pub mod storage;
pub mod vault;

pub use capsule::{CapsuleHeader, CapsuleMetadata, CapsuleStats, HeaderView};
pub use config::{BackendKind, VaultConfig};
pub use error::{AuthFailure, Result, VaultError};
pub use keyring::Keyring;
pub use storage::{open_storage, VaultHandle, VaultStorage};
pub use vault::Vault;
