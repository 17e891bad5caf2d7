//! Keyring: the per-vault session holding the passphrase-derived master key.
//!
//! The key lives only in memory, inside a `ZeroizeOnDrop` wrapper, and is
//! discarded on `lock()` or when the keyring is dropped. A stored verifier
//! (a fixed constant sealed under the key) lets a passphrase be checked
//! without persisting either the passphrase or the key.

use std::sync::Arc;

use mnemo_crypto::kdf::derive_master_key;
use mnemo_crypto::random::generate_salt;
use mnemo_crypto::{aead, KdfParams, MasterKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{AuthFailure, Result, VaultError};
use crate::kv::{KvSnapshot, KvStore, Table, WriteBatch};
use crate::records::{self, EncryptedField, KeyringSettings};

/// Settings-table key holding `KeyringSettings`.
pub const SETTINGS_KEY: &str = "keyring";

const VERIFIER_PLAINTEXT: &[u8] = b"mnemo-vault-verifier-v1";
const VERIFIER_AAD: &[u8] = b"mnemo:verifier:v1";

pub struct Keyring {
    kv: Arc<dyn KvStore>,
    params: KdfParams,
    session: RwLock<Option<MasterKey>>,
    // Serialises unlock attempts on this handle.
    gate: Mutex<()>,
}

impl Keyring {
    /// `params` only applies when the vault has no settings yet; an existing
    /// vault always uses its persisted cost parameters.
    pub fn new(kv: Arc<dyn KvStore>, params: KdfParams) -> Self {
        Self {
            kv,
            params,
            session: RwLock::new(None),
            gate: Mutex::new(()),
        }
    }

    /// Read the keyring settings, generating salt and cost parameters on
    /// first use.
    pub async fn ensure_settings(&self) -> Result<KeyringSettings> {
        let _gate = self.gate.lock().await;
        self.load_or_create_settings().await
    }

    async fn load_or_create_settings(&self) -> Result<KeyringSettings> {
        if let Some(raw) = self.kv.get(Table::Settings, SETTINGS_KEY).await? {
            return records::decode(&raw);
        }
        // Other handles on the vault share the tables; the first commit wins.
        let fresh = KeyringSettings::new(&generate_salt(), self.params);
        let encoded = records::encode(&fresh)?;
        self.kv
            .commit_with(Box::new(move |snapshot: &KvSnapshot| -> Result<WriteBatch> {
                let mut batch = WriteBatch::new();
                if !snapshot.settings.contains_key(SETTINGS_KEY) {
                    batch.put(Table::Settings, SETTINGS_KEY, encoded);
                }
                Ok(batch)
            }))
            .await?;
        let settings = self.stored_settings().await?;
        if settings.salt == fresh.salt {
            info!(
                iterations = settings.iterations,
                memory_kib = settings.memory_kib,
                "keyring settings created"
            );
        }
        Ok(settings)
    }

    async fn stored_settings(&self) -> Result<KeyringSettings> {
        match self.kv.get(Table::Settings, SETTINGS_KEY).await? {
            Some(raw) => records::decode(&raw),
            None => Err(VaultError::NotFound("keyring settings".into())),
        }
    }

    /// Derive the master key and check it against the verifier. The first
    /// successful unlock creates the verifier.
    ///
    /// Any failure leaves the keyring locked.
    pub async fn unlock_with_passphrase(&self, passphrase: &str) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.lock().await;

        let settings = self.load_or_create_settings().await?;
        let salt = settings.salt_bytes()?;
        let params = settings.kdf_params();
        let secret = Zeroizing::new(passphrase.as_bytes().to_vec());
        let key =
            tokio::task::spawn_blocking(move || derive_master_key(&secret, &salt, &params))
                .await??;

        let verifier = match settings.verifier.clone() {
            Some(verifier) => verifier,
            None => self.write_verifier(settings, &key).await?,
        };
        if !verifier_opens(&verifier, &key)? {
            warn!("unlock rejected");
            return Err(VaultError::AuthenticationFailure(AuthFailure::Passphrase));
        }

        *self.session.write().await = Some(key);
        debug!("keyring unlocked");
        Ok(())
    }

    /// Unlock with a master key obtained out of band, e.g. from a shared
    /// bundle. The vault must already have a verifier.
    pub async fn unlock_with_master_key(&self, key: MasterKey) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.lock().await;

        let settings = self.stored_settings().await?;
        let verifier = settings.verifier.as_ref().ok_or_else(|| {
            VaultError::InvalidRecord("vault has no verifier; unlock it with its passphrase first".into())
        })?;
        if !verifier_opens(verifier, &key)? {
            return Err(VaultError::AuthenticationFailure(AuthFailure::MasterKey));
        }

        *self.session.write().await = Some(key);
        debug!("keyring unlocked with master key");
        Ok(())
    }

    /// Store a verifier for `key` unless one already exists, and return the
    /// verifier the vault ends up with.
    async fn write_verifier(&self, mut settings: KeyringSettings, key: &MasterKey) -> Result<EncryptedField> {
        let sealed = aead::seal(key.as_bytes(), VERIFIER_PLAINTEXT, VERIFIER_AAD)?;
        let ours = EncryptedField::from_sealed(&sealed);
        settings.verifier = Some(ours.clone());
        let salt = settings.salt.clone();
        let encoded = records::encode(&settings)?;
        self.kv
            .commit_with(Box::new(move |snapshot: &KvSnapshot| -> Result<WriteBatch> {
                let mut batch = WriteBatch::new();
                let current = snapshot
                    .settings
                    .get(SETTINGS_KEY)
                    .map(|raw| records::decode::<KeyringSettings>(raw))
                    .transpose()?;
                if current.is_some_and(|c| c.verifier.is_none() && c.salt == salt) {
                    batch.put(Table::Settings, SETTINGS_KEY, encoded);
                }
                Ok(batch)
            }))
            .await?;

        let verifier = self.stored_settings().await?.verifier.ok_or_else(|| {
            VaultError::InvalidRecord("keyring settings lost their verifier".into())
        })?;
        if verifier == ours {
            info!("keyring verifier created");
        }
        Ok(verifier)
    }

    /// Drop the master key. The wrapper zeroizes it.
    pub async fn lock(&self) {
        let mut session = self.session.write().await;
        if session.take().is_some() {
            debug!("keyring locked");
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Run `f` with the master key. Fails with `Locked` when no session is open.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MasterKey) -> Result<R>,
    {
        let session = self.session.read().await;
        match session.as_ref() {
            Some(key) => f(key),
            None => Err(VaultError::Locked),
        }
    }

    /// Raw master key bytes for wrapping into a share bundle.
    pub async fn export_master_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.with_key(|key| Ok(Zeroizing::new(key.as_bytes().to_vec())))
            .await
    }
}

/// True when `key` opens the verifier and yields the expected constant.
fn verifier_opens(verifier: &EncryptedField, key: &MasterKey) -> Result<bool> {
    let (iv, data) = verifier.to_parts()?;
    match aead::open(key.as_bytes(), &iv, &data, VERIFIER_AAD) {
        Ok(plain) => Ok(plain.as_slice() == VERIFIER_PLAINTEXT),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn keyring() -> (Arc<MemoryKv>, Keyring) {
        let kv = Arc::new(MemoryKv::new());
        let keyring = Keyring::new(kv.clone(), KdfParams::minimal());
        (kv, keyring)
    }

    #[tokio::test]
    async fn settings_are_generated_once() {
        let (_kv, keyring) = keyring();
        let first = keyring.ensure_settings().await.unwrap();
        let second = keyring.ensure_settings().await.unwrap();
        assert_eq!(first.salt, second.salt);
        assert!(first.verifier.is_none());
    }

    #[tokio::test]
    async fn first_unlock_creates_verifier() {
        let (_kv, keyring) = keyring();
        keyring.unlock_with_passphrase("hunter2").await.unwrap();
        assert!(keyring.is_unlocked().await);
        let settings = keyring.ensure_settings().await.unwrap();
        assert!(settings.verifier.is_some());
    }

    #[tokio::test]
    async fn wrong_passphrase_leaves_keyring_locked() {
        let (kv, keyring) = keyring();
        keyring.unlock_with_passphrase("right").await.unwrap();
        let before = kv.snapshot();

        let err = keyring.unlock_with_passphrase("wrong").await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::AuthenticationFailure(AuthFailure::Passphrase)
        ));
        assert_eq!(err.to_string(), "incorrect passphrase");
        assert!(!keyring.is_unlocked().await);
        // Verifier untouched.
        assert_eq!(kv.snapshot(), before);
    }

    #[tokio::test]
    async fn lock_discards_key() {
        let (_kv, keyring) = keyring();
        keyring.unlock_with_passphrase("pw").await.unwrap();
        keyring.lock().await;
        assert!(!keyring.is_unlocked().await);
        assert!(matches!(
            keyring.with_key(|_| Ok(())).await,
            Err(VaultError::Locked)
        ));
    }

    #[tokio::test]
    async fn persisted_params_win_over_constructor_params() {
        let kv = Arc::new(MemoryKv::new());
        Keyring::new(kv.clone(), KdfParams::minimal())
            .unlock_with_passphrase("pw")
            .await
            .unwrap();

        let reopened = Keyring::new(kv.clone(), KdfParams::default());
        let settings = reopened.ensure_settings().await.unwrap();
        assert_eq!(settings.kdf_params(), KdfParams::minimal());
        reopened.unlock_with_passphrase("pw").await.unwrap();
    }

    #[tokio::test]
    async fn master_key_unlock_checks_verifier() {
        let (kv, keyring) = keyring();
        keyring.unlock_with_passphrase("pw").await.unwrap();
        let raw = keyring.export_master_key().await.unwrap();

        let other = Keyring::new(kv.clone(), KdfParams::minimal());
        other
            .unlock_with_master_key(MasterKey::try_from_slice(&raw).unwrap())
            .await
            .unwrap();
        assert!(other.is_unlocked().await);

        let err = other
            .unlock_with_master_key(MasterKey::from_bytes([7u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::AuthenticationFailure(AuthFailure::MasterKey)
        ));
        assert!(!other.is_unlocked().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_first_unlocks_agree_on_one_verifier() {
        let kv = Arc::new(MemoryKv::new());
        let left = Keyring::new(kv.clone(), KdfParams::minimal());
        let right = Keyring::new(kv.clone(), KdfParams::minimal());

        let (a, b) = tokio::join!(
            left.unlock_with_passphrase("alpha"),
            right.unlock_with_passphrase("bravo")
        );
        // Exactly one passphrase owns the vault; the other is rejected.
        assert!(a.is_ok() != b.is_ok(), "{a:?} {b:?}");

        let winner = if a.is_ok() { "alpha" } else { "bravo" };
        let fresh = Keyring::new(kv, KdfParams::minimal());
        fresh.unlock_with_passphrase(winner).await.unwrap();
    }

    #[tokio::test]
    async fn master_key_unlock_needs_existing_vault() {
        let (_kv, keyring) = keyring();
        let err = keyring
            .unlock_with_master_key(MasterKey::from_bytes([1u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }
}
