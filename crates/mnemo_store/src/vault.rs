//! One open vault: storage handle, tables, keyring session and capsule log.
//!
//! Handles opened on the same storage and name share their tables, so their
//! writes never overwrite each other. Each handle keeps its own keyring
//! session. Dropping a `Vault` zeroizes its master key; the writer task
//! stops once the last handle on the vault is gone and queued writes finish.

use std::sync::Arc;

use mnemo_crypto::share::{unwrap_vault_key, wrap_vault_key};
use mnemo_crypto::{Identity, KdfParams, MasterKey, PublicIdentity, WrappedKey};
use tracing::info;
use zeroize::Zeroizing;

use crate::capsule::{CapsuleListing, CapsuleMetadata, CapsuleStats, CapsuleStore};
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::identity_store::IdentityStore;
use crate::keyring::Keyring;
use crate::kv::KvStore;
use crate::storage::{open_storage, VaultExport, VaultHandle, VaultStorage};

pub struct Vault {
    handle: VaultHandle,
    storage: Arc<dyn VaultStorage>,
    keyring: Keyring,
    capsules: CapsuleStore,
    identities: IdentityStore,
}

impl Vault {
    /// Open (or start) the vault called `name`. `kdf` only applies if the
    /// vault has no keyring settings yet.
    pub async fn open(storage: Arc<dyn VaultStorage>, name: &str, kdf: KdfParams) -> Result<Self> {
        let handle = storage.open_vault(name).await?;
        let kv: Arc<dyn KvStore> = storage.open_tables(&handle).await?;
        Ok(Self {
            handle,
            storage,
            keyring: Keyring::new(kv.clone(), kdf),
            capsules: CapsuleStore::new(kv.clone()),
            identities: IdentityStore::new(kv),
        })
    }

    pub async fn open_with_config(config: &VaultConfig, name: &str) -> Result<Self> {
        Self::open(open_storage(config)?, name, config.kdf).await
    }

    /// Like `open`, but a vault with no file yet is `NotFound` and leaves
    /// the recent-vaults registry untouched.
    pub async fn open_existing(
        storage: Arc<dyn VaultStorage>,
        name: &str,
        kdf: KdfParams,
    ) -> Result<Self> {
        if !storage.vault_exists(name).await? {
            return Err(VaultError::NotFound(format!("vault {name}")));
        }
        Self::open(storage, name, kdf).await
    }

    pub async fn open_existing_with_config(config: &VaultConfig, name: &str) -> Result<Self> {
        Self::open_existing(open_storage(config)?, name, config.kdf).await
    }

    /// Store exported bytes as a new vault and open it.
    pub async fn import(
        storage: Arc<dyn VaultStorage>,
        name: &str,
        bytes: &[u8],
        kdf: KdfParams,
    ) -> Result<Self> {
        storage.import_vault(name, bytes).await?;
        Self::open(storage, name, kdf).await
    }

    pub fn handle(&self) -> &VaultHandle {
        &self.handle
    }

    pub fn storage(&self) -> &Arc<dyn VaultStorage> {
        &self.storage
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn capsules(&self) -> &CapsuleStore {
        &self.capsules
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        self.keyring.unlock_with_passphrase(passphrase).await
    }

    pub async fn lock(&self) {
        self.keyring.lock().await
    }

    pub async fn is_unlocked(&self) -> bool {
        self.keyring.is_unlocked().await
    }

    pub async fn create_capsule(&self, content: &[u8], metadata: CapsuleMetadata) -> Result<String> {
        self.capsules
            .create_capsule(&self.keyring, content, metadata)
            .await
    }

    pub async fn list_capsules(&self, limit: usize) -> Result<CapsuleListing> {
        self.capsules.list_capsules(&self.keyring, limit).await
    }

    pub async fn get_capsule_content(&self, id: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.capsules.get_capsule_content(&self.keyring, id).await
    }

    pub async fn delete_capsule(&self, id: &str) -> Result<()> {
        self.capsules.delete_capsule(&self.keyring, id).await
    }

    pub async fn stats(&self) -> Result<CapsuleStats> {
        self.capsules.stats().await
    }

    pub async fn export(&self) -> Result<VaultExport> {
        self.storage.export_vault(&self.handle).await
    }

    pub async fn recovery_files(&self) -> Result<Vec<String>> {
        self.storage.list_recovery_files(&self.handle).await
    }

    /// Wrap this vault's master key for `recipient`. Each call uses a fresh
    /// ephemeral key, so bundles are never reused.
    pub async fn share_with(&self, recipient: &PublicIdentity) -> Result<WrappedKey> {
        if !recipient.fingerprint_is_consistent() {
            return Err(VaultError::ShareProtocolFailure);
        }
        let master = self.keyring.export_master_key().await?;
        let bundle = wrap_vault_key(&master, &recipient.agreement_key)?;
        info!(vault = %self.handle.name, recipient = %recipient.fingerprint, "vault key shared");
        Ok(bundle)
    }

    /// Unlock with a master key received in `bundle`.
    pub async fn open_shared(&self, bundle: &WrappedKey, identity: &Identity) -> Result<()> {
        let raw = unwrap_vault_key(bundle, identity)?;
        let key = MasterKey::try_from_slice(&raw).map_err(|_| VaultError::ShareProtocolFailure)?;
        self.keyring.unlock_with_master_key(key).await?;
        info!(vault = %self.handle.name, "vault opened from shared key");
        Ok(())
    }
}
