//! Long-term identity kept inside the vault, secrets sealed under the master key.

use std::sync::Arc;

use mnemo_crypto::{aead, Identity, PublicIdentity};
use tracing::info;

use crate::error::{Result, VaultError};
use crate::keyring::Keyring;
use crate::kv::{KvStore, Table, WriteBatch};
use crate::records::{self, EncryptedField, SealedIdentity, RECORD_VERSION};

/// Settings-table key holding the `SealedIdentity`.
pub const IDENTITY_KEY: &str = "identity";

const IDENTITY_AAD: &[u8] = b"mnemo:identity:v1";

pub struct IdentityStore {
    kv: Arc<dyn KvStore>,
}

impl IdentityStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Seal and persist `identity`, replacing any previous one.
    pub async fn store_identity(&self, keyring: &Keyring, identity: &Identity) -> Result<()> {
        let secret = identity.to_secret_bytes();
        let sealed = keyring
            .with_key(|key| Ok(aead::seal(key.as_bytes(), &secret, IDENTITY_AAD)?))
            .await?;
        let record = SealedIdentity {
            version: RECORD_VERSION,
            public: identity.public().clone(),
            secret: EncryptedField::from_sealed(&sealed),
        };
        let mut batch = WriteBatch::new();
        batch.put(Table::Settings, IDENTITY_KEY, records::encode(&record)?);
        self.kv.commit(batch).await?;
        info!(fingerprint = %identity.fingerprint(), "identity stored");
        Ok(())
    }

    /// The stored identity with its secrets, or `None` if the vault has none.
    pub async fn load_identity(&self, keyring: &Keyring) -> Result<Option<Identity>> {
        let Some(record) = self.load_record().await? else {
            return Ok(None);
        };
        let (iv, data) = record.secret.to_parts()?;
        let secret = keyring
            .with_key(|key| Ok(aead::open(key.as_bytes(), &iv, &data, IDENTITY_AAD)?))
            .await?;
        let identity = Identity::from_secret_bytes(&secret)?;
        if identity.public() != &record.public {
            return Err(VaultError::InvalidRecord(
                "stored identity does not match its public half".into(),
            ));
        }
        Ok(Some(identity))
    }

    /// Public half only. Readable while locked.
    pub async fn public_identity(&self) -> Result<Option<PublicIdentity>> {
        Ok(self.load_record().await?.map(|record| record.public))
    }

    async fn load_record(&self) -> Result<Option<SealedIdentity>> {
        match self.kv.get(Table::Settings, IDENTITY_KEY).await? {
            Some(raw) => Ok(Some(records::decode(&raw)?)),
            None => Ok(None),
        }
    }
}
