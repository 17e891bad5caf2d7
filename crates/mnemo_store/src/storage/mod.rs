//! Vault persistence.
//!
//! `VaultStorage` is the contract the rest of the crate uses. Every backend
//! supplies raw file operations through `FsBackend`; `JournaledStorage` adds
//! the atomic write protocol, quota preflight and the recent-vaults registry
//! on top, so the protocol exists once for all backends. It also keeps one
//! set of tables per open vault name, shared by every handle on that vault.

pub mod journal;
pub mod manifest;
pub mod memory;
pub mod mobile;
pub mod preflight;
pub mod recent;
pub mod sandboxed;
pub mod writer;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{BackendKind, VaultConfig};
use crate::error::{Result, VaultError};
use crate::kv::{FileKv, KvSnapshot};
use crate::paths;
use journal::{Journal, RecoveryOutcome, RECOVERY_MARKER};
use manifest::Manifest;
use memory::MemoryFs;
use mobile::MobileFs;
use preflight::{DiskQuota, QuotaEstimator};
use recent::{RecentVault, RecentVaults};
use sandboxed::SandboxedFs;
use writer::VaultWriter;

pub const VAULT_EXTENSION: &str = ".vault";
const MAX_VAULT_NAME_LEN: usize = 64;

/// Raw file operations within one flat directory.
#[async_trait]
pub trait FsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the file does not exist.
    async fn read(&self, file: &str) -> Result<Option<Vec<u8>>>;

    /// Durable but not necessarily atomic.
    async fn write(&self, file: &str, bytes: &[u8]) -> Result<()>;

    /// Atomically move `from` over `to`.
    async fn replace(&self, from: &str, to: &str) -> Result<()>;

    /// Removing a missing file succeeds.
    async fn remove(&self, file: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, file: &str) -> Result<bool> {
        Ok(self.read(file).await?.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHandle {
    pub id: String,
    pub name: String,
    pub source: String,
}

impl VaultHandle {
    pub fn file_name(&self) -> String {
        vault_file_name(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct VaultExport {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub manifest: Manifest,
}

#[async_trait]
pub trait VaultStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Repair any interrupted write, record the vault as recently used and
    /// return its handle. The vault file itself may not exist yet.
    async fn open_vault(&self, name: &str) -> Result<VaultHandle>;

    /// True when the vault file for `name` exists. Touches nothing.
    async fn vault_exists(&self, name: &str) -> Result<bool>;

    /// The tables of an opened vault. Every call for the same vault name
    /// returns the same `FileKv` while any caller still holds it, so all
    /// handles on a vault share one commit lock and one writer.
    async fn open_tables(&self, handle: &VaultHandle) -> Result<Arc<FileKv>>;

    async fn read_vault(&self, handle: &VaultHandle) -> Result<Option<Vec<u8>>>;

    /// Replace the vault contents through the atomic write protocol. This
    /// bypasses the tables of an open vault, which will not see the change.
    async fn write_vault(&self, handle: &VaultHandle, bytes: &[u8]) -> Result<Manifest>;

    async fn export_vault(&self, handle: &VaultHandle) -> Result<VaultExport>;

    /// Create a new vault from exported bytes.
    async fn import_vault(&self, name: &str, bytes: &[u8]) -> Result<VaultHandle>;

    async fn list_recent_vaults(&self) -> Result<Vec<RecentVault>>;

    /// Recovery snapshots kept for this vault, oldest first.
    async fn list_recovery_files(&self, handle: &VaultHandle) -> Result<Vec<String>>;
}

/// Quota preflight, then the journaled commit of `bytes` over `file`.
pub(crate) async fn persist(
    backend: &dyn FsBackend,
    quota: &dyn QuotaEstimator,
    file: &str,
    bytes: &[u8],
) -> Result<Manifest> {
    preflight::check(quota, bytes.len()).await?;
    Journal::new(backend, file).commit(bytes).await
}

pub fn vault_file_name(name: &str) -> String {
    format!("{name}{VAULT_EXTENSION}")
}

/// Names are 1-64 characters of `[A-Za-z0-9._-]` starting with a letter or digit.
pub fn validate_vault_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if name.is_empty() || name.len() > MAX_VAULT_NAME_LEN || !valid_chars || !starts_ok {
        return Err(VaultError::InvalidVaultName(name.to_string()));
    }
    Ok(())
}

// ── Journaled storage ───────────────────────────────────────────────────────

pub struct JournaledStorage {
    backend: Arc<dyn FsBackend>,
    quota: Arc<dyn QuotaEstimator>,
    recent: RecentVaults,
    tables: Mutex<HashMap<String, Weak<FileKv>>>,
}

impl JournaledStorage {
    pub fn new(
        backend: Arc<dyn FsBackend>,
        quota: Arc<dyn QuotaEstimator>,
        recent_cap: usize,
    ) -> Self {
        Self {
            backend,
            quota,
            recent: RecentVaults::new(recent_cap),
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn live_tables(&self, name: &str) -> Option<Arc<FileKv>> {
        let mut tables = self.tables.lock();
        tables.retain(|_, kv| kv.strong_count() > 0);
        tables.get(name).and_then(Weak::upgrade)
    }

    fn journal(&self, file: &str) -> Journal<'_> {
        Journal::new(self.backend.as_ref(), file)
    }
}

#[async_trait]
impl VaultStorage for JournaledStorage {
    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn open_vault(&self, name: &str) -> Result<VaultHandle> {
        validate_vault_name(name)?;
        match self.journal(&vault_file_name(name)).recover().await? {
            RecoveryOutcome::Clean => {}
            outcome => info!(vault = %name, ?outcome, "startup repair ran"),
        }
        let entry = self
            .recent
            .touch(self.backend.as_ref(), name, self.backend.name())
            .await?;
        debug!(vault = %name, id = %entry.id, backend = self.backend.name(), "vault opened");
        Ok(VaultHandle {
            id: entry.id,
            name: entry.name,
            source: entry.source,
        })
    }

    async fn vault_exists(&self, name: &str) -> Result<bool> {
        validate_vault_name(name)?;
        self.backend.exists(&vault_file_name(name)).await
    }

    async fn open_tables(&self, handle: &VaultHandle) -> Result<Arc<FileKv>> {
        if let Some(kv) = self.live_tables(&handle.name) {
            return Ok(kv);
        }
        let writer = VaultWriter::spawn(self.backend.clone(), self.quota.clone());
        let loaded = Arc::new(FileKv::open(writer, handle.clone()).await?);

        // Another opener may have loaded the same vault meanwhile; keep theirs.
        let mut tables = self.tables.lock();
        if let Some(kv) = tables.get(&handle.name).and_then(Weak::upgrade) {
            return Ok(kv);
        }
        tables.insert(handle.name.clone(), Arc::downgrade(&loaded));
        Ok(loaded)
    }

    async fn read_vault(&self, handle: &VaultHandle) -> Result<Option<Vec<u8>>> {
        self.backend.read(&handle.file_name()).await
    }

    async fn write_vault(&self, handle: &VaultHandle, bytes: &[u8]) -> Result<Manifest> {
        persist(
            self.backend.as_ref(),
            self.quota.as_ref(),
            &handle.file_name(),
            bytes,
        )
        .await
    }

    async fn export_vault(&self, handle: &VaultHandle) -> Result<VaultExport> {
        let bytes = self
            .read_vault(handle)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("vault {}", handle.name)))?;
        Ok(VaultExport {
            file_name: handle.file_name(),
            manifest: Manifest::compute(&bytes),
            bytes,
        })
    }

    async fn import_vault(&self, name: &str, bytes: &[u8]) -> Result<VaultHandle> {
        validate_vault_name(name)?;
        KvSnapshot::from_vault_file(bytes)?;
        let file = vault_file_name(name);
        if self.backend.exists(&file).await? || self.live_tables(name).is_some() {
            return Err(VaultError::InvalidVaultName(format!(
                "{name} already exists"
            )));
        }
        persist(self.backend.as_ref(), self.quota.as_ref(), &file, bytes).await?;
        info!(vault = %name, bytes = bytes.len(), "vault imported");
        self.open_vault(name).await
    }

    async fn list_recent_vaults(&self) -> Result<Vec<RecentVault>> {
        self.recent.load(self.backend.as_ref()).await
    }

    async fn list_recovery_files(&self, handle: &VaultHandle) -> Result<Vec<String>> {
        let prefix = format!("{}{RECOVERY_MARKER}", handle.file_name());
        let mut files: Vec<String> = self
            .backend
            .list()
            .await?
            .into_iter()
            .filter(|f| f.starts_with(&prefix))
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Build the storage adapter the configuration selects.
pub fn open_storage(config: &VaultConfig) -> Result<Arc<dyn VaultStorage>> {
    let (backend, quota): (Arc<dyn FsBackend>, Arc<dyn QuotaEstimator>) = match config.backend {
        BackendKind::Sandboxed => {
            let root = match &config.data_dir {
                Some(dir) => dir.join(paths::VAULTS_DIR),
                None => paths::vaults_dir()?,
            };
            let fs = SandboxedFs::open(&root)?;
            (
                Arc::new(fs),
                Arc::new(DiskQuota::new(root, config.quota_limit_bytes)),
            )
        }
        BackendKind::Mobile => {
            let docs = config.mobile_documents_dir.as_ref().ok_or_else(|| {
                VaultError::UnsupportedBackend(
                    "mobile backend needs mobileDocumentsDir".into(),
                )
            })?;
            let fs = MobileFs::open(docs)?;
            let quota = DiskQuota::new(fs.root(), config.quota_limit_bytes);
            (Arc::new(fs), Arc::new(quota))
        }
        BackendKind::Memory => {
            let fs = match config.quota_limit_bytes {
                Some(limit) => MemoryFs::with_capacity(limit),
                None => MemoryFs::new(),
            };
            (Arc::new(fs.clone()), Arc::new(fs))
        }
    };
    info!(backend = backend.name(), "storage ready");
    Ok(Arc::new(JournaledStorage::new(
        backend,
        quota,
        config.recent_vaults_cap,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::preflight::FixedQuota;

    fn storage(fs: &MemoryFs) -> JournaledStorage {
        JournaledStorage::new(Arc::new(fs.clone()), Arc::new(fs.clone()), 10)
    }

    fn vault_bytes() -> Vec<u8> {
        KvSnapshot::default().to_vault_file().unwrap()
    }

    #[test]
    fn vault_names_are_checked() {
        for ok in ["personal", "work-2024", "a.b_c"] {
            validate_vault_name(ok).unwrap();
        }
        let long = "x".repeat(65);
        for bad in ["", ".hidden", "../up", "a/b", "sp ace", long.as_str()] {
            assert!(validate_vault_name(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn reopening_keeps_vault_id() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        let first = storage.open_vault("v").await.unwrap();
        let second = storage.open_vault("v").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.source, "memory");
    }

    #[tokio::test]
    async fn handles_on_one_vault_share_tables() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        let handle = storage.open_vault("v").await.unwrap();
        let first = storage.open_tables(&handle).await.unwrap();
        let second = storage.open_tables(&handle).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = storage.open_vault("w").await.unwrap();
        let third = storage.open_tables(&other).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        let released = Arc::downgrade(&first);
        drop((first, second));
        assert!(released.upgrade().is_none());
        storage.open_tables(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn existence_check_leaves_registry_alone() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        assert!(!storage.vault_exists("ghost").await.unwrap());
        assert!(storage.list_recent_vaults().await.unwrap().is_empty());
        assert!(fs.file_names().is_empty());

        let handle = storage.open_vault("v").await.unwrap();
        storage.write_vault(&handle, &vault_bytes()).await.unwrap();
        assert!(storage.vault_exists("v").await.unwrap());
    }

    #[tokio::test]
    async fn quota_failure_touches_nothing() {
        let fs = MemoryFs::new();
        let storage = JournaledStorage::new(
            Arc::new(fs.clone()),
            Arc::new(FixedQuota::new(100, 0)),
            10,
        );
        let handle = storage.open_vault("v").await.unwrap();
        let before = fs.file_names();
        let err = storage.write_vault(&handle, &[0u8; 64]).await.unwrap_err();
        assert!(matches!(err, VaultError::QuotaExceeded { .. }));
        assert_eq!(fs.file_names(), before);
    }

    #[tokio::test]
    async fn export_then_import_under_new_name() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        let handle = storage.open_vault("src").await.unwrap();
        storage.write_vault(&handle, &vault_bytes()).await.unwrap();

        let export = storage.export_vault(&handle).await.unwrap();
        assert_eq!(export.file_name, "src.vault");
        assert!(export.manifest.check(&export.bytes).is_ok());

        let copy = storage.import_vault("copy", &export.bytes).await.unwrap();
        assert_ne!(copy.id, handle.id);
        assert_eq!(
            storage.read_vault(&copy).await.unwrap().unwrap(),
            export.bytes
        );
        assert!(matches!(
            storage.import_vault("copy", &export.bytes).await,
            Err(VaultError::InvalidVaultName(_))
        ));
    }

    #[tokio::test]
    async fn import_rejects_foreign_bytes() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        assert!(matches!(
            storage.import_vault("x", b"plain text").await,
            Err(VaultError::InvalidRecord(_))
        ));
        assert!(fs.file("x.vault").is_none());
    }

    #[tokio::test]
    async fn export_of_empty_vault_is_not_found() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        let handle = storage.open_vault("empty").await.unwrap();
        assert!(matches!(
            storage.export_vault(&handle).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recovery_files_are_listed_per_vault() {
        let fs = MemoryFs::new();
        let storage = storage(&fs);
        let handle = storage.open_vault("v").await.unwrap();
        fs.put_raw("v.vault.recovery-20240101T000000000", b"a");
        fs.put_raw("other.vault.recovery-20240101T000000000", b"b");
        assert_eq!(
            storage.list_recovery_files(&handle).await.unwrap(),
            ["v.vault.recovery-20240101T000000000"]
        );
    }

    #[test]
    fn mobile_backend_needs_documents_dir() {
        let config = VaultConfig {
            backend: BackendKind::Mobile,
            ..VaultConfig::default()
        };
        assert!(matches!(
            open_storage(&config),
            Err(VaultError::UnsupportedBackend(_))
        ));
    }
}
