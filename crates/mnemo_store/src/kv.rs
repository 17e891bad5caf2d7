//! Transactional key-value tables.
//!
//! Three logical tables (`settings`, `log`, `blobs`) hold string values.
//! `WriteBatch` groups puts that must land together: a batch is applied
//! entirely or not at all.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::storage::writer::VaultWriter;
use crate::storage::VaultHandle;

/// Leading bytes of every vault file.
pub const VAULT_MAGIC: &[u8; 8] = b"MNEMOV1\0";
pub const VAULT_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = VAULT_MAGIC.len() + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
    Settings,
    Log,
    Blobs,
}

#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    puts: Vec<(Table, String, String)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: Table, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.puts.push((table, key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }
}

/// Builds a batch from the committed state it will be applied to.
pub type BatchBuilder = Box<dyn FnOnce(&KvSnapshot) -> Result<WriteBatch> + Send>;

/// Builds the batch for one append given its sequence number.
pub type AppendBuilder = Box<dyn FnOnce(u64) -> Result<WriteBatch> + Send>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<String>>;

    /// All entries of a table in key order.
    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>>;

    async fn count(&self, table: Table) -> Result<usize>;

    /// Run `build` against the committed state and apply its batch with no
    /// other commit in between. An empty batch writes nothing.
    async fn commit_with(&self, build: BatchBuilder) -> Result<()>;

    /// Apply every put in `batch` or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.commit_with(Box::new(move |_: &KvSnapshot| -> Result<WriteBatch> {
            Ok(batch)
        }))
        .await
    }

    /// Commit the batch `build` returns for the next free sequence number of
    /// `table` and return that number.
    async fn append(&self, table: Table, build: AppendBuilder) -> Result<u64> {
        let slot = Arc::new(AtomicU64::new(0));
        let taken = slot.clone();
        self.commit_with(Box::new(move |snapshot: &KvSnapshot| -> Result<WriteBatch> {
            let seq = snapshot.next_seq(table);
            taken.store(seq, Ordering::Relaxed);
            build(seq)
        }))
        .await?;
        Ok(slot.load(Ordering::Relaxed))
    }
}

// ── Snapshot ────────────────────────────────────────────────────────────────

/// Full contents of all three tables. This is what a vault file holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSnapshot {
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub log: BTreeMap<String, String>,
    #[serde(default)]
    pub blobs: BTreeMap<String, String>,
}

impl KvSnapshot {
    pub fn table(&self, table: Table) -> &BTreeMap<String, String> {
        match table {
            Table::Settings => &self.settings,
            Table::Log => &self.log,
            Table::Blobs => &self.blobs,
        }
    }

    fn table_mut(&mut self, table: Table) -> &mut BTreeMap<String, String> {
        match table {
            Table::Settings => &mut self.settings,
            Table::Log => &mut self.log,
            Table::Blobs => &mut self.blobs,
        }
    }

    /// One past the highest numeric key in `table`, counting every row
    /// whether or not its value is readable. Starts at 1.
    pub fn next_seq(&self, table: Table) -> u64 {
        self.table(table)
            .keys()
            .filter_map(|key| key.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1)
    }

    pub fn apply(&mut self, batch: &WriteBatch) {
        for (table, key, value) in &batch.puts {
            self.table_mut(*table).insert(key.clone(), value.clone());
        }
    }

    /// Serialise as a vault file: magic, little-endian format version, JSON body.
    pub fn to_vault_file(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(VAULT_MAGIC);
        out.extend_from_slice(&VAULT_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_vault_file(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..VAULT_MAGIC.len()] != VAULT_MAGIC {
            return Err(VaultError::InvalidRecord("not a vault file".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[VAULT_MAGIC.len()..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != VAULT_FORMAT_VERSION {
            return Err(VaultError::InvalidRecord(format!(
                "unsupported vault format version {version}"
            )));
        }
        serde_json::from_slice(&bytes[HEADER_LEN..])
            .map_err(|e| VaultError::InvalidRecord(format!("vault body: {e}")))
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Volatile store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: RwLock<KvSnapshot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: KvSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> KvSnapshot {
        self.inner.read().clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, table: Table, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().table(table).get(key).cloned())
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .read()
            .table(table)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn count(&self, table: Table) -> Result<usize> {
        Ok(self.inner.read().table(table).len())
    }

    async fn commit_with(&self, build: BatchBuilder) -> Result<()> {
        let mut inner = self.inner.write();
        let batch = build(&*inner)?;
        inner.apply(&batch);
        Ok(())
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

/// Tables persisted as one vault file. Each commit rewrites the file through
/// the single-writer journal; readers only ever see committed state.
///
/// Storage hands out one `FileKv` per open vault name, so every handle on a
/// vault commits against the same state.
pub struct FileKv {
    handle: VaultHandle,
    writer: VaultWriter,
    state: tokio::sync::RwLock<KvSnapshot>,
}

impl FileKv {
    pub async fn open(writer: VaultWriter, handle: VaultHandle) -> Result<Self> {
        let snapshot = match writer.read(&handle).await? {
            Some(bytes) => KvSnapshot::from_vault_file(&bytes)?,
            None => KvSnapshot::default(),
        };
        debug!(
            vault = %handle.name,
            capsules = snapshot.log.len(),
            blobs = snapshot.blobs.len(),
            "vault tables loaded"
        );
        Ok(Self {
            handle,
            writer,
            state: tokio::sync::RwLock::new(snapshot),
        })
    }

    pub fn handle(&self) -> &VaultHandle {
        &self.handle
    }

    pub async fn snapshot(&self) -> KvSnapshot {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, table: Table, key: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.table(table).get(key).cloned())
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>> {
        Ok(self
            .state
            .read()
            .await
            .table(table)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn count(&self, table: Table) -> Result<usize> {
        Ok(self.state.read().await.table(table).len())
    }

    async fn commit_with(&self, build: BatchBuilder) -> Result<()> {
        // Held across the write so no reader observes uncommitted state.
        let mut state = self.state.write().await;
        let batch = build(&*state)?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = state.clone();
        next.apply(&batch);
        let bytes = next.to_vault_file()?;
        self.writer.write(&self.handle, bytes).await?;
        *state = next;
        Ok(())
    }
}
