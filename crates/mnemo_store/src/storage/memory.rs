//! In-memory backend for tests, with injectable faults.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::journal::MANIFEST_SUFFIX;
use super::preflight::{QuotaEstimate, QuotaEstimator};
use super::FsBackend;
use crate::error::{Result, VaultError};

/// One-shot failures consumed by the next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip a byte of the temp file as soon as its manifest is written.
    CorruptTempAfterManifest,
    /// Fail the next atomic replace.
    FailReplace,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    faults: Vec<Fault>,
    capacity: Option<u64>,
}

/// Clones share the same files, so a test can "reopen" by building new
/// storage over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<State>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `capacity` bytes as the quota.
    pub fn with_capacity(capacity: u64) -> Self {
        let fs = Self::default();
        fs.state.lock().capacity = Some(capacity);
        fs
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(name).cloned()
    }

    /// Write without any fault handling.
    pub fn put_raw(&self, name: &str, bytes: &[u8]) {
        self.state.lock().files.insert(name.to_string(), bytes.to_vec());
    }

    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }
}

impl State {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl FsBackend for MemoryFs {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.file(file))
    }

    async fn write(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.files.insert(file.to_string(), bytes.to_vec());
        if let Some(temp) = file.strip_suffix(".manifest") {
            if file.ends_with(MANIFEST_SUFFIX) && state.take_fault(Fault::CorruptTempAfterManifest) {
                if let Some(staged) = state.files.get_mut(temp) {
                    match staged.first_mut() {
                        Some(b) => *b ^= 0xff,
                        None => staged.push(0),
                    }
                }
            }
        }
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::FailReplace) {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected replace failure",
            )));
        }
        let bytes = state.files.remove(from).ok_or_else(|| {
            VaultError::Io(io::Error::new(io::ErrorKind::NotFound, from.to_string()))
        })?;
        state.files.insert(to.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, file: &str) -> Result<()> {
        self.state.lock().files.remove(file);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.file_names())
    }
}

#[async_trait]
impl QuotaEstimator for MemoryFs {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        let state = self.state.lock();
        Ok(QuotaEstimate {
            usage: state.files.values().map(|f| f.len() as u64).sum(),
            quota: state.capacity,
        })
    }
}
