//! Single-writer actor for vault storage.
//!
//! All reads and writes for an open vault go through one task, so two
//! writes can never race to promote their temp files.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::manifest::Manifest;
use super::preflight::QuotaEstimator;
use super::{persist, FsBackend, VaultHandle};
use crate::error::{Result, VaultError};

const QUEUE_DEPTH: usize = 32;

enum Command {
    Read {
        handle: VaultHandle,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Write {
        handle: VaultHandle,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Manifest>>,
    },
}

#[derive(Clone)]
pub struct VaultWriter {
    tx: mpsc::Sender<Command>,
}

impl VaultWriter {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(backend: Arc<dyn FsBackend>, quota: Arc<dyn QuotaEstimator>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run(backend, quota, rx));
        Self { tx }
    }

    pub async fn read(&self, handle: &VaultHandle) -> Result<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Read {
                handle: handle.clone(),
                reply,
            })
            .await
            .map_err(|_| VaultError::WriterClosed)?;
        rx.await.map_err(|_| VaultError::WriterClosed)?
    }

    pub async fn write(&self, handle: &VaultHandle, bytes: Vec<u8>) -> Result<Manifest> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Write {
                handle: handle.clone(),
                bytes,
                reply,
            })
            .await
            .map_err(|_| VaultError::WriterClosed)?;
        rx.await.map_err(|_| VaultError::WriterClosed)?
    }
}

async fn run(
    backend: Arc<dyn FsBackend>,
    quota: Arc<dyn QuotaEstimator>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Read { handle, reply } => {
                let _ = reply.send(backend.read(&handle.file_name()).await);
            }
            Command::Write {
                handle,
                bytes,
                reply,
            } => {
                let result = persist(
                    backend.as_ref(),
                    quota.as_ref(),
                    &handle.file_name(),
                    &bytes,
                )
                .await;
                if let Ok(manifest) = &result {
                    debug!(vault = %handle.name, size = manifest.size, "vault persisted");
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("vault writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryFs;
    use crate::storage::{JournaledStorage, VaultStorage};

    #[tokio::test]
    async fn concurrent_writes_are_serialised() {
        let fs = MemoryFs::new();
        let storage = JournaledStorage::new(Arc::new(fs.clone()), Arc::new(fs.clone()), 10);
        let handle = storage.open_vault("v").await.unwrap();
        let writer = VaultWriter::spawn(Arc::new(fs.clone()), Arc::new(fs.clone()));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let writer = writer.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                writer.write(&handle, vec![i; 16]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let live = writer.read(&handle).await.unwrap().unwrap();
        assert_eq!(live.len(), 16);
        assert!(live.iter().all(|b| *b == live[0]));
        assert!(fs.file("v.vault.tmp").is_none());
        assert!(fs.file("v.vault.tmp.manifest").is_none());
    }
}
