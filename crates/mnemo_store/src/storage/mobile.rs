//! Mobile documents directory. The host bridge only moves text, so every file
//! is stored as base64; each write lands through a persisted temp file.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mnemo_crypto::encoding::{b64_decode, b64_encode};
use tempfile::NamedTempFile;

use super::FsBackend;
use crate::error::{Result, VaultError};

/// Folder created inside the host documents directory.
pub const MOBILE_FOLDER: &str = "MnemoVault";

pub struct MobileFs {
    root: PathBuf,
}

impl MobileFs {
    pub fn open(documents_dir: &Path) -> Result<Self> {
        if !documents_dir.is_dir() {
            return Err(VaultError::UnsupportedBackend(format!(
                "documents directory {} is not available",
                documents_dir.display()
            )));
        }
        let root = documents_dir.join(MOBILE_FOLDER);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, file: &str) -> Result<PathBuf> {
        if file.is_empty() || file.contains(['/', '\\']) || file == "." || file == ".." {
            return Err(VaultError::InvalidVaultName(file.to_string()));
        }
        Ok(self.root.join(file))
    }
}

#[async_trait]
impl FsBackend for MobileFs {
    fn name(&self) -> &'static str {
        "mobile-fs"
    }

    async fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(file)?;
        let text = tokio::task::spawn_blocking(move || match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await??;
        match text {
            Some(text) => b64_decode(text.trim())
                .map(Some)
                .map_err(|_| VaultError::InvalidRecord(format!("{file} is not base64 text"))),
            None => Ok(None),
        }
    }

    async fn write(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(file)?;
        let root = self.root.clone();
        let text = b64_encode(bytes);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&root)?;
            tmp.write_all(text.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (self.path(from)?, self.path(to)?);
        tokio::task::spawn_blocking(move || std::fs::rename(from, to)).await??;
        Ok(())
    }

    async fn remove(&self, file: &str) -> Result<()> {
        let path = self.path(file)?;
        tokio::task::spawn_blocking(move || match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await??;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let names = tokio::task::spawn_blocking(move || -> io::Result<Vec<String>> {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(root)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if let Ok(name) = entry.file_name().into_string() {
                    // Skip in-flight NamedTempFile leftovers.
                    if !name.starts_with(".tmp") {
                        names.push(name);
                    }
                }
            }
            names.sort();
            Ok(names)
        })
        .await??;
        Ok(names)
    }
}
