use std::path::{Path, PathBuf};

use mnemo_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::storage::recent::DEFAULT_RECENT_CAP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Sandboxed,
    Mobile,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub backend: BackendKind,
    /// Overrides the platform data directory for the sandboxed backend.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub mobile_documents_dir: Option<PathBuf>,
    /// Cost parameters for newly created vaults.
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default)]
    pub quota_limit_bytes: Option<u64>,
    #[serde(default = "default_recent_cap")]
    pub recent_vaults_cap: usize,
}

fn default_recent_cap() -> usize {
    DEFAULT_RECENT_CAP
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sandboxed,
            data_dir: None,
            mobile_documents_dir: None,
            kdf: KdfParams::default(),
            quota_limit_bytes: None,
            recent_vaults_cap: DEFAULT_RECENT_CAP,
        }
    }
}

impl VaultConfig {
    /// Volatile storage with the cheapest key derivation. For tests.
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            kdf: KdfParams::minimal(),
            ..Self::default()
        }
    }

    /// Sandboxed storage rooted at `dir`.
    pub fn sandboxed(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load_or_default(&dir.path().join("none.json")).unwrap();
        assert_eq!(config, VaultConfig::default());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = VaultConfig {
            backend: BackendKind::Mobile,
            mobile_documents_dir: Some(dir.path().to_path_buf()),
            quota_limit_bytes: Some(1 << 20),
            ..VaultConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(VaultConfig::load_or_default(&path).unwrap(), config);
    }

    #[test]
    fn sparse_json_fills_defaults() {
        let config: VaultConfig = serde_json::from_str(r#"{"backend":"memory"}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.recent_vaults_cap, 10);
        assert_eq!(config.kdf, KdfParams::default());
    }
}
