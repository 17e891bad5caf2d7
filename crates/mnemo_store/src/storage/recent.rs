//! Most-recently-used vault registry, kept beside the vault files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::FsBackend;
use crate::error::Result;

pub const RECENT_VAULTS_FILE: &str = "recent-vaults.json";
const REGISTRY_VERSION: u32 = 1;
pub const DEFAULT_RECENT_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentVault {
    pub id: String,
    pub name: String,
    pub source: String,
    pub last_opened_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    vaults: Vec<RecentVault>,
}

pub struct RecentVaults {
    cap: usize,
}

impl RecentVaults {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1) }
    }

    /// Newest first. A missing or unreadable registry reads as empty.
    pub async fn load(&self, backend: &dyn FsBackend) -> Result<Vec<RecentVault>> {
        let Some(raw) = backend.read(RECENT_VAULTS_FILE).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice::<RegistryFile>(&raw) {
            Ok(file) if file.version == REGISTRY_VERSION => Ok(file.vaults),
            Ok(file) => {
                warn!(version = file.version, "unknown recent-vaults version; starting fresh");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(error = %e, "recent-vaults registry unreadable; starting fresh");
                Ok(Vec::new())
            }
        }
    }

    /// Move `name` to the front, keeping its id if it was already listed.
    pub async fn touch(
        &self,
        backend: &dyn FsBackend,
        name: &str,
        source: &str,
    ) -> Result<RecentVault> {
        let mut vaults = self.load(backend).await?;
        let id = match vaults.iter().position(|v| v.name == name) {
            Some(i) => vaults.remove(i).id,
            None => Uuid::new_v4().to_string(),
        };
        let entry = RecentVault {
            id,
            name: name.to_string(),
            source: source.to_string(),
            last_opened_at: Utc::now(),
        };
        vaults.insert(0, entry.clone());
        vaults.truncate(self.cap);

        let file = RegistryFile {
            version: REGISTRY_VERSION,
            vaults,
        };
        let tmp = format!("{RECENT_VAULTS_FILE}.tmp");
        backend.write(&tmp, &serde_json::to_vec_pretty(&file)?).await?;
        backend.replace(&tmp, RECENT_VAULTS_FILE).await?;
        Ok(entry)
    }
}
