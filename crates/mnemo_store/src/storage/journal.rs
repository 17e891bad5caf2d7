//! Atomic write protocol for a single vault file.
//!
//! A write stages the new bytes in `<vault>.tmp`, records a manifest in
//! `<vault>.tmp.manifest`, re-reads and verifies the temp file, then promotes
//! it over the live file with one rename. Anything that fails after staging
//! is preserved as `<vault>.recovery-<timestamp>`. The live file is only ever
//! changed by the rename.

use chrono::Utc;
use tracing::{error, info, warn};

use super::manifest::Manifest;
use super::FsBackend;
use crate::error::{Result, VaultError};

pub const TEMP_SUFFIX: &str = ".tmp";
pub const MANIFEST_SUFFIX: &str = ".tmp.manifest";
pub const RECOVERY_MARKER: &str = ".recovery-";

/// What startup repair found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No interrupted write.
    Clean,
    /// A verified temp file was promoted, completing the interrupted write.
    Promoted(Manifest),
    /// The leftover temp file failed verification and was moved aside.
    Quarantined { recovery: String },
    /// Promotion had finished; only the manifest was left behind.
    StaleManifestRemoved,
}

pub struct Journal<'a> {
    backend: &'a dyn FsBackend,
    live: String,
    temp: String,
    manifest: String,
}

impl<'a> Journal<'a> {
    pub fn new(backend: &'a dyn FsBackend, live: &str) -> Self {
        Self {
            backend,
            live: live.to_string(),
            temp: format!("{live}{TEMP_SUFFIX}"),
            manifest: format!("{live}{MANIFEST_SUFFIX}"),
        }
    }

    pub fn temp_name(&self) -> &str {
        &self.temp
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest
    }

    /// Write the temp file and its manifest. Does not touch the live file.
    pub async fn stage(&self, bytes: &[u8]) -> Result<Manifest> {
        let manifest = Manifest::compute(bytes);
        self.backend.write(&self.temp, bytes).await?;
        self.backend
            .write(&self.manifest, &manifest.to_bytes()?)
            .await?;
        Ok(manifest)
    }

    /// Full protocol for bytes that already passed preflight.
    pub async fn commit(&self, bytes: &[u8]) -> Result<Manifest> {
        let manifest = match self.stage(bytes).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.abandon().await;
                return Err(e);
            }
        };

        let staged = match self.backend.read(&self.temp).await {
            Ok(staged) => staged,
            Err(e) => {
                self.abandon().await;
                return Err(e);
            }
        };
        let staged = staged.unwrap_or_default();
        if let Err(actual) = manifest.check(&staged) {
            let recovery = self.quarantine(&staged).await?;
            error!(
                vault = %self.live,
                expected = %manifest.hash,
                actual = %actual,
                recovery = %recovery,
                "staged vault failed verification"
            );
            return Err(VaultError::IntegrityFailure {
                expected: manifest.hash,
                actual,
                recovery,
            });
        }

        if let Err(e) = self.promote().await {
            self.abandon().await;
            return Err(e);
        }
        Ok(manifest)
    }

    /// Rename temp over live, then drop the manifest.
    async fn promote(&self) -> Result<()> {
        self.backend.replace(&self.temp, &self.live).await?;
        self.backend.remove(&self.manifest).await?;
        info!(vault = %self.live, "vault write promoted");
        Ok(())
    }

    /// Copy `bytes` to a fresh recovery file, then clear temp and manifest.
    async fn quarantine(&self, bytes: &[u8]) -> Result<String> {
        let base = format!(
            "{}{}{}",
            self.live,
            RECOVERY_MARKER,
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        );
        let mut recovery = base.clone();
        let mut n = 1;
        while self.backend.exists(&recovery).await? {
            recovery = format!("{base}-{n}");
            n += 1;
        }
        self.backend.write(&recovery, bytes).await?;
        self.backend.remove(&self.temp).await?;
        self.backend.remove(&self.manifest).await?;
        Ok(recovery)
    }

    /// Best-effort quarantine of whatever temp bytes exist after a failed step.
    async fn abandon(&self) {
        let staged = match self.backend.read(&self.temp).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                if let Err(e) = self.backend.remove(&self.manifest).await {
                    warn!(vault = %self.live, error = %e, "could not remove stale manifest");
                }
                return;
            }
            Err(e) => {
                warn!(vault = %self.live, error = %e, "temp file unreadable after failed write");
                return;
            }
        };
        match self.quarantine(&staged).await {
            Ok(recovery) => warn!(vault = %self.live, recovery = %recovery, "failed write preserved"),
            Err(e) => error!(vault = %self.live, error = %e, "could not preserve failed write"),
        }
    }

    /// Startup repair for a write interrupted before cleanup finished.
    pub async fn recover(&self) -> Result<RecoveryOutcome> {
        let temp = self.backend.read(&self.temp).await?;
        let manifest = self.backend.read(&self.manifest).await?;

        match (temp, manifest) {
            (None, None) => Ok(RecoveryOutcome::Clean),
            (None, Some(_)) => {
                self.backend.remove(&self.manifest).await?;
                info!(vault = %self.live, "removed manifest left after promotion");
                Ok(RecoveryOutcome::StaleManifestRemoved)
            }
            (Some(staged), None) => {
                // Interrupted before the manifest landed; nothing vouches for it.
                let recovery = self.quarantine(&staged).await?;
                warn!(vault = %self.live, recovery = %recovery, "unverified temp file moved aside");
                Ok(RecoveryOutcome::Quarantined { recovery })
            }
            (Some(staged), Some(raw)) => {
                let verified = Manifest::from_bytes(&raw)
                    .ok()
                    .filter(|manifest| manifest.check(&staged).is_ok());
                match verified {
                    Some(manifest) => {
                        self.promote().await?;
                        info!(vault = %self.live, "interrupted write completed");
                        Ok(RecoveryOutcome::Promoted(manifest))
                    }
                    None => {
                        let recovery = self.quarantine(&staged).await?;
                        warn!(vault = %self.live, recovery = %recovery, "interrupted write failed verification");
                        Ok(RecoveryOutcome::Quarantined { recovery })
                    }
                }
            }
        }
    }
}

/// True for file names the journal owns rather than live vaults.
pub fn is_journal_file(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX) || name.ends_with(MANIFEST_SUFFIX) || name.contains(RECOVERY_MARKER)
}
