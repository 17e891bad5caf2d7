use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{Result, VaultError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "mnemo";
pub const APP_NAME: &str = "vault";

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "MNEMO_DATA_DIR";

pub const VAULTS_DIR: &str = "vaults";
pub const CONFIG_FILE: &str = "config.json";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        VaultError::UnsupportedBackend("cannot determine data directory".into())
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn vaults_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join(VAULTS_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(CONFIG_FILE))
}
