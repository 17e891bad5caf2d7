//! Storage quota preflight. Runs before any file of a write is touched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, VaultError};

/// Fixed allowance for the manifest and directory entries.
pub const WRITE_OVERHEAD_BYTES: u64 = 4096;

/// Bytes a write of `payload_len` may need: the temp copy, a possible
/// recovery copy, plus overhead.
pub fn required_bytes(payload_len: usize) -> u64 {
    (payload_len as u64)
        .saturating_mul(2)
        .saturating_add(WRITE_OVERHEAD_BYTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEstimate {
    pub usage: u64,
    /// `None` when the platform cannot say.
    pub quota: Option<u64>,
}

impl QuotaEstimate {
    pub fn available(&self) -> Option<u64> {
        self.quota.map(|q| q.saturating_sub(self.usage))
    }
}

#[async_trait]
pub trait QuotaEstimator: Send + Sync {
    async fn estimate(&self) -> Result<QuotaEstimate>;
}

/// Fail with `QuotaExceeded` when the estimate leaves too little room.
pub async fn check(estimator: &dyn QuotaEstimator, payload_len: usize) -> Result<()> {
    let required = required_bytes(payload_len);
    let estimate = estimator.estimate().await?;
    match estimate.available() {
        Some(available) if available < required => {
            warn!(required, available, "write rejected by quota preflight");
            Err(VaultError::QuotaExceeded {
                required,
                available,
            })
        }
        Some(_) => Ok(()),
        None => {
            debug!(required, "quota unknown; skipping preflight");
            Ok(())
        }
    }
}

/// A constant estimate. Useful for hosts that report quota out of band.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuota {
    estimate: QuotaEstimate,
}

impl FixedQuota {
    pub fn new(quota: u64, usage: u64) -> Self {
        Self {
            estimate: QuotaEstimate {
                usage,
                quota: Some(quota),
            },
        }
    }

    pub fn unknown() -> Self {
        Self {
            estimate: QuotaEstimate {
                usage: 0,
                quota: None,
            },
        }
    }
}

#[async_trait]
impl QuotaEstimator for FixedQuota {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        Ok(self.estimate)
    }
}

/// Usage = bytes under `root`; quota = usage + free filesystem space, capped
/// by an optional configured limit.
#[derive(Debug, Clone)]
pub struct DiskQuota {
    root: PathBuf,
    limit: Option<u64>,
}

impl DiskQuota {
    pub fn new(root: impl Into<PathBuf>, limit: Option<u64>) -> Self {
        Self {
            root: root.into(),
            limit,
        }
    }
}

#[async_trait]
impl QuotaEstimator for DiskQuota {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        let root = self.root.clone();
        let limit = self.limit;
        tokio::task::spawn_blocking(move || {
            let usage = dir_usage(&root)?;
            let from_disk = free_space(&root).map(|free| usage.saturating_add(free));
            let quota = match (from_disk, limit) {
                (Some(disk), Some(limit)) => Some(disk.min(limit)),
                (disk, limit) => disk.or(limit),
            };
            Ok(QuotaEstimate { usage, quota })
        })
        .await?
    }
}

fn dir_usage(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn free_space(dir: &Path) -> Option<u64> {
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        warn!(dir = %dir.display(), "statvfs failed; free space unknown");
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_space(_dir: &Path) -> Option<u64> {
    None
}
