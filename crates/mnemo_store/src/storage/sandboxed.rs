//! Private per-application directory on the local filesystem.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::FsBackend;
use crate::error::{Result, VaultError};

pub struct SandboxedFs {
    root: PathBuf,
}

impl SandboxedFs {
    /// Create `root` if needed and restrict it to the current user.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        restrict_dir_permissions(root);
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files live directly under the root; anything path-like is refused.
    fn path(&self, file: &str) -> Result<PathBuf> {
        if file.is_empty() || file.contains(['/', '\\']) || file == "." || file == ".." {
            return Err(VaultError::InvalidVaultName(file.to_string()));
        }
        Ok(self.root.join(file))
    }

    async fn sync_root(&self) -> Result<()> {
        #[cfg(unix)]
        {
            tokio::fs::File::open(&self.root).await?.sync_all().await?;
        }
        Ok(())
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[async_trait]
impl FsBackend for SandboxedFs {
    fn name(&self) -> &'static str {
        "sandboxed-fs"
    }

    async fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(file)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let mut f = tokio::fs::File::create(self.path(file)?).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.path(from)?, self.path(to)?).await?;
        self.sync_root().await
    }

    async fn remove(&self, file: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(file)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_replace_remove() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxedFs::open(dir.path()).unwrap();
        fs.write("a.tmp", b"data").await.unwrap();
        fs.replace("a.tmp", "a").await.unwrap();
        assert_eq!(fs.read("a").await.unwrap().unwrap(), b"data");
        assert!(fs.read("a.tmp").await.unwrap().is_none());
        assert_eq!(fs.list().await.unwrap(), ["a"]);
        fs.remove("a").await.unwrap();
        fs.remove("a").await.unwrap();
        assert!(fs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_escapes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxedFs::open(dir.path()).unwrap();
        assert!(fs.read("../etc").await.is_err());
        assert!(fs.write("a/b", b"").await.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn root_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vaults");
        SandboxedFs::open(&root).unwrap();
        let mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
