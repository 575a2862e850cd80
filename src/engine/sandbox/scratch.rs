//! Per-job scratch directories

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

/// A private working directory, removed when dropped
#[derive(Debug)]
pub struct ScratchBox {
    dir: TempDir,
}

impl ScratchBox {
    /// Create a fresh directory under `root` readable only by this user
    pub async fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create scratch root {}", root.display()))?;

        let dir = tempfile::Builder::new()
            .prefix("runbox-")
            .tempdir_in(root)
            .with_context(|| format!("Failed to create scratch dir in {}", root.display()))?;

        fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to restrict scratch dir permissions")?;

        debug!("Created scratch dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file directly inside the scratch dir
    pub async fn write_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            anyhow::bail!("Invalid scratch file name: {:?}", name);
        }
        let path = self.dir.path().join(name);
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove the directory now, reporting failures instead of ignoring them
    pub fn cleanup(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove scratch dir {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_box_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchBox::create(root.path()).await.unwrap();
        let path = scratch.path().to_path_buf();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let file = scratch.write_file("main.py", "print(1)\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(file).unwrap(), "print(1)\n");

        scratch.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_scratch_box_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchBox::create(root.path()).await.unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rejects_nested_file_names() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchBox::create(root.path()).await.unwrap();
        assert!(scratch.write_file("../escape.txt", "x").await.is_err());
        assert!(scratch.write_file("", "x").await.is_err());
    }
}
