//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tablet_sync_core::fs::{FileSystem, FsError, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Filesystem rooted at a local directory
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> FsError {
    let shown = path.display().to_string();
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(shown),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(shown),
        _ => FsError::Io(format!("{shown}: {e}")),
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        fs::read(&full_path).await.map_err(|e| io_error(&full_path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        create_parent(&full_path).await?;

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| io_error(&full_path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| io_error(&full_path, e))?;
        // Flushed to disk before any rename makes it visible
        file.sync_all().await.map_err(|e| io_error(&full_path, e))
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        create_parent(&full_path).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .map_err(|e| io_error(&full_path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| io_error(&full_path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from);
        let to_path = self.full_path(to);
        create_parent(&to_path).await?;
        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| io_error(&from_path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(&full_path, e))?;

        let removed = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| io_error(&full_path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| io_error(&full_path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| io_error(&full_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_native_fs_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path());

        fs.write("a/b/c.txt", b"hello").await.unwrap();
        assert_eq!(fs.read("a/b/c.txt").await.unwrap(), b"hello");
        assert!(fs.exists("a/b").await.unwrap());

        fs.rename("a/b/c.txt", "d/e.txt").await.unwrap();
        assert!(!fs.exists("a/b/c.txt").await.unwrap());
        assert_eq!(fs.read("d/e.txt").await.unwrap(), b"hello");

        fs.delete("d/e.txt").await.unwrap();
        fs.delete("d").await.unwrap();
        assert!(!fs.exists("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_native_fs_error_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path());

        assert!(matches!(fs.read("missing").await, Err(FsError::NotFound(_))));

        fs.create_new("lock", b"1").await.unwrap();
        assert!(matches!(
            fs.create_new("lock", b"2").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert_eq!(fs.read("lock").await.unwrap(), b"1");
    }
}
