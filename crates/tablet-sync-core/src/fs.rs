//! FileSystem trait abstraction for local writes.
//!
//! The session store and the download engine only touch local storage through
//! this trait.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in tablet-sync) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Platform-independent filesystem abstraction.
///
/// Paths are `/`-separated and relative to the implementation's root.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Create a file that must not exist yet.
    ///
    /// Fails with `AlreadyExists` when it does. Used for lock files.
    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Atomically replace `to` with `from`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Join `/`-separated path segments, skipping empty ones.
pub fn join(base: &str, rest: &str) -> String {
    match (base.trim_matches('/'), rest.trim_matches('/')) {
        ("", rest) => rest.to_string(),
        (base, "") => base.to_string(),
        (base, rest) => format!("{base}/{rest}"),
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    /// All file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = files.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        dirs.contains(&Self::normalize_path(path))
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.is_dir(&path) {
            return Err(FsError::IsDirectory(path));
        }

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        let normalized = Self::normalize_path(path);
        if self.exists(&normalized).await? {
            return Err(FsError::AlreadyExists(normalized));
        }
        self.write(&normalized, content).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);

        if let Some(parent) = Self::parent_path(&to) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let content = files.remove(&from).ok_or_else(|| FsError::NotFound(from))?;
        files.insert(to, content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            if files.remove(&path).is_some() {
                return Ok(());
            }
        }

        // Only empty directories can go
        let prefix = format!("{}/", path);
        let has_files = {
            let files = self.files.read().unwrap_or_else(|e| e.into_inner());
            files.keys().any(|f| f.starts_with(&prefix))
        };
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        if has_files || dirs.iter().any(|d| d.starts_with(&prefix)) {
            return Err(FsError::Io(format!("Directory not empty: {}", path)));
        }
        dirs.remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        {
            let files = self.files.read().unwrap_or_else(|e| e.into_inner());
            if files.contains_key(&path) {
                return Err(FsError::NotDirectory(path));
            }
        }

        // Create parent first
        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        dirs.insert(path);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between the store and the engine in tests
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).create_new(path, content).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
