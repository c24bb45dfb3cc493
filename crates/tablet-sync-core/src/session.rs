//! Session: named sync state persisted across runs.
//!
//! A session holds the current and previous snapshots, the bookmark set of the
//! current snapshot, and the download marks that make incremental downloads
//! idempotent. Sessions are stored as `<name>.session` JSON files tagged with a
//! format name and version so incompatible files are rejected rather than
//! misread.

use crate::diff::{diff, ChangeSet};
use crate::fs::{self, FileSystem, FsError};
use crate::node::{NodeId, Revision};
use crate::snapshot::Snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Format tag written into every session file.
pub const SESSION_FORMAT: &str = "tablet-sync-session";
/// Current session file version.
pub const SESSION_VERSION: u32 = 1;

const SESSION_EXT: &str = "session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session name: {0:?}")]
    InvalidName(String),

    #[error("Session {name} is unreadable: {reason}")]
    Format { name: String, reason: String },

    #[error("Session {name} has unsupported version {found} (expected {expected})")]
    Version { name: String, found: u32, expected: u32 },

    #[error("Session {0} is locked by another writer")]
    Locked(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Record of a document written to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMark {
    /// Revision of the content that was written
    pub revision: Revision,
    /// Destination root it was written under
    pub destination: String,
    /// Path relative to the destination root
    pub path: String,
    pub downloaded_at: DateTime<Utc>,
}

impl DownloadMark {
    /// Whether this mark already accounts for `revision` under `destination`.
    pub fn covers(&self, revision: &Revision, destination: &str) -> bool {
        &self.revision == revision && self.destination == destination
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub current: Option<Snapshot>,
    /// The snapshot before the last sync
    pub previous: Option<Snapshot>,
    /// Bookmarked ids of `current`
    #[serde(default)]
    pub bookmarks: BTreeSet<NodeId>,
    #[serde(default)]
    pub downloads: BTreeMap<NodeId, DownloadMark>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing has ever been synced into this session.
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_none()
    }

    /// Install `snapshot` as current and demote the old current to previous.
    ///
    /// Pure state transition: rotation replaces, it never merges. Download
    /// marks of nodes missing from the new snapshot are dropped.
    pub fn rotate(self, snapshot: Snapshot) -> Session {
        let bookmarks = snapshot.bookmarked_ids().cloned().collect();
        let mut downloads = self.downloads;
        downloads.retain(|id, _| snapshot.contains(id));

        Session {
            previous: self.current,
            current: Some(snapshot),
            bookmarks,
            downloads,
        }
    }

    /// Changes between previous and current, if anything was synced.
    pub fn changes(&self) -> Option<ChangeSet> {
        self.current
            .as_ref()
            .map(|current| diff(self.previous.as_ref(), current))
    }

    pub fn record_downloads(&mut self, marks: impl IntoIterator<Item = (NodeId, DownloadMark)>) {
        self.downloads.extend(marks);
    }
}

#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord<S> {
    format: String,
    version: u32,
    name: String,
    saved_at: DateTime<Utc>,
    session: S,
}

/// Loads and atomically saves sessions inside one directory.
pub struct SessionStore<F: FileSystem> {
    fs: F,
    dir: String,
}

impl<F: FileSystem> SessionStore<F> {
    /// Store sessions at the root of `fs`.
    pub fn new(fs: F) -> Self {
        Self::with_dir(fs, "")
    }

    /// Store sessions under `dir` (relative to the root of `fs`).
    pub fn with_dir(fs: F, dir: impl Into<String>) -> Self {
        Self { fs, dir: dir.into() }
    }

    fn session_path(&self, name: &str) -> Result<String> {
        if name.is_empty()
            || name.contains(['/', '\\', '\0'])
            || name == "."
            || name == ".."
        {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        Ok(fs::join(&self.dir, &format!("{name}.{SESSION_EXT}")))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.session_path(name)?;
        Ok(self.fs.exists(&path).await?)
    }

    /// Load a session, or an empty one when nothing is stored under `name`.
    pub async fn load(&self, name: &str) -> Result<Session> {
        let path = self.session_path(name)?;
        let bytes = match self.fs.read(&path).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => {
                debug!("No session stored for {}, starting empty", name);
                return Ok(Session::new());
            }
            Err(e) => return Err(e.into()),
        };

        let format_error = |reason: String| SessionError::Format {
            name: name.to_string(),
            reason,
        };

        let header: Header = serde_json::from_slice(&bytes).map_err(|e| format_error(e.to_string()))?;
        if header.format != SESSION_FORMAT {
            return Err(format_error(format!("unknown format tag {:?}", header.format)));
        }
        if header.version != SESSION_VERSION {
            return Err(SessionError::Version {
                name: name.to_string(),
                found: header.version,
                expected: SESSION_VERSION,
            });
        }

        let record: SessionRecord<Session> =
            serde_json::from_slice(&bytes).map_err(|e| format_error(e.to_string()))?;
        debug!("Loaded session {} saved at {}", name, record.saved_at);
        Ok(record.session)
    }

    /// Atomically replace the stored session.
    ///
    /// Content goes to a temporary file that is renamed over the old one, so
    /// a failure at any point leaves the previous session intact. The lock
    /// file is held for the duration and released whether the write worked
    /// or not.
    pub async fn save(&self, name: &str, session: &Session) -> Result<()> {
        let path = self.session_path(name)?;
        let record = SessionRecord {
            format: SESSION_FORMAT.to_string(),
            version: SESSION_VERSION,
            name: name.to_string(),
            saved_at: Utc::now(),
            session,
        };
        let bytes =
            serde_json::to_vec_pretty(&record).map_err(|e| SessionError::Serialization(e.to_string()))?;

        if !self.dir.is_empty() {
            self.fs.mkdir(&self.dir).await?;
        }

        let lock = format!("{path}.lock");
        match self.fs.create_new(&lock, std::process::id().to_string().as_bytes()).await {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => return Err(SessionError::Locked(name.to_string())),
            Err(e) => return Err(e.into()),
        }

        let result = self.replace(&path, &bytes).await;

        if let Err(e) = self.fs.delete(&lock).await {
            warn!("Failed to release session lock {}: {}", lock, e);
        }

        if result.is_ok() {
            info!("Saved session {} ({} bytes)", name, bytes.len());
        }
        result
    }

    async fn replace(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let tmp = format!("{path}.tmp");
        let written = match self.fs.write(&tmp, bytes).await {
            Ok(()) => self.fs.rename(&tmp, path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            if self.fs.exists(&tmp).await.unwrap_or(false) {
                let _ = self.fs.delete(&tmp).await;
            }
            return Err(e.into());
        }
        Ok(())
    }
}
