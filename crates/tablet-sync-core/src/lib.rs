//! tablet-sync-core: offline sync and diff engine for a tablet's file tree.
//!
//! This crate provides:
//! - Snapshots of the device tree with validated parent links and memoized paths
//! - Named sessions persisted atomically, rotated on every sync
//! - Change sets between two snapshots, keyed by node identity
//! - Composable filters and a fault-isolated, incremental download engine
//! - RemoteTree and FileSystem trait abstractions

pub mod client;
pub mod connect;
pub mod diff;
pub mod download;
pub mod events;
pub mod filter;
pub mod fs;
pub mod layout;
pub mod node;
pub mod remote;
pub mod session;
pub mod snapshot;

pub use client::{SyncError, SyncOptions, TabletSync};
pub use connect::{wait_device_connection, RunState, WaitConfig};
pub use diff::{diff, ChangeEntry, ChangeKind, ChangeSet, ChangeSummary};
pub use download::{DownloadOptions, DownloadReport, EntryStatus, Outcome};
pub use events::{EventBus, Subscription, SyncEvent};
pub use filter::{Candidate, Filter, FilterExt};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use node::{Node, NodeId, NodeKind, Revision};
pub use remote::{ContentStream, InMemoryRemote, RemoteError, RemoteTree};
pub use session::{Session, SessionStore};
pub use snapshot::{Snapshot, TreeError};
