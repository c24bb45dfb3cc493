//! Download engine: filter-gated, fault-isolated fetches into a local tree.
//!
//! Documents are visited depth-first from the roots. Every document that
//! passes the filter (and, in changes mode, actually changed since it was last
//! written) is fetched through the remote and written under the destination
//! root. One failing node never aborts the run: it is recorded in the report
//! and traversal continues. A disconnect stops new fetches from being
//! scheduled, and whatever was not started yet is reported as cancelled.

use crate::diff::{ChangeKind, ChangeSet};
use crate::events::{EventBus, SyncEvent};
use crate::filter::{Candidate, Filter};
use crate::fs::{self, FileSystem, FsError};
use crate::layout::Layout;
use crate::node::{Node, NodeId};
use crate::remote::{self, RemoteTree};
use crate::session::DownloadMark;
use crate::snapshot::Snapshot;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound for simultaneous fetches; the device's web server is slow and
/// single-minded.
pub const MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Device unreachable before any download completed: {0}")]
    Unreachable(String),

    #[error("Cannot create destination {path}: {source}")]
    Destination {
        path: String,
        #[source]
        source: FsError,
    },
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Simultaneous fetches, clamped to `1..=MAX_CONCURRENCY`
    pub concurrency: usize,
    /// Delete local files of removed nodes (changes mode only)
    pub prune: bool,
    /// Appended to document file names
    pub extension: Option<String>,
    /// A collection passing the filter brings every document below it
    pub include_descendants: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            prune: false,
            extension: None,
            include_descendants: false,
        }
    }
}

impl DownloadOptions {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// What a changes-mode download is measured against.
#[derive(Debug, Clone, Copy)]
pub struct Baseline<'a> {
    pub changes: &'a ChangeSet,
    /// Snapshot the change set was computed from, needed to place removed nodes
    pub previous: Option<&'a Snapshot>,
    /// Documents already written, by id
    pub marks: &'a BTreeMap<NodeId, DownloadMark>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The filter rejected it
    Filtered,
    /// Changes mode and the node did not change
    Unchanged,
    /// This revision was already written to the same destination
    AlreadyDownloaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Downloaded { bytes: u64 },
    Skipped(SkipReason),
    Failed { error: String },
    /// Never started because the device went away
    Cancelled,
    /// Gone from the device; `pruned` when the local copy was deleted
    Removed { pruned: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub id: NodeId,
    /// Path relative to the destination root
    pub path: String,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    PartialFailure { failed: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadCounts {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub removed: usize,
    pub pruned: usize,
}

impl fmt::Display for DownloadCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} downloaded, {} skipped, {} failed, {} cancelled, {} removed ({} pruned)",
            self.downloaded, self.skipped, self.failed, self.cancelled, self.removed, self.pruned
        )
    }
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub destination: String,
    /// Documents in traversal order, then removed nodes by id
    pub entries: Vec<ReportEntry>,
    pub bytes: u64,
    /// Marks for every document written by this run
    pub marks: Vec<(NodeId, DownloadMark)>,
}

impl DownloadReport {
    pub fn counts(&self) -> DownloadCounts {
        let mut counts = DownloadCounts::default();
        for entry in &self.entries {
            match entry.status {
                EntryStatus::Downloaded { .. } => counts.downloaded += 1,
                EntryStatus::Skipped(_) => counts.skipped += 1,
                EntryStatus::Failed { .. } => counts.failed += 1,
                EntryStatus::Cancelled => counts.cancelled += 1,
                EntryStatus::Removed { pruned } => {
                    counts.removed += 1;
                    if pruned {
                        counts.pruned += 1;
                    }
                }
            }
        }
        counts
    }

    pub fn outcome(&self) -> Outcome {
        let counts = self.counts();
        match counts.failed + counts.cancelled {
            0 => Outcome::Completed,
            failed => Outcome::PartialFailure { failed },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome() == Outcome::Completed
    }

    pub fn entry(&self, id: &NodeId) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Failed { .. } | EntryStatus::Cancelled))
    }
}

struct Job<'a> {
    slot: usize,
    node: &'a Node,
    path: String,
}

enum Fetched {
    Done { bytes: u64 },
    Failed { error: String, disconnect: bool },
    Cancelled,
}

struct Removal {
    slot: usize,
    path: String,
    collection: bool,
}

/// Writes remote documents under a destination root.
pub struct DownloadEngine<'a> {
    remote: &'a dyn RemoteTree,
    fs: &'a dyn FileSystem,
    events: Option<&'a EventBus>,
}

impl<'a> DownloadEngine<'a> {
    pub fn new(remote: &'a dyn RemoteTree, fs: &'a dyn FileSystem) -> Self {
        Self {
            remote,
            fs,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<&'a EventBus>) -> Self {
        self.events = events;
        self
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(bus) = self.events {
            bus.emit(event);
        }
    }

    /// Download the documents of `snapshot` selected by `filter`.
    ///
    /// Without a baseline every selected document is fetched (full-tree
    /// mode). With one, unchanged and already-written documents are skipped
    /// and removed nodes are reported (and pruned when asked to).
    pub async fn download(
        &self,
        snapshot: &Snapshot,
        baseline: Option<Baseline<'_>>,
        filter: &dyn Filter,
        destination: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        self.fs
            .mkdir(destination)
            .await
            .map_err(|source| DownloadError::Destination {
                path: destination.to_string(),
                source,
            })?;

        let extension = options.extension.as_deref();
        let layout = Layout::build(snapshot, extension);
        let mut entries = Vec::new();
        let mut jobs = Vec::new();

        // Depth of the collection whose whole subtree is selected, if any
        let mut included_below: Option<usize> = None;
        // Names from the root down to the current node; pre-order keeps it valid
        let mut names: Vec<String> = Vec::new();
        for (depth, node) in snapshot.walk() {
            if included_below.is_some_and(|d| depth <= d) {
                included_below = None;
            }
            names.truncate(depth);
            names.push(node.name.clone());
            let candidate = Candidate::new(node, &names);
            let status = baseline.and_then(|b| b.changes.status(&node.id));

            if node.is_collection() {
                if options.include_descendants
                    && included_below.is_none()
                    && filter.evaluate(&candidate, status)
                {
                    included_below = Some(depth);
                }
                continue;
            }

            let path = layout.path(&node.id).unwrap_or(node.id.as_str()).to_string();
            let skip = if included_below.is_none() && !filter.evaluate(&candidate, status) {
                Some(SkipReason::Filtered)
            } else if status == Some(ChangeKind::Unchanged) {
                Some(SkipReason::Unchanged)
            } else if baseline.is_some_and(|b| {
                b.marks
                    .get(&node.id)
                    .is_some_and(|mark| mark.covers(&node.revision(), destination))
            }) {
                Some(SkipReason::AlreadyDownloaded)
            } else {
                None
            };

            let slot = entries.len();
            entries.push(ReportEntry {
                id: node.id.clone(),
                path: path.clone(),
                status: match skip {
                    Some(reason) => EntryStatus::Skipped(reason),
                    None => EntryStatus::Cancelled,
                },
            });
            if skip.is_none() {
                jobs.push(Job { slot, node, path });
            }
        }

        let mut report = DownloadReport {
            destination: destination.to_string(),
            entries,
            bytes: 0,
            marks: Vec::new(),
        };

        if !jobs.is_empty() {
            self.fetch_all(&jobs, destination, options, &mut report).await?;
        }

        if let Some(baseline) = baseline {
            self.handle_removed(baseline, filter, destination, options, &mut report)
                .await;
        }

        info!("Download into {} finished: {}", destination, report.counts());
        Ok(report)
    }

    async fn fetch_all(
        &self,
        jobs: &[Job<'_>],
        destination: &str,
        options: &DownloadOptions,
        report: &mut DownloadReport,
    ) -> Result<()> {
        if !self.remote.probe().await {
            return Err(DownloadError::Unreachable("probe failed".into()));
        }

        let cancel = AtomicBool::new(false);
        let cancel = &cancel;
        let concurrency = options.effective_concurrency();
        debug!("Fetching {} document(s), {} at a time", jobs.len(), concurrency);

        let results: Vec<(usize, Fetched)> = stream::iter(jobs.iter().enumerate())
            .map(|(i, job)| async move { (i, self.fetch_one(job, destination, cancel).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut attempted = 0;
        let mut disconnected = 0;
        let mut last_error = String::new();
        for (i, fetched) in results {
            let job = &jobs[i];
            let status = match fetched {
                Fetched::Done { bytes } => {
                    report.bytes += bytes;
                    report.marks.push((
                        job.node.id.clone(),
                        DownloadMark {
                            revision: job.node.revision(),
                            destination: destination.to_string(),
                            path: job.path.clone(),
                            downloaded_at: Utc::now(),
                        },
                    ));
                    attempted += 1;
                    EntryStatus::Downloaded { bytes }
                }
                Fetched::Failed { error, disconnect } => {
                    attempted += 1;
                    if disconnect {
                        disconnected += 1;
                    }
                    last_error = error.clone();
                    EntryStatus::Failed { error }
                }
                Fetched::Cancelled => EntryStatus::Cancelled,
            };
            report.entries[job.slot].status = status;
        }
        report.marks.sort_by(|a, b| a.0.cmp(&b.0));

        if attempted > 0 && disconnected == attempted {
            return Err(DownloadError::Unreachable(last_error));
        }
        Ok(())
    }

    async fn fetch_one(&self, job: &Job<'_>, destination: &str, cancel: &AtomicBool) -> Fetched {
        if cancel.load(Ordering::SeqCst) {
            return Fetched::Cancelled;
        }

        let content = match self.fetch_bytes(&job.node.id).await {
            Ok(content) => content,
            Err(e) => {
                let disconnect = e.is_disconnect();
                if disconnect && !cancel.swap(true, Ordering::SeqCst) {
                    warn!("Device went away, not starting further downloads");
                }
                warn!("Failed to fetch {} ({}): {}", job.path, job.node.id, e);
                self.emit(SyncEvent::DownloadFailed {
                    id: job.node.id.to_string(),
                    path: job.path.clone(),
                    error: e.to_string(),
                });
                return Fetched::Failed {
                    error: e.to_string(),
                    disconnect,
                };
            }
        };

        let target = fs::join(destination, &job.path);
        if let Err(e) = self.write_atomically(&target, &content).await {
            warn!("Failed to write {}: {}", target, e);
            self.emit(SyncEvent::DownloadFailed {
                id: job.node.id.to_string(),
                path: job.path.clone(),
                error: e.to_string(),
            });
            return Fetched::Failed {
                error: e.to_string(),
                disconnect: false,
            };
        }

        let bytes = content.len() as u64;
        debug!("Wrote {} ({} bytes)", target, bytes);
        self.emit(SyncEvent::Downloaded {
            id: job.node.id.to_string(),
            path: job.path.clone(),
            bytes,
        });
        Fetched::Done { bytes }
    }

    async fn fetch_bytes(&self, id: &NodeId) -> remote::Result<Vec<u8>> {
        let stream = self.remote.fetch_content(id).await?;
        stream
            .try_fold(Vec::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await
    }

    /// Parent directories come into existence with the first file below them.
    async fn write_atomically(&self, target: &str, content: &[u8]) -> fs::Result<()> {
        let part = format!("{target}.part");
        let written = match self.fs.write(&part, content).await {
            Ok(()) => self.fs.rename(&part, target).await,
            Err(e) => Err(e),
        };
        if written.is_err() && self.fs.exists(&part).await.unwrap_or(false) {
            let _ = self.fs.delete(&part).await;
        }
        written
    }

    async fn handle_removed(
        &self,
        baseline: Baseline<'_>,
        filter: &dyn Filter,
        destination: &str,
        options: &DownloadOptions,
        report: &mut DownloadReport,
    ) {
        let Some(previous) = baseline.previous else {
            return;
        };
        let layout = Layout::build(previous, options.extension.as_deref());

        let mut removals = Vec::new();
        for entry in baseline.changes.of_kind(ChangeKind::Removed) {
            let (Some(node), Ok(names)) = (previous.get(&entry.id), previous.resolve_path(&entry.id))
            else {
                continue;
            };
            if !filter.evaluate(&Candidate::new(node, &names), Some(ChangeKind::Removed)) {
                continue;
            }

            let path = layout.path(&node.id).unwrap_or(node.id.as_str()).to_string();
            removals.push(Removal {
                slot: report.entries.len(),
                path: path.clone(),
                collection: node.is_collection(),
            });
            report.entries.push(ReportEntry {
                id: node.id.clone(),
                path,
                status: EntryStatus::Removed { pruned: false },
            });
        }

        if !options.prune {
            return;
        }

        // Files first, then directories deepest first so they are empty by then
        removals.sort_by_key(|r| (r.collection, std::cmp::Reverse(r.path.matches('/').count())));
        for removal in removals {
            let target = fs::join(destination, &removal.path);
            match self.fs.delete(&target).await {
                Ok(()) => {
                    info!("Pruned {}", target);
                    let entry = &mut report.entries[removal.slot];
                    entry.status = EntryStatus::Removed { pruned: true };
                    self.emit(SyncEvent::Pruned {
                        id: entry.id.to_string(),
                        path: removal.path,
                    });
                }
                Err(FsError::NotFound(_)) => {}
                Err(e) => warn!("Could not prune {}: {}", target, e),
            }
        }
    }
}
