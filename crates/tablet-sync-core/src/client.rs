//! TabletSync - the public entry point tying sync, diff and download together.
//!
//! Owns the remote, the local filesystem downloads go to, the session (either
//! persisted under a name or kept in memory) and the run state machine.

use crate::connect::{self, ConnectError, RunState, WaitConfig};
use crate::diff::{diff, ChangeSet};
use crate::download::{Baseline, DownloadEngine, DownloadError, DownloadOptions, DownloadReport, Outcome};
use crate::events::{EventBus, SyncEvent};
use crate::filter::Filter;
use crate::fs::FileSystem;
use crate::remote::{RemoteError, RemoteTree};
use crate::session::{Session, SessionError, SessionStore};
use crate::snapshot::{Snapshot, TreeError};

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Device error: {0}")]
    Device(#[from] RemoteError),

    #[error("Invalid tree: {0}")]
    InvalidTree(#[from] TreeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error(transparent)]
    Download(DownloadError),

    #[error(transparent)]
    State(ConnectError),

    #[error("No snapshot yet; sync first or enable auto_sync")]
    NoSnapshot,
}

impl From<DownloadError> for SyncError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Unreachable(reason) => SyncError::DeviceUnreachable(reason),
            other => SyncError::Download(other),
        }
    }
}

impl From<ConnectError> for SyncError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Unreachable { .. } => SyncError::DeviceUnreachable(e.to_string()),
            other => SyncError::State(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Sync before downloading when the session has no snapshot yet
    pub auto_sync: bool,
    /// Schedule for `wait_device_connection`
    pub wait: WaitConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            auto_sync: true,
            wait: WaitConfig::default(),
        }
    }
}

struct Persisted<F: FileSystem> {
    store: SessionStore<F>,
    name: String,
}

pub struct TabletSync<R: RemoteTree, F: FileSystem> {
    remote: R,
    fs: F,
    persisted: Option<Persisted<F>>,
    session: Session,
    state: RunState,
    options: SyncOptions,
    events: Option<Arc<EventBus>>,
}

impl<R: RemoteTree, F: FileSystem> TabletSync<R, F> {
    /// Session kept in memory only; nothing is persisted.
    pub fn new(remote: R, fs: F, options: SyncOptions) -> Self {
        Self {
            remote,
            fs,
            persisted: None,
            session: Session::new(),
            state: RunState::Idle,
            options,
            events: None,
        }
    }

    /// Load (or start) the session stored under `name`.
    pub async fn open(
        remote: R,
        fs: F,
        store: SessionStore<F>,
        name: &str,
        options: SyncOptions,
    ) -> Result<Self> {
        let session = store.load(name).await?;
        info!(
            "Opened session {} ({})",
            name,
            match &session.current {
                Some(snapshot) => format!("{} nodes", snapshot.len()),
                None => "empty".to_string(),
            }
        );

        let mut sync = Self::new(remote, fs, options);
        sync.session = session;
        sync.persisted = Some(Persisted {
            store,
            name: name.to_string(),
        });
        Ok(sync)
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.session.current.as_ref()
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    fn enter(&mut self, next: RunState) -> Result<()> {
        let from = self.state.clone();
        self.state.advance(next)?;
        self.emit(SyncEvent::StateChanged {
            from,
            to: self.state.clone(),
        });
        Ok(())
    }

    fn fail(&mut self, reason: String) {
        if let Err(e) = self.enter(RunState::Failed { reason }) {
            warn!("{}", e);
        }
    }

    pub async fn is_device_connected(&self) -> bool {
        self.remote.probe().await
    }

    /// Poll the device with backoff until it answers or the configured
    /// timeout elapses.
    pub async fn wait_device_connection(&mut self) -> Result<()> {
        self.enter(RunState::Connecting)?;
        match connect::wait_device_connection(&self.remote, &self.options.wait).await {
            Ok(_) => self.enter(RunState::Connected),
            Err(e) => {
                self.fail(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Single probe; the state machine's Connecting -> Connected step.
    async fn connect(&mut self) -> Result<()> {
        self.enter(RunState::Connecting)?;
        if self.remote.probe().await {
            self.enter(RunState::Connected)
        } else {
            self.fail("device did not answer".to_string());
            Err(SyncError::DeviceUnreachable("device did not answer probe".into()))
        }
    }

    /// Capture the device tree and store it as the current snapshot.
    ///
    /// Any failure aborts the call with the stored session untouched.
    pub async fn sync_file_system(&mut self) -> Result<()> {
        self.connect().await?;
        self.enter(RunState::Syncing)?;

        match self.capture().await {
            Ok(session) => {
                self.session = session;
                self.enter(RunState::Synced)
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn capture(&self) -> Result<Session> {
        let nodes = self.remote.list_tree().await?;
        let snapshot = Snapshot::build(nodes)?;
        let rotated = self.session.clone().rotate(snapshot);

        if let Some(persisted) = &self.persisted {
            persisted.store.save(&persisted.name, &rotated).await?;
        }

        if let Some(changes) = rotated.changes() {
            let summary = changes.summary();
            info!("Synced {} nodes: {}", changes.len(), summary);
            self.emit(SyncEvent::Synced {
                nodes: changes.len() - summary.removed,
                added: summary.added,
                removed: summary.removed,
                modified: summary.modified,
            });
        }
        Ok(rotated)
    }

    /// Changes between the previous and current snapshot, without touching
    /// the device.
    pub fn changes(&self) -> Result<ChangeSet> {
        self.session.changes().ok_or(SyncError::NoSnapshot)
    }

    /// Sync, then diff against the snapshot that was current before.
    pub async fn get_changes(&mut self) -> Result<ChangeSet> {
        self.sync_file_system().await?;
        self.changes()
    }

    /// Get to `Synced`: sync when there is nothing to work from (and
    /// auto-sync allows it), otherwise use the stored snapshot as is.
    async fn ready(&mut self) -> Result<()> {
        if self.session.current.is_none() {
            if !self.options.auto_sync {
                return Err(SyncError::NoSnapshot);
            }
            info!("No snapshot yet, syncing first");
            return self.sync_file_system().await;
        }

        self.connect().await?;
        self.enter(RunState::Synced)
    }

    /// Download every document of the current snapshot that passes `filter`.
    ///
    /// Works from the stored snapshot, which may be stale.
    pub async fn download_tree(
        &mut self,
        destination: &str,
        filter: &dyn Filter,
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        self.ready().await?;
        self.run_download(destination, filter, options, false).await
    }

    /// Download what changed between the previous and current snapshot.
    pub async fn download_changes(
        &mut self,
        destination: &str,
        filter: &dyn Filter,
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        self.ready().await?;
        self.run_download(destination, filter, options, true).await
    }

    async fn run_download(
        &mut self,
        destination: &str,
        filter: &dyn Filter,
        options: &DownloadOptions,
        changes_mode: bool,
    ) -> Result<DownloadReport> {
        self.enter(RunState::Downloading)?;

        let result = {
            let current = self.session.current.as_ref().ok_or(SyncError::NoSnapshot)?;
            let changes = changes_mode.then(|| diff(self.session.previous.as_ref(), current));
            let baseline = changes.as_ref().map(|changes| Baseline {
                changes,
                previous: self.session.previous.as_ref(),
                marks: &self.session.downloads,
            });

            DownloadEngine::new(&self.remote, &self.fs)
                .with_events(self.events.as_deref())
                .download(current, baseline, filter, destination, options)
                .await
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!("Download failed: {}", e);
                self.fail(e.to_string());
                return Err(e.into());
            }
        };

        if !report.marks.is_empty() {
            self.session.record_downloads(report.marks.iter().cloned());
            if let Some(persisted) = &self.persisted {
                if let Err(e) = persisted.store.save(&persisted.name, &self.session).await {
                    warn!("Could not record downloads in session {}: {}", persisted.name, e);
                }
            }
        }

        match report.outcome() {
            Outcome::Completed => self.enter(RunState::Completed)?,
            Outcome::PartialFailure { failed } => {
                warn!("{} of {} downloads did not complete", failed, report.entries.len());
                self.enter(RunState::PartialFailure { failed })?
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use crate::download::EntryStatus;
    use crate::filter;
    use crate::fs::InMemoryFs;
    use crate::node::{Node, NodeId};
    use crate::remote::InMemoryRemote;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    /// A (collection), A1 (bookmarked) and A2, both at v1.
    fn scenario_remote() -> Arc<InMemoryRemote> {
        let remote = Arc::new(InMemoryRemote::new());
        remote.upsert(Node::collection("A", "A", at(0)), Vec::new());
        remote.upsert(
            Node::document("A1", "A1", at(0))
                .with_parent("A")
                .bookmarked(true)
                .with_version("v1"),
            b"a1 v1".to_vec(),
        );
        remote.upsert(
            Node::document("A2", "A2", at(0)).with_parent("A").with_version("v1"),
            b"a2 v1".to_vec(),
        );
        remote
    }

    async fn open(
        remote: &Arc<InMemoryRemote>,
        fs: &Arc<InMemoryFs>,
    ) -> TabletSync<Arc<InMemoryRemote>, Arc<InMemoryFs>> {
        TabletSync::open(
            Arc::clone(remote),
            Arc::clone(fs),
            SessionStore::with_dir(Arc::clone(fs), "state"),
            "tablet",
            SyncOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bookmark_scenario_end_to_end() {
        let remote = scenario_remote();
        let fs = Arc::new(InMemoryFs::new());
        let mut sync = open(&remote, &fs).await;

        // First sync: everything is new
        let changes = sync.get_changes().await.unwrap();
        for node in ["A", "A1", "A2"] {
            assert_eq!(changes.status(&id(node)), Some(ChangeKind::Added));
        }

        let report = sync
            .download_tree("out", &filter::bookmarked(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome(), Outcome::Completed);
        assert_eq!(fs.read("out/A/A1").await.unwrap(), b"a1 v1");
        assert!(!fs.exists("out/A/A2").await.unwrap());
        assert_eq!(sync.state(), &RunState::Completed);

        // A1 edited on the device
        remote.upsert(
            Node::document("A1", "A1", at(60))
                .with_parent("A")
                .bookmarked(true)
                .with_version("v2"),
            b"a1 v2".to_vec(),
        );

        // A fresh process picks the session up from disk
        drop(sync);
        let mut sync = open(&remote, &fs).await;
        let changes = sync.get_changes().await.unwrap();
        assert_eq!(changes.status(&id("A")), Some(ChangeKind::Unchanged));
        assert_eq!(changes.status(&id("A1")), Some(ChangeKind::Modified));
        assert_eq!(changes.status(&id("A2")), Some(ChangeKind::Unchanged));

        let fetched_before = remote.total_fetches();
        let report = sync
            .download_changes("out", &filter::bookmarked(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts().downloaded, 1);
        assert_eq!(remote.total_fetches(), fetched_before + 1);
        assert_eq!(remote.fetch_count(&id("A1")), 2);
        assert_eq!(remote.fetch_count(&id("A2")), 0);
        assert_eq!(fs.read("out/A/A1").await.unwrap(), b"a1 v2");

        // Same again without a sync in between: nothing left to fetch
        let report = sync
            .download_changes("out", &filter::bookmarked(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts().downloaded, 0);
        assert_eq!(report.bytes, 0);
        assert_eq!(remote.total_fetches(), fetched_before + 1);
        assert_eq!(
            report.entry(&id("A1")).unwrap().status,
            EntryStatus::Skipped(crate::download::SkipReason::AlreadyDownloaded)
        );
    }

    #[tokio::test]
    async fn test_invalid_tree_persists_nothing() {
        let remote = scenario_remote();
        let fs = Arc::new(InMemoryFs::new());
        let mut sync = open(&remote, &fs).await;
        sync.sync_file_system().await.unwrap();
        let stored = sync.session().clone();

        remote.upsert(
            Node::document("orphan", "Orphan", at(0)).with_parent("nowhere"),
            Vec::new(),
        );
        let err = sync.sync_file_system().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTree(TreeError::Orphan { .. })));
        assert!(matches!(sync.state(), RunState::Failed { .. }));
        assert_eq!(sync.session(), &stored);

        let reopened = open(&remote, &fs).await;
        assert_eq!(reopened.session(), &stored);
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let remote = scenario_remote();
        remote.set_reachable(false);
        let fs = Arc::new(InMemoryFs::new());
        let mut sync = TabletSync::new(Arc::clone(&remote), Arc::clone(&fs), SyncOptions::default());

        assert!(!sync.is_device_connected().await);
        let err = sync.sync_file_system().await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceUnreachable(_)));
        assert!(matches!(sync.state(), RunState::Failed { .. }));

        // A failed run does not wedge the state machine
        remote.set_reachable(true);
        sync.sync_file_system().await.unwrap();
        assert_eq!(sync.state(), &RunState::Synced);
    }

    #[tokio::test]
    async fn test_no_snapshot_without_auto_sync() {
        let remote = scenario_remote();
        let fs = Arc::new(InMemoryFs::new());
        let options = SyncOptions {
            auto_sync: false,
            ..Default::default()
        };
        let mut sync = TabletSync::new(Arc::clone(&remote), Arc::clone(&fs), options);

        assert!(matches!(sync.changes(), Err(SyncError::NoSnapshot)));
        let err = sync
            .download_tree("out", &filter::all(), &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSnapshot));
        assert_eq!(remote.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_auto_sync_and_stale_download() {
        let remote = scenario_remote();
        let fs = Arc::new(InMemoryFs::new());
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let _sub = bus.subscribe(move |event| {
            if let SyncEvent::StateChanged { to, .. } = event {
                sink.lock().unwrap().push(to);
            }
        });

        let mut sync = TabletSync::new(Arc::clone(&remote), Arc::clone(&fs), SyncOptions::default())
            .with_events(bus);

        // No snapshot: auto-sync runs first
        sync.download_tree("out", &filter::all(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(fs.file_paths(), vec!["out/A/A1".to_string(), "out/A/A2".to_string()]);

        // Device gains a node; download_tree keeps using the stored snapshot
        remote.upsert(Node::document("B", "B", at(5)), b"b".to_vec());
        sync.download_tree("again", &filter::all(), &DownloadOptions::default())
            .await
            .unwrap();
        assert!(!fs.exists("again/B").await.unwrap());

        let states = states.lock().unwrap();
        use RunState::*;
        assert_eq!(
            *states,
            vec![
                Connecting, Connected, Syncing, Synced, Downloading, Completed,
                Connecting, Connected, Synced, Downloading, Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_state() {
        let remote = scenario_remote();
        remote.fail_fetch("A2");
        let fs = Arc::new(InMemoryFs::new());
        let mut sync = TabletSync::new(Arc::clone(&remote), Arc::clone(&fs), SyncOptions::default());

        let report = sync
            .download_tree("out", &filter::all(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome(), Outcome::PartialFailure { failed: 1 });
        assert_eq!(sync.state(), &RunState::PartialFailure { failed: 1 });
        // The successful one is remembered
        assert!(sync.session().downloads.contains_key(&id("A1")));
        assert!(!sync.session().downloads.contains_key(&id("A2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_device_connection_times_out() {
        let remote = scenario_remote();
        remote.set_reachable(false);
        let fs = Arc::new(InMemoryFs::new());
        let mut sync = TabletSync::new(Arc::clone(&remote), fs, SyncOptions::default());

        let err = sync.wait_device_connection().await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceUnreachable(_)));
        assert!(matches!(sync.state(), RunState::Failed { .. }));
    }
}
