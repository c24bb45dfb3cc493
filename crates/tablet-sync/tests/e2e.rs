//! End-to-end tests for tablet-sync.
//!
//! Runs the HTTP remote and native filesystem against a fake device web
//! interface served by axum on a local port.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tablet_sync::{HttpRemote, NativeFs};
use tablet_sync_core::download::{DownloadOptions, EntryStatus, Outcome};
use tablet_sync_core::filter;
use tablet_sync_core::{
    ChangeKind, FileSystem, NodeId, NodeKind, RemoteError, RemoteTree, RunState, SessionStore,
    SyncOptions, TabletSync,
};
use tempfile::TempDir;

/// Device state: listings keyed by parent id ("" for the root) and PDF bodies.
#[derive(Default)]
struct Device {
    listings: Mutex<HashMap<String, Vec<Value>>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    /// Ids whose download sends a first chunk and then goes silent
    stalled: Mutex<HashSet<String>>,
}

impl Device {
    fn put(&self, parent: &str, record: Value, content: Option<&[u8]>) {
        let id = record["ID"].as_str().unwrap_or_default().to_string();
        let mut listings = self.listings.lock().unwrap();
        for children in listings.values_mut() {
            children.retain(|child| child["ID"] != record["ID"]);
        }
        listings.entry(parent.to_string()).or_default().push(record);
        if let Some(content) = content {
            self.contents.lock().unwrap().insert(id, content.to_vec());
        }
    }

    fn stall(&self, id: &str) {
        self.stalled.lock().unwrap().insert(id.to_string());
    }
}

fn record(id: &str, name: &str, kind: &str, version: u64, bookmarked: bool) -> Value {
    json!({
        "ID": id,
        "VissibleName": name,
        "Type": kind,
        "ModifiedClient": format!("2024-03-01T10:{:02}:00.000Z", version),
        "Bookmarked": bookmarked,
        "Version": version,
    })
}

async fn index() -> &'static str {
    "tablet web interface"
}

async fn list_root(State(device): State<Arc<Device>>) -> Json<Vec<Value>> {
    let listings = device.listings.lock().unwrap();
    Json(listings.get("").cloned().unwrap_or_default())
}

async fn list_collection(
    State(device): State<Arc<Device>>,
    Path(id): Path<String>,
) -> Json<Vec<Value>> {
    let listings = device.listings.lock().unwrap();
    Json(listings.get(&id).cloned().unwrap_or_default())
}

async fn download(State(device): State<Arc<Device>>, Path(id): Path<String>) -> Response {
    if device.stalled.lock().unwrap().contains(&id) {
        let body = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"%PDF")) })
            .chain(stream::pending());
        return Body::from_stream(body).into_response();
    }
    match device.contents.lock().unwrap().get(&id) {
        Some(content) => content.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve `device` on an ephemeral local port.
async fn serve(device: Arc<Device>) -> SocketAddr {
    let app = Router::new()
        .route("/", get(index))
        .route("/documents/", post(list_root))
        .route("/documents/{id}", post(list_collection))
        .route("/download/{id}/placeholder", get(download))
        .with_state(device);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn remote(addr: SocketAddr) -> HttpRemote {
    HttpRemote::new(&format!("http://{addr}"), Duration::from_millis(500)).unwrap()
}

/// A (collection), A1 (bookmarked) and A2 under it, plus a root document
/// whose name arrives double-encoded.
fn scenario_device() -> Arc<Device> {
    let device = Arc::new(Device::default());
    device.put("", record("A", "A", "CollectionType", 1, false), None);
    device.put("A", record("A1", "A1", "DocumentType", 1, true), Some(b"%PDF a1 v1"));
    device.put("A", record("A2", "A2", "DocumentType", 1, false), Some(b"%PDF a2 v1"));
    device.put(
        "",
        record("cafe", "CafÃ©", "DocumentType", 1, false),
        Some(b"%PDF cafe"),
    );
    device
}

/// Remote that gives up on a silent transfer after a fraction of a second.
fn impatient_remote(addr: SocketAddr) -> HttpRemote {
    HttpRemote::with_read_timeout(
        &format!("http://{addr}"),
        Duration::from_millis(500),
        Duration::from_millis(300),
    )
    .unwrap()
}

async fn open(addr: SocketAddr, dir: &std::path::Path) -> TabletSync<HttpRemote, NativeFs> {
    open_with(remote(addr), dir).await
}

async fn open_with(remote: HttpRemote, dir: &std::path::Path) -> TabletSync<HttpRemote, NativeFs> {
    TabletSync::open(
        remote,
        NativeFs::new(dir),
        SessionStore::new(NativeFs::new(dir.join("sessions"))),
        "e2e",
        SyncOptions::default(),
    )
    .await
    .unwrap()
}

fn id(raw: &str) -> NodeId {
    NodeId::new(raw)
}

// ============================================================================
// HTTP remote
// ============================================================================

#[tokio::test]
async fn test_list_tree_recurses_into_collections() {
    let addr = serve(scenario_device()).await;
    let remote = remote(addr);

    assert!(remote.probe().await);

    let mut nodes = remote.list_tree().await.unwrap();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "A1", "A2", "cafe"]);

    let a = &nodes[0];
    assert_eq!(a.kind, NodeKind::Collection);
    assert_eq!(a.parent_id, None);

    let a1 = &nodes[1];
    assert_eq!(a1.parent_id, Some(id("A")));
    assert!(a1.bookmarked);
    assert_eq!(a1.content_version.as_deref(), Some("1"));

    assert_eq!(nodes[3].name, "Café");
}

#[tokio::test]
async fn test_fetch_content_streams_body() {
    let addr = serve(scenario_device()).await;
    let remote = remote(addr);

    let chunks: Vec<Vec<u8>> = remote
        .fetch_content(&id("A1"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"%PDF a1 v1");

    let missing = remote.fetch_content(&id("ghost")).await;
    assert!(matches!(missing, Err(RemoteError::NotFound(ref missing)) if missing == &id("ghost")));
}

#[tokio::test]
async fn test_stalled_transfer_fails_as_disconnect() {
    let device = scenario_device();
    device.stall("A2");
    let addr = serve(device).await;
    let remote = impatient_remote(addr);

    let fetched = tokio::time::timeout(Duration::from_secs(10), async {
        remote
            .fetch_content(&id("A2"))
            .await?
            .try_collect::<Vec<Vec<u8>>>()
            .await
    })
    .await
    .expect("read timeout never fired");

    assert!(matches!(fetched, Err(RemoteError::Disconnected(_))));
}

#[tokio::test]
async fn test_probe_fails_on_closed_port() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = remote(addr);
    assert!(!remote.probe().await);
    assert!(matches!(
        remote.list_tree().await,
        Err(RemoteError::Unreachable(_))
    ));
}

// ============================================================================
// Full client over HTTP and disk
// ============================================================================

#[tokio::test]
async fn test_sync_and_download_over_http() {
    let device = scenario_device();
    let addr = serve(Arc::clone(&device)).await;
    let temp_dir = TempDir::new().unwrap();
    let files = NativeFs::new(temp_dir.path());
    let options = DownloadOptions {
        extension: Some("pdf".to_string()),
        ..Default::default()
    };

    let mut sync = open(addr, temp_dir.path()).await;
    let changes = sync.get_changes().await.unwrap();
    assert_eq!(changes.summary().added, 4);

    let report = sync
        .download_tree("out", &filter::bookmarked(), &options)
        .await
        .unwrap();
    assert_eq!(report.outcome(), Outcome::Completed);
    assert_eq!(files.read("out/A/A1.pdf").await.unwrap(), b"%PDF a1 v1");
    assert!(!files.exists("out/A/A2.pdf").await.unwrap());
    assert!(files.exists("sessions/e2e.session").await.unwrap());
    assert_eq!(sync.state(), &RunState::Completed);

    // A1 edited on the device, then picked up by a new process
    device.put("A", record("A1", "A1", "DocumentType", 2, true), Some(b"%PDF a1 v2"));
    drop(sync);

    let mut sync = open(addr, temp_dir.path()).await;
    let changes = sync.get_changes().await.unwrap();
    assert_eq!(changes.status(&id("A1")), Some(ChangeKind::Modified));
    assert_eq!(changes.status(&id("A2")), Some(ChangeKind::Unchanged));

    let report = sync
        .download_changes("out", &filter::bookmarked(), &options)
        .await
        .unwrap();
    assert!(matches!(
        report.entry(&id("A1")).unwrap().status,
        EntryStatus::Downloaded { .. }
    ));
    assert_eq!(files.read("out/A/A1.pdf").await.unwrap(), b"%PDF a1 v2");
    assert!(!files.exists("out/A/A1.pdf.part").await.unwrap());

    // Repeating the download finds nothing left to fetch
    let report = sync
        .download_changes("out", &filter::bookmarked(), &options)
        .await
        .unwrap();
    assert_eq!(report.counts().downloaded, 0);
}

#[tokio::test]
async fn test_stalled_download_does_not_hang_the_run() {
    let device = scenario_device();
    device.stall("A2");
    let addr = serve(device).await;
    let temp_dir = TempDir::new().unwrap();
    let files = NativeFs::new(temp_dir.path());
    let options = DownloadOptions {
        concurrency: 1,
        extension: Some("pdf".to_string()),
        ..Default::default()
    };

    let mut sync = open_with(impatient_remote(addr), temp_dir.path()).await;
    let report = tokio::time::timeout(
        Duration::from_secs(30),
        sync.download_tree("out", &filter::all(), &options),
    )
    .await
    .expect("download never finished")
    .unwrap();

    // A1 lands, A2 times out, and the disconnect cancels what was left
    assert!(matches!(
        report.entry(&id("A1")).unwrap().status,
        EntryStatus::Downloaded { .. }
    ));
    assert!(matches!(
        report.entry(&id("A2")).unwrap().status,
        EntryStatus::Failed { .. }
    ));
    assert_eq!(report.entry(&id("cafe")).unwrap().status, EntryStatus::Cancelled);
    assert_eq!(report.outcome(), Outcome::PartialFailure { failed: 2 });
    assert_eq!(sync.state(), &RunState::PartialFailure { failed: 2 });
    assert!(!files.exists("out/A/A2.pdf").await.unwrap());
    assert!(!files.exists("out/A/A2.pdf.part").await.unwrap());
}
