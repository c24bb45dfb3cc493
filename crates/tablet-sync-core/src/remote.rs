//! RemoteTree trait: the device-facing side of the sync engine.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing (scriptable failures and disconnects)
//! - `HttpRemote` (in tablet-sync) - Talks to the tablet's USB web interface

use crate::node::{Node, NodeId};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node not found on device: {0}")]
    NotFound(NodeId),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// The device is gone, as opposed to one request failing.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_) | RemoteError::Disconnected(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Content of one document as a stream of chunks.
pub type ContentStream = BoxStream<'static, Result<Vec<u8>>>;

/// Read-only view of the device's file tree.
#[async_trait]
pub trait RemoteTree: Send + Sync {
    /// Whether the device answers at all.
    async fn probe(&self) -> bool;

    /// Every node currently on the device.
    async fn list_tree(&self) -> Result<Vec<Node>>;

    /// Content of one document.
    async fn fetch_content(&self, id: &NodeId) -> Result<ContentStream>;
}

#[async_trait]
impl<T: RemoteTree + ?Sized> RemoteTree for Arc<T> {
    async fn probe(&self) -> bool {
        (**self).probe().await
    }

    async fn list_tree(&self) -> Result<Vec<Node>> {
        (**self).list_tree().await
    }

    async fn fetch_content(&self, id: &NodeId) -> Result<ContentStream> {
        (**self).fetch_content(id).await
    }
}

#[derive(Default)]
struct RemoteState {
    nodes: Vec<Node>,
    content: HashMap<NodeId, Vec<u8>>,
    unreachable: bool,
    failing: HashSet<NodeId>,
    disconnect_on: HashSet<NodeId>,
    broken_streams: HashSet<NodeId>,
    fetches: HashMap<NodeId, usize>,
    probes: usize,
}

/// In-memory device for testing
pub struct InMemoryRemote {
    state: RwLock<RemoteState>,
    chunk_size: usize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RemoteState::default()),
            chunk_size: 4096,
        }
    }

    /// Split content into chunks of this size when streaming.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RemoteState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RemoteState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a node (matched by id) along with its content.
    pub fn upsert(&self, node: Node, content: impl Into<Vec<u8>>) {
        let mut state = self.write();
        state.content.insert(node.id.clone(), content.into());
        match state.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => state.nodes.push(node),
        }
    }

    pub fn remove(&self, id: &NodeId) {
        let mut state = self.write();
        state.nodes.retain(|n| &n.id != id);
        state.content.remove(id);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.write().unreachable = !reachable;
    }

    /// Make fetches of `id` fail with a transport error.
    pub fn fail_fetch(&self, id: impl Into<NodeId>) {
        self.write().failing.insert(id.into());
    }

    /// Make the device vanish when `id` is fetched.
    pub fn disconnect_on_fetch(&self, id: impl Into<NodeId>) {
        self.write().disconnect_on.insert(id.into());
    }

    /// Deliver the first chunk of `id`, then fail the stream.
    pub fn break_stream(&self, id: impl Into<NodeId>) {
        self.write().broken_streams.insert(id.into());
    }

    pub fn fetch_count(&self, id: &NodeId) -> usize {
        self.read().fetches.get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.read().fetches.values().sum()
    }

    pub fn probe_count(&self) -> usize {
        self.read().probes
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTree for InMemoryRemote {
    async fn probe(&self) -> bool {
        let mut state = self.write();
        state.probes += 1;
        !state.unreachable
    }

    async fn list_tree(&self) -> Result<Vec<Node>> {
        let state = self.read();
        if state.unreachable {
            return Err(RemoteError::Unreachable("in-memory device offline".into()));
        }
        Ok(state.nodes.clone())
    }

    async fn fetch_content(&self, id: &NodeId) -> Result<ContentStream> {
        let mut state = self.write();
        if state.unreachable {
            return Err(RemoteError::Unreachable("in-memory device offline".into()));
        }
        *state.fetches.entry(id.clone()).or_default() += 1;

        if state.disconnect_on.contains(id) {
            state.unreachable = true;
            return Err(RemoteError::Disconnected(format!("lost device while fetching {id}")));
        }
        if state.failing.contains(id) {
            return Err(RemoteError::Transport(format!("fetch of {id} failed")));
        }

        let content = state
            .content
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;

        let mut chunks: Vec<Result<Vec<u8>>> = content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        if state.broken_streams.contains(id) {
            chunks.truncate(1);
            chunks.push(Err(RemoteError::Transport("connection reset mid-transfer".into())));
        }

        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use futures::TryStreamExt;

    fn doc(id: &str) -> Node {
        Node::document(id, id, DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    async fn collect(stream: ContentStream) -> Result<Vec<u8>> {
        let chunks: Vec<Vec<u8>> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_inmemory_remote_lists_and_streams() {
        let remote = InMemoryRemote::new().with_chunk_size(3);
        remote.upsert(doc("a"), b"hello world".to_vec());

        assert!(remote.probe().await);
        assert_eq!(remote.list_tree().await.unwrap().len(), 1);

        let content = collect(remote.fetch_content(&"a".into()).await.unwrap()).await.unwrap();
        assert_eq!(content, b"hello world");
        assert_eq!(remote.fetch_count(&"a".into()), 1);
    }

    #[tokio::test]
    async fn test_inmemory_remote_failure_modes() {
        let remote = InMemoryRemote::new().with_chunk_size(2);
        remote.upsert(doc("bad"), b"xx".to_vec());
        remote.upsert(doc("broken"), b"abcdef".to_vec());
        remote.upsert(doc("gone"), b"zz".to_vec());
        remote.fail_fetch("bad");
        remote.break_stream("broken");
        remote.disconnect_on_fetch("gone");

        let err = remote.fetch_content(&"bad".into()).await.err().unwrap();
        assert!(!err.is_disconnect());

        let stream = remote.fetch_content(&"broken".into()).await.unwrap();
        assert!(collect(stream).await.is_err());

        let err = remote.fetch_content(&"gone".into()).await.err().unwrap();
        assert!(err.is_disconnect());
        assert!(!remote.probe().await);
        assert!(remote.list_tree().await.is_err());
    }
}
