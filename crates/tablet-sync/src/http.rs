//! HTTP client for the tablet's USB web interface.
//!
//! Listing: `POST /documents/` for the root and `POST /documents/{id}` for each
//! collection. Content: `GET /download/{id}/placeholder`, which the device
//! renders to PDF on the fly.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tablet_sync_core::node::{Node, NodeId, NodeKind};
use tablet_sync_core::remote::{ContentStream, RemoteError, RemoteTree, Result};
use tracing::{debug, trace};

/// Collections listed at once; the device serves requests one by one anyway.
const LIST_CONCURRENCY: usize = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest silence tolerated between two reads of a response. The device
/// renders PDFs on the fly, so the first byte can take a while.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VersionField {
    Number(u64),
    Text(String),
}

/// One entry of a `/documents/` listing.
#[derive(Debug, Deserialize)]
struct DeviceRecord {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "VissibleName")]
    visible_name: String,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "ModifiedClient")]
    modified_client: String,
    #[serde(rename = "Bookmarked", default)]
    bookmarked: bool,
    #[serde(rename = "Version", default)]
    version: Option<VersionField>,
}

impl DeviceRecord {
    fn into_node(self, parent: Option<&NodeId>) -> Result<Node> {
        let kind = match self.kind.as_str() {
            "CollectionType" => NodeKind::Collection,
            "DocumentType" => NodeKind::Document,
            other => {
                return Err(RemoteError::InvalidResponse(format!(
                    "unknown type {other:?} for {}",
                    self.id
                )));
            }
        };

        Ok(Node {
            id: NodeId::new(self.id),
            parent_id: parent.cloned(),
            name: repair_name(&self.visible_name),
            kind,
            modified_at: parse_timestamp(&self.modified_client)?,
            content_version: self.version.map(|v| match v {
                VersionField::Number(n) => n.to_string(),
                VersionField::Text(s) => s,
            }),
            bookmarked: self.bookmarked,
        })
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| RemoteError::InvalidResponse(format!("bad timestamp {raw:?}: {e}")))
}

/// Undo UTF-8 that was decoded as Latin-1 somewhere on the device.
///
/// Names that do not round-trip are returned unchanged.
pub fn repair_name(name: &str) -> String {
    if name.is_ascii() {
        return name.to_string();
    }
    let bytes: Option<Vec<u8>> = name
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    bytes
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| name.to_string())
}

fn map_error(e: reqwest::Error, context: &str) -> RemoteError {
    if e.is_connect() {
        RemoteError::Unreachable(format!("{context}: {e}"))
    } else if e.is_timeout() {
        RemoteError::Disconnected(format!("{context}: {e}"))
    } else if e.is_decode() {
        RemoteError::InvalidResponse(format!("{context}: {e}"))
    } else {
        RemoteError::Transport(format!("{context}: {e}"))
    }
}

/// Remote tree served by the device's web interface.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: &str, probe_timeout: Duration) -> Result<Self> {
        Self::with_read_timeout(base_url, probe_timeout, READ_TIMEOUT)
    }

    /// A transfer that stalls for `read_timeout` fails as `Disconnected`.
    pub fn with_read_timeout(
        base_url: &str,
        probe_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_collection(&self, parent: Option<NodeId>) -> Result<Vec<Node>> {
        let url = match &parent {
            Some(id) => format!("{}/documents/{}", self.base_url, id),
            None => format!("{}/documents/", self.base_url),
        };
        trace!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_error(e, &url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Transport(format!("{url} answered {status}")));
        }

        let records: Vec<DeviceRecord> = response.json().await.map_err(|e| map_error(e, &url))?;
        records
            .into_iter()
            .map(|record| record.into_node(parent.as_ref()))
            .collect()
    }
}

#[async_trait]
impl RemoteTree for HttpRemote {
    async fn probe(&self) -> bool {
        match self
            .client
            .get(&self.base_url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("Probe of {} failed: {}", self.base_url, e);
                false
            }
        }
    }

    async fn list_tree(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut listed: HashSet<NodeId> = HashSet::new();
        let mut frontier: Vec<Option<NodeId>> = vec![None];

        while !frontier.is_empty() {
            let levels: Vec<Vec<Node>> = stream::iter(frontier.drain(..))
                .map(|parent| self.list_collection(parent))
                .buffer_unordered(LIST_CONCURRENCY)
                .try_collect()
                .await?;

            for node in levels.into_iter().flatten() {
                // The device should never repeat a collection; don't loop if it does
                if node.is_collection() && listed.insert(node.id.clone()) {
                    frontier.push(Some(node.id.clone()));
                }
                nodes.push(node);
            }
        }

        debug!("Listed {} nodes from {}", nodes.len(), self.base_url);
        Ok(nodes)
    }

    async fn fetch_content(&self, id: &NodeId) -> Result<ContentStream> {
        let url = format!("{}/download/{}/placeholder", self.base_url, id);
        trace!("GET {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            // Connection refused mid-run means the cable is gone
            match map_error(e, &url) {
                RemoteError::Unreachable(msg) => RemoteError::Disconnected(msg),
                other => other,
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(id.clone()));
        }
        if !status.is_success() {
            return Err(RemoteError::Transport(format!("{url} answered {status}")));
        }

        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| map_error(e, &url))
            })
            .boxed())
    }
}
