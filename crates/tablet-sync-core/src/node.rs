//! Node: one file or collection on the tablet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Stable identifier assigned by the device.
///
/// This is the only key used for identity across syncs. Names and paths can
/// change between runs, ids cannot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters of the id, used to disambiguate local names.
    pub fn short(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Document,
    Collection,
}

impl NodeKind {
    pub fn is_collection(self) -> bool {
        matches!(self, NodeKind::Collection)
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Document => f.write_str("document"),
            NodeKind::Collection => f.write_str("collection"),
        }
    }
}

/// A file or collection as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Containing collection, `None` for root-level nodes
    pub parent_id: Option<NodeId>,
    /// Display name (not unique)
    pub name: String,
    pub kind: NodeKind,
    /// Device-reported last modification time
    pub modified_at: DateTime<Utc>,
    /// Opaque revision marker, preferred over `modified_at` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_version: Option<String>,
    #[serde(default)]
    pub bookmarked: bool,
}

impl Node {
    pub fn document(id: impl Into<NodeId>, name: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.into(),
            kind: NodeKind::Document,
            modified_at,
            content_version: None,
            bookmarked: false,
        }
    }

    pub fn collection(id: impl Into<NodeId>, name: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            kind: NodeKind::Collection,
            ..Self::document(id, name, modified_at)
        }
    }

    pub fn with_parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.content_version = Some(version.into());
        self
    }

    pub fn bookmarked(mut self, bookmarked: bool) -> Self {
        self.bookmarked = bookmarked;
        self
    }

    pub fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// Revision marker of this node's content.
    ///
    /// The content version when the device reports one, otherwise the
    /// modification time.
    pub fn revision(&self) -> Revision {
        match &self.content_version {
            Some(version) => Revision::Version(version.clone()),
            None => Revision::Modified(self.modified_at),
        }
    }
}

/// What a node's content looked like at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Revision {
    Version(String),
    Modified(DateTime<Utc>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_handles_short_and_long_ids() {
        let id = NodeId::new("0123456789abcdef");
        assert_eq!(id.short(8), "01234567");

        let id = NodeId::new("abc");
        assert_eq!(id.short(8), "abc");
    }

    #[test]
    fn test_revision_prefers_content_version() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let plain = Node::document("a", "A", at);
        assert_eq!(plain.revision(), Revision::Modified(at));

        let versioned = plain.with_version("7");
        assert_eq!(versioned.revision(), Revision::Version("7".into()));
    }

    #[test]
    fn test_node_serializes_without_empty_version() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let node = Node::collection("c", "Notes", at).bookmarked(true);
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["kind"], "collection");
        assert!(json.get("content_version").is_none());
        assert_eq!(json["bookmarked"], true);
    }
}
