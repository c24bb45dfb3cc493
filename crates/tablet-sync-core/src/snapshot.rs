//! Snapshot: a point-in-time view of the tablet's file tree.
//!
//! Nodes live in a flat id-keyed arena. Parent references are ids, and the
//! tree shape is validated once at build time (no orphans, no cycles, only
//! collections as parents). Paths for every node are resolved during the same
//! pass and memoized, so lookups afterwards are plain map reads.

use crate::node::{Node, NodeId, NodeKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Duplicate node id: {0}")]
    DuplicateId(NodeId),

    #[error("Node {id} references missing parent {parent}")]
    Orphan { id: NodeId, parent: NodeId },

    #[error("Node {id} has a document as parent ({parent})")]
    ParentNotCollection { id: NodeId, parent: NodeId },

    #[error("Cycle in parent chain at node {0}")]
    Cycle(NodeId),

    #[error("Node not found: {0}")]
    NotFound(NodeId),
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Immutable capture of the remote tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "SnapshotRecord")]
pub struct Snapshot {
    captured_at: DateTime<Utc>,
    nodes: BTreeMap<NodeId, Node>,
    /// Distance from the root per node; roots are 0
    depths: HashMap<NodeId, usize>,
    /// Children per collection, ordered by (name, id)
    children: HashMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
}

/// On-disk shape of a snapshot. Deserialized snapshots go through `build`.
#[derive(Deserialize)]
struct SnapshotRecord {
    captured_at: DateTime<Utc>,
    nodes: Vec<Node>,
}

#[derive(Serialize)]
struct SnapshotRecordRef<'a> {
    captured_at: DateTime<Utc>,
    nodes: Vec<&'a Node>,
}

impl TryFrom<SnapshotRecord> for Snapshot {
    type Error = TreeError;

    fn try_from(record: SnapshotRecord) -> Result<Self> {
        Self::build_at(record.nodes, record.captured_at)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SnapshotRecordRef {
            captured_at: self.captured_at,
            nodes: self.nodes.values().collect(),
        }
        .serialize(serializer)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.captured_at == other.captured_at && self.nodes == other.nodes
    }
}

impl Eq for Snapshot {}

impl Snapshot {
    /// Build a snapshot captured now.
    pub fn build(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        Self::build_at(nodes, Utc::now())
    }

    /// Build a snapshot with an explicit capture time.
    pub fn build_at(nodes: impl IntoIterator<Item = Node>, captured_at: DateTime<Utc>) -> Result<Self> {
        let mut arena = BTreeMap::new();
        for node in nodes {
            if arena.contains_key(&node.id) {
                return Err(TreeError::DuplicateId(node.id));
            }
            arena.insert(node.id.clone(), node);
        }

        for node in arena.values() {
            if let Some(parent) = &node.parent_id {
                match arena.get(parent) {
                    None => {
                        return Err(TreeError::Orphan {
                            id: node.id.clone(),
                            parent: parent.clone(),
                        });
                    }
                    Some(p) if p.kind != NodeKind::Collection => {
                        return Err(TreeError::ParentNotCollection {
                            id: node.id.clone(),
                            parent: parent.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let depths = resolve_depths(&arena)?;

        let mut roots = Vec::new();
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in arena.values() {
            match &node.parent_id {
                Some(parent) => children.entry(parent.clone()).or_default().push(node.id.clone()),
                None => roots.push(node.id.clone()),
            }
        }
        let order = |a: &NodeId, b: &NodeId| {
            let (na, nb) = (&arena[a], &arena[b]);
            na.name.cmp(&nb.name).then_with(|| na.id.cmp(&nb.id))
        };
        roots.sort_by(order);
        for list in children.values_mut() {
            list.sort_by(order);
        }

        Ok(Self {
            captured_at,
            nodes: arena,
            depths,
            children,
            roots,
        })
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Names from the root down to `id` (inclusive).
    ///
    /// `build` already rejected cycles, so the walk up always ends at a root.
    pub fn resolve_path(&self, id: &NodeId) -> Result<Vec<String>> {
        let depth = self.depth(id)?;
        let mut names = Vec::with_capacity(depth + 1);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current];
            names.push(node.name.clone());
            cursor = node.parent_id.as_ref();
        }
        names.reverse();
        Ok(names)
    }

    /// Number of ancestors of `id`.
    pub fn depth(&self, id: &NodeId) -> Result<usize> {
        self.depths
            .get(id)
            .copied()
            .ok_or_else(|| TreeError::NotFound(id.clone()))
    }

    /// Root-level nodes ordered by (name, id).
    pub fn roots(&self) -> impl Iterator<Item = &Node> {
        self.roots.iter().map(|id| &self.nodes[id])
    }

    /// Direct children of a collection ordered by (name, id).
    pub fn children(&self, id: &NodeId) -> impl Iterator<Item = &Node> {
        self.children
            .get(id)
            .into_iter()
            .flatten()
            .map(|child| &self.nodes[child])
    }

    /// Depth-first pre-order walk from the roots, yielding `(depth, node)`.
    pub fn walk(&self) -> Walk<'_> {
        let stack = self.roots.iter().rev().map(|id| (0, id)).collect();
        Walk {
            snapshot: self,
            stack,
        }
    }

    /// Ids of all bookmarked nodes.
    pub fn bookmarked_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.values().filter(|n| n.bookmarked).map(|n| &n.id)
    }

    /// Pruned copy holding bookmarked nodes, everything below bookmarked
    /// collections, and the ancestors needed to reach them.
    pub fn bookmarked_view(&self) -> Result<Snapshot> {
        let mut keep: HashSet<&NodeId> = HashSet::new();
        let mut inherited: Vec<bool> = Vec::new();

        for (depth, node) in self.walk() {
            inherited.truncate(depth);
            let marked = inherited.last().copied().unwrap_or(false) || node.bookmarked;
            inherited.push(marked);
            if marked {
                keep.insert(&node.id);
            }
        }

        let marked: Vec<&NodeId> = keep.iter().copied().collect();
        for id in marked {
            let mut cursor = self.nodes[id].parent_id.as_ref();
            while let Some(parent) = cursor {
                if !keep.insert(parent) {
                    break;
                }
                cursor = self.nodes[parent].parent_id.as_ref();
            }
        }

        let nodes = self
            .nodes
            .values()
            .filter(|n| keep.contains(&n.id))
            .cloned();
        Snapshot::build_at(nodes, self.captured_at)
    }

    /// Indented tree listing, `[D]` for collections and `[F]` for documents.
    pub fn display_tree(&self) -> TreeDisplay<'_> {
        TreeDisplay { snapshot: self }
    }
}

/// Depth of every node, each node visited at most once.
///
/// Walks up from each unresolved node until it hits a root or an already
/// resolved ancestor, then fills in the chain on the way back down. A node
/// seen twice within one upward walk means a cycle.
fn resolve_depths(arena: &BTreeMap<NodeId, Node>) -> Result<HashMap<NodeId, usize>> {
    let mut depths: HashMap<NodeId, usize> = HashMap::with_capacity(arena.len());

    for start in arena.keys() {
        if depths.contains_key(start) {
            continue;
        }

        let mut chain: Vec<&NodeId> = Vec::new();
        let mut on_chain: HashSet<&NodeId> = HashSet::new();
        let mut cursor = Some(start);
        // Depth the next node down the chain gets
        let mut next = 0;

        while let Some(id) = cursor {
            if let Some(&resolved) = depths.get(id) {
                next = resolved + 1;
                break;
            }
            if !on_chain.insert(id) {
                return Err(TreeError::Cycle(id.clone()));
            }
            chain.push(id);
            cursor = arena[id].parent_id.as_ref();
        }

        for id in chain.into_iter().rev() {
            depths.insert(id.clone(), next);
            next += 1;
        }
    }

    Ok(depths)
}

/// Depth-first iterator over a snapshot.
pub struct Walk<'a> {
    snapshot: &'a Snapshot,
    stack: Vec<(usize, &'a NodeId)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, id) = self.stack.pop()?;
        if let Some(children) = self.snapshot.children.get(id) {
            self.stack
                .extend(children.iter().rev().map(|child| (depth + 1, child)));
        }
        Some((depth, &self.snapshot.nodes[id]))
    }
}

pub struct TreeDisplay<'a> {
    snapshot: &'a Snapshot,
}

impl Display for TreeDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (depth, node) in self.snapshot.walk() {
            let marker = if node.is_collection() { "[D]" } else { "[F]" };
            let star = if node.bookmarked { " *" } else { "" };
            writeln!(f, "{:indent$}{} {}{}", "", marker, node.name, star, indent = depth * 4)?;
        }
        Ok(())
    }
}
