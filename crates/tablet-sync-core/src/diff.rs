//! Diff engine: compares two snapshots by node id.
//!
//! Both snapshots keep their nodes in id order, so the change set comes out
//! of a single merge pass over the two sorted sequences: linear in the size of
//! both inputs, and deterministically ordered by id.

use crate::node::{Node, NodeId};
use crate::snapshot::Snapshot;

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// Change classification of a node between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub id: NodeId,
    pub kind: ChangeKind,
    /// Parent collection differs between the snapshots
    pub moved: bool,
    /// Display name differs between the snapshots
    pub renamed: bool,
}

impl ChangeEntry {
    fn new(id: NodeId, kind: ChangeKind) -> Self {
        Self {
            id,
            kind,
            moved: false,
            renamed: false,
        }
    }
}

/// Per-kind counts of a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub moved: usize,
}

impl Display for ChangeSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} modified, {} removed, {} unchanged ({} moved)",
            self.added, self.modified, self.removed, self.unchanged, self.moved
        )
    }
}

/// Result of comparing two snapshots. Entries are ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    entries: Vec<ChangeEntry>,
    index: HashMap<NodeId, usize>,
}

impl ChangeSet {
    fn from_entries(entries: Vec<ChangeEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.id.clone(), i))
            .collect();
        Self { entries, index }
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&ChangeEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn status(&self, id: &NodeId) -> Option<ChangeKind> {
        self.get(id).map(|entry| entry.kind)
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// True when anything other than `Unchanged` is present.
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|entry| entry.kind != ChangeKind::Unchanged)
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for entry in &self.entries {
            match entry.kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Removed => summary.removed += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Unchanged => summary.unchanged += 1,
            }
            if entry.moved {
                summary.moved += 1;
            }
        }
        summary
    }
}

/// Compare `previous` against `current`.
///
/// Without a baseline every node of `current` is `Added`.
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> ChangeSet {
    let Some(previous) = previous else {
        let entries = current
            .nodes()
            .map(|node| ChangeEntry::new(node.id.clone(), ChangeKind::Added))
            .collect();
        return ChangeSet::from_entries(entries);
    };

    let mut entries = Vec::with_capacity(current.len().max(previous.len()));
    let mut old = previous.nodes().peekable();
    let mut new = current.nodes().peekable();

    loop {
        let order = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(n)) => o.id.cmp(&n.id),
        };

        match order {
            Ordering::Less => {
                if let Some(o) = old.next() {
                    entries.push(ChangeEntry::new(o.id.clone(), ChangeKind::Removed));
                }
            }
            Ordering::Greater => {
                if let Some(n) = new.next() {
                    entries.push(ChangeEntry::new(n.id.clone(), ChangeKind::Added));
                }
            }
            Ordering::Equal => {
                if let (Some(o), Some(n)) = (old.next(), new.next()) {
                    entries.push(compare(o, n));
                }
            }
        }
    }

    ChangeSet::from_entries(entries)
}

fn compare(old: &Node, new: &Node) -> ChangeEntry {
    let modified = match (&old.content_version, &new.content_version) {
        (Some(a), Some(b)) => a != b,
        _ => old.modified_at != new.modified_at,
    };
    let kind = if modified {
        ChangeKind::Modified
    } else {
        ChangeKind::Unchanged
    };

    ChangeEntry {
        id: new.id.clone(),
        kind,
        moved: old.parent_id != new.parent_id,
        renamed: old.name != new.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use std::collections::HashSet;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn snapshot(nodes: Vec<Node>) -> Snapshot {
        Snapshot::build_at(nodes, at(0)).unwrap()
    }

    fn scenario(a1_version: &str) -> Snapshot {
        snapshot(vec![
            Node::collection("A", "A", at(0)),
            Node::document("A1", "A1", at(0))
                .with_parent("A")
                .bookmarked(true)
                .with_version(a1_version),
            Node::document("A2", "A2", at(0)).with_parent("A").with_version("v1"),
        ])
    }

    #[test]
    fn test_first_sync_marks_everything_added() {
        let current = scenario("v1");
        let changes = diff(None, &current);

        assert_eq!(changes.len(), 3);
        assert!(changes.entries().iter().all(|e| e.kind == ChangeKind::Added));
    }

    #[test]
    fn test_diff_is_reflexive() {
        let s = scenario("v1");
        let changes = diff(Some(&s), &s);

        assert_eq!(changes.len(), s.len());
        assert!(changes.entries().iter().all(|e| e.kind == ChangeKind::Unchanged));
        assert!(!changes.has_changes());
    }

    #[test]
    fn test_second_sync_detects_modified_version() {
        let first = scenario("v1");
        let second = scenario("v2");
        let changes = diff(Some(&first), &second);

        assert_eq!(changes.status(&"A".into()), Some(ChangeKind::Unchanged));
        assert_eq!(changes.status(&"A1".into()), Some(ChangeKind::Modified));
        assert_eq!(changes.status(&"A2".into()), Some(ChangeKind::Unchanged));
    }

    #[test]
    fn test_content_version_wins_over_clock_drift() {
        let old = snapshot(vec![Node::document("d", "D", at(0)).with_version("3")]);
        let new = snapshot(vec![Node::document("d", "D", at(3600)).with_version("3")]);
        assert_eq!(diff(Some(&old), &new).status(&"d".into()), Some(ChangeKind::Unchanged));
    }

    #[test]
    fn test_falls_back_to_timestamp_without_versions() {
        let old = snapshot(vec![
            Node::document("d", "D", at(0)),
            Node::document("e", "E", at(0)).with_version("1"),
        ]);
        let new = snapshot(vec![
            Node::document("d", "D", at(0) + Duration::seconds(1)),
            Node::document("e", "E", at(0)),
        ]);
        let changes = diff(Some(&old), &new);

        assert_eq!(changes.status(&"d".into()), Some(ChangeKind::Modified));
        // Version missing on one side: timestamps decide.
        assert_eq!(changes.status(&"e".into()), Some(ChangeKind::Unchanged));
    }

    #[test]
    fn test_move_is_a_subflag_of_unchanged() {
        let old = snapshot(vec![
            Node::collection("x", "X", at(0)),
            Node::collection("y", "Y", at(0)),
            Node::document("d", "D", at(0)).with_parent("x"),
        ]);
        let new = snapshot(vec![
            Node::collection("x", "X", at(0)),
            Node::collection("y", "Y", at(0)),
            Node::document("d", "Renamed", at(0)).with_parent("y"),
        ]);
        let changes = diff(Some(&old), &new);
        let entry = changes.get(&"d".into()).unwrap();

        assert_eq!(entry.kind, ChangeKind::Unchanged);
        assert!(entry.moved);
        assert!(entry.renamed);
        assert_eq!(changes.summary().moved, 1);
    }

    #[test]
    fn test_diff_is_complete_and_ordered() {
        let old = snapshot(vec![
            Node::document("b", "B", at(0)),
            Node::document("c", "C", at(0)),
            Node::document("e", "E", at(0)),
        ]);
        let new = snapshot(vec![
            Node::document("a", "A", at(0)),
            Node::document("c", "C", at(5)),
            Node::document("e", "E", at(0)),
            Node::document("f", "F", at(0)),
        ]);
        let changes = diff(Some(&old), &new);

        let ids: Vec<&str> = changes.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "e", "f"]);

        let union: HashSet<&str> = old.nodes().chain(new.nodes()).map(|n| n.id.as_str()).collect();
        assert_eq!(union.len(), changes.len());

        assert_eq!(
            changes.summary(),
            ChangeSummary {
                added: 2,
                removed: 1,
                modified: 1,
                unchanged: 1,
                moved: 0,
            }
        );

        let again = diff(Some(&old), &new);
        assert_eq!(again.entries(), changes.entries());
    }
}
