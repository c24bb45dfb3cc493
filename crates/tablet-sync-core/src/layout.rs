//! Destination layout: where each node lands under the download root.
//!
//! Collections become directories, documents become files, both named after
//! the device's display name. Siblings whose local names collide (compared
//! case-insensitively, since common desktop filesystems are) all get a
//! ` [<id prefix>]` suffix, widened to the full id while a clash remains, so
//! the outcome depends only on the sibling set and never maps two nodes to
//! one path.

use crate::node::{Node, NodeId};
use crate::snapshot::Snapshot;

use std::collections::{HashMap, HashSet};

/// Length of the id prefix used to disambiguate colliding names.
pub const ID_SUFFIX_LEN: usize = 8;

/// Relative local path of every node in a snapshot.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    paths: HashMap<NodeId, String>,
}

impl Layout {
    /// Lay out `snapshot`, appending `.{extension}` to document names.
    pub fn build(snapshot: &Snapshot, extension: Option<&str>) -> Self {
        let mut paths = HashMap::with_capacity(snapshot.len());
        let mut pending: Vec<(String, Vec<&Node>)> = vec![(String::new(), snapshot.roots().collect())];

        while let Some((base, siblings)) = pending.pop() {
            for (node, name) in local_names(&siblings, extension) {
                let path = if base.is_empty() {
                    name
                } else {
                    format!("{base}/{name}")
                };
                if node.is_collection() {
                    pending.push((path.clone(), snapshot.children(&node.id).collect()));
                }
                paths.insert(node.id.clone(), path);
            }
        }

        Self { paths }
    }

    pub fn path(&self, id: &NodeId) -> Option<&str> {
        self.paths.get(id).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suffix {
    None,
    Short,
    Full,
}

fn local_names<'a>(siblings: &[&'a Node], extension: Option<&str>) -> Vec<(&'a Node, String)> {
    let stems: Vec<String> = siblings.iter().map(|n| sanitize(&n.name, &n.id)).collect();
    let mut suffixes = vec![Suffix::None; siblings.len()];
    let name = |i: usize, suffix: Suffix| -> String {
        let node = siblings[i];
        let stem = match suffix {
            Suffix::None => stems[i].clone(),
            Suffix::Short => format!("{} [{}]", stems[i], node.id.short(ID_SUFFIX_LEN)),
            Suffix::Full => format!("{} [{}]", stems[i], node.id),
        };
        with_extension(node, &stem, extension)
    };

    let mut names: Vec<String> = (0..siblings.len()).map(|i| name(i, Suffix::None)).collect();
    for (i, clash) in colliding(&names).into_iter().enumerate() {
        if clash {
            suffixes[i] = Suffix::Short;
            names[i] = name(i, Suffix::Short);
        }
    }

    // A short suffix can still clash: ids sharing a prefix, or a sibling
    // literally named like a suffixed one. Only suffixed names grow.
    loop {
        let mut grew = false;
        for (i, clash) in colliding(&names).into_iter().enumerate() {
            if clash && suffixes[i] == Suffix::Short {
                suffixes[i] = Suffix::Full;
                names[i] = name(i, Suffix::Full);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let clashes = colliding(&names);
    if clashes.contains(&true) {
        number_remaining(siblings, &mut names, &clashes, extension);
    }

    siblings.iter().copied().zip(names).collect()
}

/// Lowercased-name collisions among `names`.
fn colliding(names: &[String]) -> Vec<bool> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for name in names {
        *counts.entry(name.to_lowercase()).or_default() += 1;
    }
    names.iter().map(|name| counts[&name.to_lowercase()] > 1).collect()
}

/// Last resort for names that still clash: in id order, the first keeps its
/// name and the rest get the lowest free ` (n)`.
fn number_remaining(siblings: &[&Node], names: &mut [String], clashes: &[bool], extension: Option<&str>) {
    let mut taken: HashSet<String> = names
        .iter()
        .zip(clashes)
        .filter(|(_, clash)| !**clash)
        .map(|(name, _)| name.to_lowercase())
        .collect();

    let mut order: Vec<usize> = (0..names.len()).filter(|&i| clashes[i]).collect();
    order.sort_by(|&a, &b| siblings[a].id.cmp(&siblings[b].id));

    for i in order {
        if taken.insert(names[i].to_lowercase()) {
            continue;
        }
        let node = siblings[i];
        let stem = match extension {
            Some(ext) if !node.is_collection() && !ext.is_empty() => names[i]
                .strip_suffix(&format!(".{ext}"))
                .unwrap_or(names[i].as_str())
                .to_string(),
            _ => names[i].clone(),
        };
        let mut n = 1;
        loop {
            let candidate = with_extension(node, &format!("{stem} ({n})"), extension);
            if taken.insert(candidate.to_lowercase()) {
                names[i] = candidate;
                break;
            }
            n += 1;
        }
    }
}

fn with_extension(node: &Node, stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !node.is_collection() && !ext.is_empty() => format!("{stem}.{ext}"),
        _ => stem.to_string(),
    }
}

/// Make a display name safe as a single path segment.
pub fn sanitize(name: &str, id: &NodeId) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    match trimmed {
        "" | "." | ".." => id.to_string(),
        _ => trimmed.to_string(),
    }
}
