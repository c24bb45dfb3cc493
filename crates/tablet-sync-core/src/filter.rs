//! Filters: composable predicates deciding which nodes get downloaded.
//!
//! Every filter implements the single capability [`Filter::evaluate`]. The
//! built-ins, caller-supplied closures ([`custom`]) and the logical
//! combinators ([`And`], [`Or`], [`Not`]) all implement the same trait, so the
//! download engine only ever sees `&dyn Filter`.

use crate::diff::ChangeKind;
use crate::node::{Node, NodeKind};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid path pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A node presented to a filter, with its resolved path.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub node: &'a Node,
    /// Names from the root down to the node
    pub path: &'a [String],
}

impl<'a> Candidate<'a> {
    pub fn new(node: &'a Node, path: &'a [String]) -> Self {
        Self { node, path }
    }

    /// Path joined with `/`.
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }
}

/// Pure predicate over a node and its change status.
///
/// `status` is `None` in full-tree mode, when no change set is involved.
/// Implementations must not depend on evaluation order or carry state.
pub trait Filter: Send + Sync {
    fn evaluate(&self, candidate: &Candidate<'_>, status: Option<ChangeKind>) -> bool;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct All;

impl Filter for All {
    fn evaluate(&self, _: &Candidate<'_>, _: Option<ChangeKind>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bookmarked;

impl Filter for Bookmarked {
    fn evaluate(&self, candidate: &Candidate<'_>, _: Option<ChangeKind>) -> bool {
        candidate.node.bookmarked
    }
}

/// Passes anything whose status is not `Unchanged`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangedOnly;

impl Filter for ChangedOnly {
    fn evaluate(&self, _: &Candidate<'_>, status: Option<ChangeKind>) -> bool {
        status != Some(ChangeKind::Unchanged)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KindIs(pub NodeKind);

impl Filter for KindIs {
    fn evaluate(&self, candidate: &Candidate<'_>, _: Option<ChangeKind>) -> bool {
        candidate.node.kind == self.0
    }
}

/// Glob match against the `/`-joined path.
///
/// `*` matches within one path segment, `**` across segments, `?` one
/// character. Matching is anchored at both ends.
#[derive(Debug, Clone)]
pub struct PathMatches {
    pattern: String,
    regex: Regex,
}

impl PathMatches {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let regex = Regex::new(&glob_to_regex(pattern)).map_err(|source| FilterError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Filter for PathMatches {
    fn evaluate(&self, candidate: &Candidate<'_>, _: Option<ChangeKind>) -> bool {
        self.regex.is_match(&candidate.path_string())
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Caller-supplied predicate.
pub struct Custom<F>(F);

impl<F> Filter for Custom<F>
where
    F: Fn(&Candidate<'_>, Option<ChangeKind>) -> bool + Send + Sync,
{
    fn evaluate(&self, candidate: &Candidate<'_>, status: Option<ChangeKind>) -> bool {
        (self.0)(candidate, status)
    }
}

/// Passes when every inner filter passes. Empty passes everything.
pub struct And(Vec<Box<dyn Filter>>);

impl Filter for And {
    fn evaluate(&self, candidate: &Candidate<'_>, status: Option<ChangeKind>) -> bool {
        self.0.iter().all(|f| f.evaluate(candidate, status))
    }
}

/// Passes when any inner filter passes. Empty passes nothing.
pub struct Or(Vec<Box<dyn Filter>>);

impl Filter for Or {
    fn evaluate(&self, candidate: &Candidate<'_>, status: Option<ChangeKind>) -> bool {
        self.0.iter().any(|f| f.evaluate(candidate, status))
    }
}

pub struct Not(Box<dyn Filter>);

impl Filter for Not {
    fn evaluate(&self, candidate: &Candidate<'_>, status: Option<ChangeKind>) -> bool {
        !self.0.evaluate(candidate, status)
    }
}

impl And {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self(filters)
    }
}

impl Or {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self(filters)
    }
}

pub fn all() -> All {
    All
}

pub fn bookmarked() -> Bookmarked {
    Bookmarked
}

pub fn changed_only() -> ChangedOnly {
    ChangedOnly
}

pub fn kind_is(kind: NodeKind) -> KindIs {
    KindIs(kind)
}

pub fn path_matches(pattern: &str) -> Result<PathMatches, FilterError> {
    PathMatches::new(pattern)
}

pub fn custom<F>(predicate: F) -> Custom<F>
where
    F: Fn(&Candidate<'_>, Option<ChangeKind>) -> bool + Send + Sync,
{
    Custom(predicate)
}

pub fn and(a: impl Filter + 'static, b: impl Filter + 'static) -> And {
    And(vec![Box::new(a), Box::new(b)])
}

pub fn or(a: impl Filter + 'static, b: impl Filter + 'static) -> Or {
    Or(vec![Box::new(a), Box::new(b)])
}

pub fn not(filter: impl Filter + 'static) -> Not {
    Not(Box::new(filter))
}

/// Method-style composition for any filter.
pub trait FilterExt: Filter + Sized + 'static {
    fn and(self, other: impl Filter + 'static) -> And {
        and(self, other)
    }

    fn or(self, other: impl Filter + 'static) -> Or {
        or(self, other)
    }

    fn not(self) -> Not {
        not(self)
    }
}

impl<F: Filter + Sized + 'static> FilterExt for F {}
