//! Data Models
//!
//! Library records, the collection tree, and the proposals that describe
//! where records should be filed.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{ClerkError, Result};

/// Timestamp format Zotero uses for `dateAdded` (UTC, no zone suffix).
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a Zotero `dateAdded` value.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// Format a timestamp the way Zotero stores it.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(DATE_FORMAT).to_string()
}

/// The 8-character key Zotero assigns to every item and collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn parse(value: &str) -> Result<Self> {
        let valid = value.len() == 8
            && value
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(ClerkError::InvalidKey(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordKey {
    type Error = ClerkError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A collection path from the root, e.g. `Computer Science/AI/NLP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath(Vec<String>);

impl CollectionPath {
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .collect();

        if segments.is_empty() || segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(ClerkError::InvalidPath(segments.join("/")));
        }

        Ok(Self(segments))
    }

    /// Path of a collection that already exists. Zotero allows `/` inside a
    /// name, so segments are taken as stored; such paths display ambiguously
    /// and cannot be written back through [`CollectionPath::parse`].
    pub(crate) fn from_names(names: Vec<String>) -> Self {
        Self(names)
    }

    /// Parse a `/`-separated path.
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(ClerkError::InvalidPath(value.to_string()));
        }
        Self::new(value.split('/'))
            .map_err(|_| ClerkError::InvalidPath(value.to_string()))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn leaf(&self) -> &str {
        // never empty, see `new`
        &self.0[self.0.len() - 1]
    }

    /// The first `len` segments.
    pub fn prefix(&self, len: usize) -> Option<Self> {
        if len == 0 || len > self.0.len() {
            return None;
        }
        Some(Self(self.0[..len].to_vec()))
    }

    /// Lowercased segments, for case-insensitive comparison.
    pub fn folded(&self) -> Vec<String> {
        self.0.iter().map(|s| s.to_lowercase()).collect()
    }

    pub fn same_as(&self, other: &CollectionPath) -> bool {
        self.folded() == other.folded()
    }
}

impl TryFrom<String> for CollectionPath {
    type Error = ClerkError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Regular,
    Attachment,
    Note,
}

/// A bibliographic item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Internal row id
    #[serde(skip)]
    pub item_id: i64,
    pub key: RecordKey,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abstract_note: Option<String>,
    pub item_type: String,
    pub tags: Vec<String>,
    pub date_added: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<RecordKey>,
    pub kind: RecordKind,
}

impl Record {
    /// Only standalone regular items may be filed into collections.
    pub fn is_categorizable(&self) -> bool {
        self.kind == RecordKind::Regular && self.parent_key.is_none()
    }
}

/// A record that already lives in one or more collections.
#[derive(Debug, Clone, Serialize)]
pub struct FiledRecord {
    #[serde(flatten)]
    pub record: Record,
    pub collections: Vec<CollectionPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// The full collection hierarchy of the library.
#[derive(Debug, Clone, Default)]
pub struct CollectionTree {
    nodes: BTreeMap<i64, Collection>,
}

impl CollectionTree {
    pub fn from_collections(collections: impl IntoIterator<Item = Collection>) -> Self {
        Self {
            nodes: collections.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Collection> {
        self.nodes.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.nodes.values()
    }

    pub fn insert(&mut self, collection: Collection) {
        self.nodes.insert(collection.id, collection);
    }

    pub fn remove(&mut self, id: i64) -> Option<Collection> {
        self.nodes.remove(&id)
    }

    /// Parent of `id`, treating dangling parent references as roots.
    fn parent_of(&self, id: i64) -> Option<i64> {
        self.nodes
            .get(&id)
            .and_then(|c| c.parent_id)
            .filter(|p| self.nodes.contains_key(p))
    }

    /// Children of `parent` (`None` = top level), lowest id first.
    pub fn children(&self, parent: Option<i64>) -> impl Iterator<Item = &Collection> + '_ {
        self.nodes
            .values()
            .filter(move |c| self.parent_of(c.id) == parent)
    }

    /// Case-insensitive sibling lookup. The oldest match wins.
    pub fn find_child(&self, parent: Option<i64>, name: &str) -> Option<&Collection> {
        let wanted = name.trim().to_lowercase();
        self.children(parent)
            .find(|c| c.name.trim().to_lowercase() == wanted)
    }

    /// Look up an existing collection by path.
    pub fn find(&self, path: &CollectionPath) -> Option<&Collection> {
        let mut parent = None;
        let mut found = None;
        for segment in path.segments() {
            let node = self.find_child(parent, segment)?;
            parent = Some(node.id);
            found = Some(node);
        }
        found
    }

    pub fn depth_of(&self, id: i64) -> usize {
        let mut depth = 0;
        let mut current = Some(id);
        while let Some(cid) = current {
            depth += 1;
            if depth > self.nodes.len() {
                // cycle in parent references
                break;
            }
            current = self.parent_of(cid);
        }
        depth
    }

    pub fn path_of(&self, id: i64) -> Option<CollectionPath> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            let node = self.nodes.get(&cid)?;
            names.push(node.name.clone());
            if names.len() > self.nodes.len() {
                return None;
            }
            current = self.parent_of(cid);
        }
        names.reverse();
        Some(CollectionPath::from_names(names))
    }

    /// Every collection with its full path, sorted by path.
    pub fn paths(&self) -> Vec<(CollectionPath, &Collection)> {
        let mut out: Vec<_> = self
            .nodes
            .values()
            .filter_map(|c| self.path_of(c.id).map(|p| (p, c)))
            .collect();
        out.sort_by(|a, b| a.0.folded().cmp(&b.0.folded()));
        out
    }

    pub fn max_depth(&self) -> usize {
        self.nodes
            .keys()
            .map(|id| self.depth_of(*id))
            .max()
            .unwrap_or(0)
    }
}

/// Where one record should be filed, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub title: Option<String>,
    pub path: CollectionPath,
    pub tags: Vec<String>,
    pub rationale: String,
}

/// Proposed placements, keyed by record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    pub placements: BTreeMap<RecordKey, Placement>,
}

impl Proposal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RecordKey, placement: Placement) {
        self.placements.insert(key, placement);
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.placements.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &Placement)> {
        self.placements.iter()
    }

    /// Drop placements for records outside `keys`. Returns how many were dropped.
    pub fn retain_records(&mut self, keys: &HashSet<RecordKey>) -> usize {
        let before = self.placements.len();
        self.placements.retain(|k, _| keys.contains(k));
        before - self.placements.len()
    }
}

/// Move of an already filed record to a better collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub key: RecordKey,
    pub title: Option<String>,
    pub current: CollectionPath,
    pub target: CollectionPath,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorganizationPlan {
    pub moves: Vec<Move>,
}

impl ReorganizationPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }
}
