//! Core data model shared by the pipeline, runner, and aggregators.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::repo::Commit;

/// Seconds per tick. A tick is one day of repository history.
pub const TICK_SECONDS: i64 = 86_400;

/// Stable identifier of a Git object (commit, tree, or blob).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash(pub [u8; 20]);

impl ObjectHash {
    /// All-zero hash, used as the "no object" sentinel.
    pub const ZERO: ObjectHash = ObjectHash([0u8; 20]);

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 20] = raw.try_into().ok()?;
        Some(ObjectHash(bytes))
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectHash::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid object hash"))
    }
}

/// One side of a change: a path plus the object it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Repository-relative path.
    pub path: String,
    /// Blob hash at this side of the change.
    pub hash: ObjectHash,
}

/// A single tree-diff entry. Renames surface as `Modify` with differing paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// File added.
    Insert {
        /// New entry.
        to: ChangeEntry,
    },
    /// File removed.
    Delete {
        /// Old entry.
        from: ChangeEntry,
    },
    /// File modified (or renamed when paths differ).
    Modify {
        /// Old entry.
        from: ChangeEntry,
        /// New entry.
        to: ChangeEntry,
    },
}

impl Change {
    /// Blob hashes this change references, skipping the zero sentinel.
    pub fn blob_hashes(&self) -> SmallVec<[ObjectHash; 2]> {
        let mut out = SmallVec::new();
        match self {
            Change::Insert { to } => out.push(to.hash),
            Change::Delete { from } => out.push(from.hash),
            Change::Modify { from, to } => {
                out.push(from.hash);
                out.push(to.hash);
            }
        }
        out.retain(|h| *h != ObjectHash::ZERO);
        out
    }

    /// Path on the new side, falling back to the old side for deletions.
    pub fn path(&self) -> &str {
        match self {
            Change::Insert { to } => &to.path,
            Change::Delete { from } => &from.path,
            Change::Modify { to, .. } => &to.path,
        }
    }
}

/// Immutable blob payload, reference-shared across cache, pipeline, and analyzers.
#[derive(Debug, Clone)]
pub struct BlobData {
    /// Raw file bytes.
    pub bytes: Bytes,
}

impl BlobData {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// One edit operation over Unicode scalar counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    /// Run of unchanged scalars.
    Equal(usize),
    /// Run of inserted scalars.
    Insert(usize),
    /// Run of deleted scalars.
    Delete(usize),
}

/// Textual diff of one modified file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Line count of the old revision.
    pub old_lines: usize,
    /// Line count of the new revision.
    pub new_lines: usize,
    /// Ordered edit script.
    pub ops: SmallVec<[EditOp; 8]>,
}

/// A parsed syntax-tree change for one file of one commit.
#[derive(Clone)]
pub struct UastChange {
    /// Path the parse applies to.
    pub path: String,
    /// Blob that was parsed.
    pub hash: ObjectHash,
    /// Opaque parsed payload owned by an arena; released at snapshot teardown.
    pub node: Arc<dyn crate::pipeline::uast::SyntaxTree>,
}

impl fmt::Debug for UastChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UastChange")
            .field("path", &self.path)
            .field("hash", &self.hash)
            .field("bytes", &self.node.byte_size())
            .finish()
    }
}

/// Everything the pipeline produces for one commit.
pub struct CommitData {
    /// Handle of the commit this data belongs to.
    pub commit: Arc<dyn Commit>,
    /// Position of the commit in the processed sequence.
    pub index: usize,
    /// Tree-diff against the previous commit (or initial-tree enumeration).
    pub changes: Vec<Change>,
    /// Blob payloads referenced by `changes`.
    pub blobs: FxHashMap<ObjectHash, Bytes>,
    /// Textual diffs for `Modify` changes, keyed by path.
    pub diffs: FxHashMap<String, FileDiff>,
    /// In-memory syntax-tree changes, when the commit was small enough.
    pub uast_changes: Option<Vec<UastChange>>,
    /// On-disk spill holding serialized syntax-tree changes for large commits.
    pub uast_spill: Option<PathBuf>,
}

impl fmt::Debug for CommitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitData")
            .field("index", &self.index)
            .field("commit", &self.commit.hash())
            .field("changes", &self.changes.len())
            .field("blobs", &self.blobs.len())
            .field("diffs", &self.diffs.len())
            .field("spilled", &self.uast_spill.is_some())
            .finish()
    }
}

/// Tick-coded record: the unit of flow from leaf analyzers to aggregators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tc {
    /// Commit the record was produced for.
    pub commit_hash: ObjectHash,
    /// Day offset from the repository's first commit.
    pub tick: u32,
    /// Dense author identifier from the identity table.
    pub author_id: u32,
    /// Committer timestamp, seconds since the epoch.
    pub timestamp: i64,
    /// Analyzer-specific payload. Records with no payload are dropped.
    pub payload: Option<serde_json::Value>,
}

impl Tc {
    /// Unstamped record carrying `payload`. The runner fills in the
    /// commit hash, tick, author, and timestamp exactly once.
    pub fn from_payload(payload: serde_json::Value) -> Self {
        Self {
            commit_hash: ObjectHash::ZERO,
            tick: 0,
            author_id: 0,
            timestamp: 0,
            payload: Some(payload),
        }
    }
}

/// Tick-aggregated record emitted by an aggregator flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    /// The tick this record covers.
    pub tick: u32,
    /// Aggregated payload.
    pub data: serde_json::Value,
}

/// Half-open commit-index interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBounds {
    /// First commit index in the chunk.
    pub start: usize,
    /// One past the last commit index.
    pub end: usize,
}

impl ChunkBounds {
    /// Number of commits covered.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// True when the interval covers nothing.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Dense interning table mapping author signatures to integer identifiers.
#[derive(Debug, Default, Clone)]
pub struct IdentityTable {
    ids: FxHashMap<String, u32>,
    names: Vec<String>,
}

impl IdentityTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning its dense identifier.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.ids.insert(name.to_owned(), id);
        self.names.push(name.to_owned());
        id
    }

    /// Reverse lookup.
    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Number of interned identities.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All interned names in identifier order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Rebuild a table from names in identifier order.
    pub fn from_names(names: Vec<String>) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id as u32))
            .collect();
        Self { ids, names }
    }
}

/// Maps commit timestamps to integer day offsets from the first commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickTable {
    first_timestamp: Option<i64>,
    current: u32,
}

impl TickTable {
    /// Table with no observed commits yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a commit timestamp, updating and returning the current tick.
    pub fn observe(&mut self, timestamp: i64) -> u32 {
        let first = *self.first_timestamp.get_or_insert(timestamp);
        let delta = timestamp.saturating_sub(first).max(0);
        self.current = (delta / TICK_SECONDS) as u32;
        self.current
    }

    /// Tick of the most recently observed commit.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Timestamp of the first observed commit, if any.
    pub fn first_timestamp(&self) -> Option<i64> {
        self.first_timestamp
    }

    /// Rebuild a table from checkpointed state.
    pub fn from_parts(first_timestamp: Option<i64>, current: u32) -> Self {
        Self {
            first_timestamp,
            current,
        }
    }
}

/// Per-commit metadata collected by the runner for `commits_by_tick` injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMeta {
    /// Tick the commit landed in.
    pub tick: u32,
    /// Committer timestamp.
    pub timestamp: i64,
    /// Author name as recorded in the identity table.
    pub author: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_hash_hex_round_trip() {
        let hash = ObjectHash([0xAB; 20]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(ObjectHash::from_hex(&hex), Some(hash));
        assert_eq!(ObjectHash::from_hex("zz"), None);
    }

    #[test]
    fn change_blob_hashes_skip_zero() {
        let change = Change::Modify {
            from: ChangeEntry {
                path: "a.rs".into(),
                hash: ObjectHash::ZERO,
            },
            to: ChangeEntry {
                path: "a.rs".into(),
                hash: ObjectHash([1; 20]),
            },
        };
        let hashes = change.blob_hashes();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0], ObjectHash([1; 20]));
    }

    #[test]
    fn identity_table_interns_densely() {
        let mut table = IdentityTable::new();
        let a = table.intern("alice <a@example.com>");
        let b = table.intern("bob <b@example.com>");
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.intern("alice <a@example.com>"), 0);
        assert_eq!(table.name(1), Some("bob <b@example.com>"));
    }

    #[test]
    fn tick_table_is_day_offset_from_first_commit() {
        let mut ticks = TickTable::new();
        assert_eq!(ticks.observe(1_000_000), 0);
        assert_eq!(ticks.observe(1_000_000 + TICK_SECONDS - 1), 0);
        assert_eq!(ticks.observe(1_000_000 + 3 * TICK_SECONDS), 3);
        assert_eq!(ticks.current(), 3);
    }

    #[test]
    fn chunk_bounds_len() {
        let chunk = ChunkBounds { start: 10, end: 30 };
        assert_eq!(chunk.len(), 20);
        assert!(!chunk.is_empty());
        assert!(ChunkBounds { start: 5, end: 5 }.is_empty());
    }
}
