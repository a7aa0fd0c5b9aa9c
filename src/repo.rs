//! Contracts the engine consumes from the Git layer.
//!
//! The object model, tree-diff implementation, and on-disk format live
//! behind these traits; the engine only ever sees commit handles, change
//! lists, and blob bytes.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::model::{Change, ObjectHash};

/// Opaque handle to one commit.
pub trait Commit: Send + Sync {
    /// Commit hash.
    fn hash(&self) -> ObjectHash;
    /// Number of parents (0 for the root commit).
    fn parent_count(&self) -> usize;
    /// Committer timestamp, seconds since the epoch.
    fn timestamp(&self) -> i64;
    /// Author signature, `name <email>`.
    fn author(&self) -> String;
    /// Root tree of this commit.
    fn tree(&self) -> ObjectHash;
}

/// Commit traversal options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Follow only the first parent at merges. This is the default; merge
    /// interleaving under topological order is known to distort
    /// per-tick attribution, so disabling it is an explicit opt-in.
    pub first_parent: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { first_parent: true }
    }
}

/// Forward-only commit iterator. `skip` exists so a resumed run can fast
/// forward to its checkpointed position without materializing handles.
pub trait CommitIter: Send {
    /// Next commit in traversal order, or `None` at the end of history.
    fn next_commit(&mut self) -> Result<Option<Arc<dyn Commit>>>;
    /// Advance past `n` commits.
    fn skip(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            if self.next_commit()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Read-only repository handle.
pub trait Repository: Send + Sync {
    /// Filesystem path the repository was opened from.
    fn path(&self) -> &Path;
    /// Walk history according to `options`.
    fn log(&self, options: &LogOptions) -> Result<Box<dyn CommitIter>>;
    /// Look up a single commit by hash.
    fn lookup_commit(&self, hash: ObjectHash) -> Result<Arc<dyn Commit>>;
    /// Diff two trees. `old` of `None` enumerates `new` as an initial tree.
    fn diff_trees(&self, old: Option<ObjectHash>, new: ObjectHash) -> Result<Vec<Change>>;
    /// Fetch raw blob bytes.
    fn read_blob(&self, hash: ObjectHash) -> Result<Bytes>;
    /// Ask the underlying library to return freed native memory to the OS.
    fn release_native_memory(&self) {}
}
