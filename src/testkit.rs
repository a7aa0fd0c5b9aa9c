//! Synthetic repositories and reference analyzers for tests and demos.
//!
//! The generator produces a deterministic linear history from a seed:
//! same seed, same commits, same blobs. The analyzers exercise every
//! capability the engine dispatches on (lightweight, cpu-heavy with
//! fork/merge, serial, hibernation, checkpointing, spill cleanup).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use xxhash_rust::xxh64::xxh64;

use crate::analyze::{
    Aggregator, Analyzer, Checkpointable, Hibernatable, Parallelizable, Report, SpillCleaner,
    SpillDirCleaner, StoreWriter, TickSumAggregator,
};
use crate::error::{EngineError, Result};
use crate::model::{Change, ChangeEntry, EditOp, ObjectHash, Tc, TICK_SECONDS};
use crate::pipeline::uast::{SyntaxTree, UastParser};
use crate::repo::{Commit, CommitIter, LogOptions, Repository};
use crate::runner::plumbing::{IdentityPlumbing, TicksPlumbing};
use crate::runner::ConsumeContext;

const BASE_TIMESTAMP: i64 = 1_600_000_000;

fn blob_hash(content: &[u8]) -> ObjectHash {
    let a = xxh64(content, 1).to_le_bytes();
    let b = xxh64(content, 2).to_le_bytes();
    let mut out = [0u8; 20];
    out[..8].copy_from_slice(&a);
    out[8..16].copy_from_slice(&b);
    out[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    ObjectHash(out)
}

fn synthetic_hash(kind: u64, seed: u64, index: u64) -> ObjectHash {
    let a = xxh64(&kind.to_le_bytes(), seed ^ index).to_le_bytes();
    let b = xxh64(&index.to_le_bytes(), seed.rotate_left(17) ^ kind).to_le_bytes();
    let mut out = [0u8; 20];
    out[..8].copy_from_slice(&a);
    out[8..16].copy_from_slice(&b);
    out[16..20].copy_from_slice(&(index as u32).to_le_bytes());
    ObjectHash(out)
}

struct SyntheticCommit {
    hash: ObjectHash,
    tree: ObjectHash,
    parent_count: usize,
    timestamp: i64,
    author: String,
}

impl Commit for SyntheticCommit {
    fn hash(&self) -> ObjectHash {
        self.hash
    }

    fn parent_count(&self) -> usize {
        self.parent_count
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn author(&self) -> String {
        self.author.clone()
    }

    fn tree(&self) -> ObjectHash {
        self.tree
    }
}

/// Deterministic in-memory repository with a linear history.
pub struct SyntheticRepo {
    path: PathBuf,
    commits: Vec<Arc<SyntheticCommit>>,
    index_by_tree: FxHashMap<ObjectHash, usize>,
    index_by_hash: FxHashMap<ObjectHash, usize>,
    changes: Vec<Vec<Change>>,
    states: Vec<BTreeMap<String, ObjectHash>>,
    blobs: FxHashMap<ObjectHash, Bytes>,
}

impl SyntheticRepo {
    /// Generate `commit_count` commits by `author_count` authors from a
    /// seed. Roughly every 37th commit is a wide sweep touching enough
    /// files to cross the parse-spill threshold.
    pub fn generate(seed: u64, commit_count: usize, author_count: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let authors: Vec<String> = (0..author_count.max(1))
            .map(|i| format!("dev{i} <dev{i}@example.com>"))
            .collect();

        let mut commits = Vec::with_capacity(commit_count);
        let mut changes = Vec::with_capacity(commit_count);
        let mut states: Vec<BTreeMap<String, ObjectHash>> = Vec::with_capacity(commit_count);
        let mut blobs = FxHashMap::default();
        let mut index_by_tree = FxHashMap::default();
        let mut index_by_hash = FxHashMap::default();

        let mut file_lines: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut state: BTreeMap<String, ObjectHash> = BTreeMap::new();
        let mut timestamp = BASE_TIMESTAMP;

        for index in 0..commit_count {
            if index > 0 {
                timestamp += rng.gen_range(1..=10) * 3600;
            }
            let author = authors[rng.gen_range(0..authors.len())].clone();

            let wide = index > 0 && index % 37 == 0;
            let touched = if wide { 40 } else { rng.gen_range(1..=3) };

            // One change per path per commit, like a real tree diff.
            let mut picked = Vec::with_capacity(touched);
            let mut taken = std::collections::BTreeSet::new();
            for f in 0..touched {
                let file_id = if index == 0 || wide {
                    f
                } else {
                    rng.gen_range(0..(8 + index.min(40)))
                };
                if taken.insert(file_id) {
                    picked.push((f, file_id));
                }
            }

            let mut commit_changes = Vec::new();
            for (f, file_id) in picked {
                let path = format!("src/file{file_id}.rs");
                let existing = file_lines.contains_key(&path);
                let delete = existing && touched <= 3 && rng.gen_ratio(1, 20);

                if delete {
                    let old_hash = state[&path];
                    file_lines.remove(&path);
                    state.remove(&path);
                    commit_changes.push(Change::Delete {
                        from: ChangeEntry {
                            path,
                            hash: old_hash,
                        },
                    });
                    continue;
                }

                let lines = file_lines.entry(path.clone()).or_default();
                let new_line = format!("fn item_{index}_{f}() {{ /* {} */ }}", rng.gen::<u32>());
                if !lines.is_empty() && rng.gen_ratio(1, 4) {
                    let at = rng.gen_range(0..lines.len());
                    lines[at] = new_line;
                } else {
                    lines.push(new_line);
                }
                let content = format!("{}\n", lines.join("\n"));
                let new_hash = blob_hash(content.as_bytes());
                blobs.insert(new_hash, Bytes::from(content));

                let change = if existing {
                    Change::Modify {
                        from: ChangeEntry {
                            path: path.clone(),
                            hash: state[&path],
                        },
                        to: ChangeEntry {
                            path: path.clone(),
                            hash: new_hash,
                        },
                    }
                } else {
                    Change::Insert {
                        to: ChangeEntry {
                            path: path.clone(),
                            hash: new_hash,
                        },
                    }
                };
                state.insert(path, new_hash);
                commit_changes.push(change);
            }

            let tree = synthetic_hash(1, seed, index as u64);
            let hash = synthetic_hash(2, seed, index as u64);
            index_by_tree.insert(tree, index);
            index_by_hash.insert(hash, index);
            commits.push(Arc::new(SyntheticCommit {
                hash,
                tree,
                parent_count: usize::from(index > 0),
                timestamp,
                author,
            }));
            changes.push(commit_changes);
            states.push(state.clone());
        }

        Self {
            path: PathBuf::from(format!("/synthetic/repo-{seed}")),
            commits,
            index_by_tree,
            index_by_hash,
            changes,
            states,
            blobs,
        }
    }

    /// Every commit handle in history order.
    pub fn commits(&self) -> Vec<Arc<dyn Commit>> {
        self.commits
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Commit>)
            .collect()
    }

    /// Number of commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// True when the history is empty.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Expected tick span of the generated history.
    pub fn tick_span(&self) -> u32 {
        match (self.commits.first(), self.commits.last()) {
            (Some(first), Some(last)) => {
                ((last.timestamp - first.timestamp) / TICK_SECONDS) as u32
            }
            _ => 0,
        }
    }

    fn state_diff(
        old: &BTreeMap<String, ObjectHash>,
        new: &BTreeMap<String, ObjectHash>,
    ) -> Vec<Change> {
        let mut out = Vec::new();
        for (path, &hash) in new {
            match old.get(path) {
                None => out.push(Change::Insert {
                    to: ChangeEntry {
                        path: path.clone(),
                        hash,
                    },
                }),
                Some(&old_hash) if old_hash != hash => out.push(Change::Modify {
                    from: ChangeEntry {
                        path: path.clone(),
                        hash: old_hash,
                    },
                    to: ChangeEntry {
                        path: path.clone(),
                        hash,
                    },
                }),
                Some(_) => {}
            }
        }
        for (path, &hash) in old {
            if !new.contains_key(path) {
                out.push(Change::Delete {
                    from: ChangeEntry {
                        path: path.clone(),
                        hash,
                    },
                });
            }
        }
        out
    }
}

struct SyntheticIter {
    commits: Vec<Arc<SyntheticCommit>>,
    position: usize,
}

impl CommitIter for SyntheticIter {
    fn next_commit(&mut self) -> Result<Option<Arc<dyn Commit>>> {
        let commit = self.commits.get(self.position).cloned();
        self.position += 1;
        Ok(commit.map(|c| c as Arc<dyn Commit>))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.position = (self.position + n).min(self.commits.len());
        Ok(())
    }
}

impl Repository for SyntheticRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn log(&self, _options: &LogOptions) -> Result<Box<dyn CommitIter>> {
        Ok(Box::new(SyntheticIter {
            commits: self.commits.clone(),
            position: 0,
        }))
    }

    fn lookup_commit(&self, hash: ObjectHash) -> Result<Arc<dyn Commit>> {
        self.index_by_hash
            .get(&hash)
            .map(|&i| Arc::clone(&self.commits[i]) as Arc<dyn Commit>)
            .ok_or_else(|| EngineError::Repository(format!("unknown commit {hash}")))
    }

    fn diff_trees(&self, old: Option<ObjectHash>, new: ObjectHash) -> Result<Vec<Change>> {
        let &index = self
            .index_by_tree
            .get(&new)
            .ok_or_else(|| EngineError::Repository(format!("unknown tree {new}")))?;
        match old {
            None => {
                // Initial-tree enumeration: every file is an insert.
                Ok(self.states[index]
                    .iter()
                    .map(|(path, &hash)| Change::Insert {
                        to: ChangeEntry {
                            path: path.clone(),
                            hash,
                        },
                    })
                    .collect())
            }
            Some(old_tree) => {
                if index > 0 && self.commits[index - 1].tree == old_tree {
                    return Ok(self.changes[index].clone());
                }
                let &old_index = self.index_by_tree.get(&old_tree).ok_or_else(|| {
                    EngineError::Repository(format!("unknown tree {old_tree}"))
                })?;
                Ok(Self::state_diff(&self.states[old_index], &self.states[index]))
            }
        }
    }

    fn read_blob(&self, hash: ObjectHash) -> Result<Bytes> {
        self.blobs
            .get(&hash)
            .cloned()
            .ok_or_else(|| EngineError::Repository(format!("unknown blob {hash}")))
    }
}

/// Counts-only syntax tree used by [`NullParser`].
pub struct CountingTree {
    bytes: usize,
}

impl SyntaxTree for CountingTree {
    fn byte_size(&self) -> usize {
        self.bytes
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok((self.bytes as u64).to_le_bytes().to_vec())
    }
}

/// Parser stand-in: supports `.rs` paths, records only blob sizes.
#[derive(Debug, Default)]
pub struct NullParser;

impl UastParser for NullParser {
    fn supports(&self, path: &str) -> bool {
        path.ends_with(".rs")
    }

    fn parse(&self, _path: &str, blob: &[u8]) -> Result<Arc<dyn SyntaxTree>> {
        Ok(Arc::new(CountingTree { bytes: blob.len() }))
    }
}

fn spill_dir_from(options: &BTreeMap<String, String>, analyzer: &str) -> Option<PathBuf> {
    options
        .get("spill_dir")
        .map(|root| Path::new(root).join(analyzer))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LineStatsState {
    total_added: u64,
    total_removed: u64,
    by_author: BTreeMap<u32, u64>,
}

/// Lightweight deterministic leaf: sums inserted/removed scalars.
#[derive(Default)]
pub struct LineStatsAnalyzer {
    state: LineStatsState,
    dormant: Option<Vec<u8>>,
    spill_dir: Option<PathBuf>,
}

impl Parallelizable for LineStatsAnalyzer {}

impl Hibernatable for LineStatsAnalyzer {
    fn hibernate(&mut self) -> Result<()> {
        let compact = serde_json::to_vec(&self.state)
            .map_err(|e| EngineError::Other(format!("hibernate failed: {e}")))?;
        self.state = LineStatsState::default();
        self.dormant = Some(compact);
        Ok(())
    }

    fn boot(&mut self) -> Result<()> {
        if let Some(compact) = self.dormant.take() {
            self.state = serde_json::from_slice(&compact)
                .map_err(|e| EngineError::Other(format!("boot failed: {e}")))?;
        }
        Ok(())
    }
}

impl Checkpointable for LineStatsAnalyzer {
    fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("line_stats.ckpt");
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let raw = std::fs::read(dir.join("line_stats.ckpt"))?;
        self.state =
            serde_json::from_slice(&raw).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }
}

impl Analyzer for LineStatsAnalyzer {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &str {
        "line_stats"
    }

    fn flag(&self) -> &str {
        "line-stats"
    }

    fn descriptor(&self) -> &str {
        "per-tick added/removed line statistics"
    }

    fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
        self.spill_dir = spill_dir_from(options, "line_stats");
        Ok(())
    }

    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>> {
        let mut added = 0u64;
        let mut removed = 0u64;
        for diff in ctx.data.diffs.values() {
            for op in &diff.ops {
                match op {
                    EditOp::Insert(n) => added += *n as u64,
                    EditOp::Delete(n) => removed += *n as u64,
                    EditOp::Equal(_) => {}
                }
            }
        }
        self.state.total_added += added;
        self.state.total_removed += removed;
        *self.state.by_author.entry(ctx.author_id).or_insert(0) += added;

        Ok(Some(Tc::from_payload(json!({
            "added": added,
            "removed": removed,
            "files": ctx.data.changes.len(),
        }))))
    }

    fn working_state_size(&self) -> u64 {
        64 * 1024
    }

    fn avg_tc_size(&self) -> u64 {
        96
    }

    fn new_aggregator(&self, _options: &BTreeMap<String, String>) -> Option<Box<dyn Aggregator>> {
        let dir = self.spill_dir.clone()?;
        Some(Box::new(TickSumAggregator::new(dir)))
    }

    fn deterministic(&self) -> bool {
        true
    }

    fn finalize(&mut self) -> Result<Report> {
        let mut report = Report::new();
        report.insert(
            "total_added".into(),
            serde_yaml::Value::from(self.state.total_added),
        );
        report.insert(
            "total_removed".into(),
            serde_yaml::Value::from(self.state.total_removed),
        );
        report.insert(
            "by_author".into(),
            serde_yaml::to_value(&self.state.by_author)
                .map_err(|e| EngineError::Other(e.to_string()))?,
        );
        // Placeholder; the runner injects the real map.
        report.insert("commits_by_tick".into(), serde_yaml::Value::Null);
        Ok(report)
    }

    fn as_parallelizable(&self) -> Option<&dyn Parallelizable> {
        Some(self)
    }

    fn as_hibernatable(&mut self) -> Option<&mut dyn Hibernatable> {
        Some(self)
    }

    fn as_checkpointable(&mut self) -> Option<&mut dyn Checkpointable> {
        Some(self)
    }

    fn as_spill_cleaner(&self) -> Option<Arc<dyn SpillCleaner>> {
        self.spill_dir.clone().map(|dir| {
            Arc::new(SpillDirCleaner { dir }) as Arc<dyn SpillCleaner>
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChurnState {
    counts: BTreeMap<String, u64>,
}

/// Cpu-heavy leaf: tracks per-file change frequency via fork/merge.
#[derive(Default)]
pub struct ChurnAnalyzer {
    state: ChurnState,
    spill_dir: Option<PathBuf>,
}

impl Parallelizable for ChurnAnalyzer {
    fn cpu_heavy(&self) -> bool {
        true
    }
}

impl Checkpointable for ChurnAnalyzer {
    fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("churn.ckpt");
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let raw = std::fs::read(dir.join("churn.ckpt"))?;
        self.state =
            serde_json::from_slice(&raw).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }
}

impl Analyzer for ChurnAnalyzer {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &str {
        "churn"
    }

    fn flag(&self) -> &str {
        "churn"
    }

    fn descriptor(&self) -> &str {
        "file change frequency"
    }

    fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
        self.spill_dir = spill_dir_from(options, "churn");
        Ok(())
    }

    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>> {
        for change in &ctx.data.changes {
            *self
                .state
                .counts
                .entry(change.path().to_owned())
                .or_insert(0) += 1;
        }
        Ok(Some(Tc::from_payload(json!({
            "touched": ctx.data.changes.len(),
        }))))
    }

    fn fork(&self, n: usize) -> Vec<Box<dyn Analyzer>> {
        (0..n)
            .map(|_| {
                Box::new(ChurnAnalyzer {
                    state: ChurnState::default(),
                    spill_dir: self.spill_dir.clone(),
                }) as Box<dyn Analyzer>
            })
            .collect()
    }

    fn merge(&mut self, forks: Vec<Box<dyn Analyzer>>) -> Result<()> {
        for mut fork in forks {
            let Some(churn) = fork.as_any_mut().downcast_mut::<ChurnAnalyzer>() else {
                return Err(EngineError::Other("churn merge received a foreign fork".into()));
            };
            for (path, count) in std::mem::take(&mut churn.state.counts) {
                *self.state.counts.entry(path).or_insert(0) += count;
            }
        }
        Ok(())
    }

    fn working_state_size(&self) -> u64 {
        128 * 1024
    }

    fn avg_tc_size(&self) -> u64 {
        48
    }

    fn new_aggregator(&self, _options: &BTreeMap<String, String>) -> Option<Box<dyn Aggregator>> {
        let dir = self.spill_dir.clone()?;
        Some(Box::new(TickSumAggregator::new(dir)))
    }

    fn finalize(&mut self) -> Result<Report> {
        let mut top: Vec<(&String, &u64)> = self.state.counts.iter().collect();
        top.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let top: Vec<serde_yaml::Value> = top
            .into_iter()
            .take(10)
            .map(|(path, count)| {
                serde_yaml::to_value((path, count)).unwrap_or(serde_yaml::Value::Null)
            })
            .collect();

        let mut report = Report::new();
        report.insert(
            "files_tracked".into(),
            serde_yaml::Value::from(self.state.counts.len() as u64),
        );
        report.insert("top_files".into(), serde_yaml::Value::Sequence(top));
        Ok(report)
    }

    fn as_parallelizable(&self) -> Option<&dyn Parallelizable> {
        Some(self)
    }

    fn as_checkpointable(&mut self) -> Option<&mut dyn Checkpointable> {
        Some(self)
    }

    fn as_spill_cleaner(&self) -> Option<Arc<dyn SpillCleaner>> {
        self.spill_dir.clone().map(|dir| {
            Arc::new(SpillDirCleaner { dir }) as Arc<dyn SpillCleaner>
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoState {
    commits_seen: u64,
}

/// Serial leaf: one TC per commit, strictly main-thread.
#[derive(Default)]
pub struct TcEchoAnalyzer {
    state: EchoState,
    spill_dir: Option<PathBuf>,
}

impl Parallelizable for TcEchoAnalyzer {
    fn sequential_only(&self) -> bool {
        true
    }
}

impl Checkpointable for TcEchoAnalyzer {
    fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("tc_echo.ckpt");
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let raw = std::fs::read(dir.join("tc_echo.ckpt"))?;
        self.state =
            serde_json::from_slice(&raw).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }
}

impl Analyzer for TcEchoAnalyzer {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &str {
        "tc_echo"
    }

    fn flag(&self) -> &str {
        "tc-echo"
    }

    fn descriptor(&self) -> &str {
        "emits one record per commit"
    }

    fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
        self.spill_dir = spill_dir_from(options, "tc_echo");
        Ok(())
    }

    fn consume(&mut self, _ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>> {
        self.state.commits_seen += 1;
        Ok(Some(Tc::from_payload(json!({ "commits": 1 }))))
    }

    fn avg_tc_size(&self) -> u64 {
        32
    }

    fn new_aggregator(&self, _options: &BTreeMap<String, String>) -> Option<Box<dyn Aggregator>> {
        let dir = self.spill_dir.clone()?;
        Some(Box::new(TickSumAggregator::new(dir)))
    }

    fn deterministic(&self) -> bool {
        true
    }

    fn finalize(&mut self) -> Result<Report> {
        let mut report = Report::new();
        report.insert(
            "commits_seen".into(),
            serde_yaml::Value::from(self.state.commits_seen),
        );
        Ok(report)
    }

    fn as_parallelizable(&self) -> Option<&dyn Parallelizable> {
        Some(self)
    }

    fn as_checkpointable(&mut self) -> Option<&mut dyn Checkpointable> {
        Some(self)
    }

    fn as_spill_cleaner(&self) -> Option<Arc<dyn SpillCleaner>> {
        self.spill_dir.clone().map(|dir| {
            Arc::new(SpillDirCleaner { dir }) as Arc<dyn SpillCleaner>
        })
    }
}

/// The standard test lineup: tick/identity plumbing plus one leaf from
/// each dispatch group. Returns `(analyzers, core_count)`.
pub fn standard_analyzers() -> (Vec<Box<dyn Analyzer>>, usize) {
    (
        vec![
            Box::new(TicksPlumbing) as Box<dyn Analyzer>,
            Box::new(IdentityPlumbing),
            Box::new(LineStatsAnalyzer::default()),
            Box::new(ChurnAnalyzer::default()),
            Box::new(TcEchoAnalyzer::default()),
        ],
        2,
    )
}

/// NDJSON TC sink: one JSON object per line, flushed at chunk boundaries.
pub struct NdjsonSink<W: std::io::Write + Send> {
    writer: std::io::BufWriter<W>,
    lines: u64,
}

impl<W: std::io::Write + Send> NdjsonSink<W> {
    /// Sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: std::io::BufWriter::new(writer),
            lines: 0,
        }
    }

    /// Records written so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }
}

impl<W: std::io::Write + Send> StoreWriter for NdjsonSink<W> {
    fn write_tc(&mut self, analyzer: &str, tc: &Tc) -> Result<()> {
        #[derive(Serialize)]
        struct Line<'a> {
            analyzer: &'a str,
            #[serde(flatten)]
            tc: &'a Tc,
        }
        serde_json::to_writer(&mut self.writer, &Line { analyzer, tc })
            .map_err(|e| EngineError::Other(format!("sink write failed: {e}")))?;
        std::io::Write::write_all(&mut self.writer, b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut self.writer)?;
        Ok(())
    }
}
