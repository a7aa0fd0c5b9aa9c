//! Commit pipeline: the staged producer that turns a slice of commits into
//! ordered [`CommitData`] units.
//!
//! Four stage threads connected by bounded channels: tree-diff, blob load,
//! textual diff, syntax-tree parse (with spill for oversized commits).
//! Stages two through four fan work out to a shared worker pool; each
//! stage reassembles results by slot before forwarding, so the output
//! channel observes strict input order while workers complete out of
//! order. A full downstream buffer blocks the upstream stage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tempfile::TempDir;
use tracing::debug;

use crate::analyze::SpillCleaner;
use crate::cache::{CacheBuilder, CacheStats, LruCache, SizeOfFn};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{Change, CommitData, FileDiff, ObjectHash, UastChange};
use crate::repo::{Commit, Repository};

pub mod diff;
pub mod pool;
pub mod uast;

use diff::DiffComputer;
use pool::{StallPolicy, WorkerPool};
use uast::{
    should_parse, UastParser, UastSpillWriter, MAX_PARALLEL_PARSES, PARSE_SEQUENTIAL_MAX,
    UAST_SPILL_THRESHOLD,
};

/// Diff cache key: `(old blob, new blob)`.
pub type DiffKey = (ObjectHash, ObjectHash);

/// Shared caches consulted by pipeline workers.
pub struct PipelineCaches {
    /// Blob payloads, bytes-bounded, Bloom pre-filtered.
    pub blobs: LruCache<ObjectHash, Bytes>,
    /// Textual diffs, entry-bounded.
    pub diffs: LruCache<DiffKey, FileDiff>,
}

impl PipelineCaches {
    /// Build both caches from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let size_of: SizeOfFn<Bytes> = Arc::new(|b| b.len() as u64);
        let expected_blobs = (config.blob_cache_size / 8192).clamp(1024, 1 << 20) as usize;
        let blobs = CacheBuilder::new()
            .max_bytes(config.blob_cache_size.max(1), size_of)
            .bloom(expected_blobs)
            .build()?;
        let diffs = CacheBuilder::new()
            .max_entries(config.diff_cache_size.max(1))
            .build()?;
        Ok(Self { blobs, diffs })
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.blobs.clear();
        self.diffs.clear();
    }
}

/// Wall time spent per stage plus item counters.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    tree_diff_nanos: AtomicU64,
    blob_nanos: AtomicU64,
    diff_nanos: AtomicU64,
    parse_nanos: AtomicU64,
    commits: AtomicU64,
    parses: AtomicU64,
    spilled_commits: AtomicU64,
}

impl PipelineCounters {
    fn record(&self, counter: &AtomicU64, elapsed: Duration) {
        counter.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Tree-diff stage wall time.
    pub tree_diff_ms: u64,
    /// Blob stage wall time.
    pub blob_ms: u64,
    /// Textual-diff stage wall time.
    pub diff_ms: u64,
    /// Parse stage wall time.
    pub parse_ms: u64,
    /// Commits emitted.
    pub commits: u64,
    /// Syntax trees parsed.
    pub parses: u64,
    /// Commits whose parses were spilled to disk.
    pub spilled_commits: u64,
    /// Blob cache counters.
    pub blob_cache: CacheStats,
    /// Diff cache counters.
    pub diff_cache: CacheStats,
}

struct StageItem {
    commit: Arc<dyn Commit>,
    index: usize,
    changes: Vec<Change>,
    blobs: FxHashMap<ObjectHash, Bytes>,
    diffs: FxHashMap<String, FileDiff>,
}

/// Ordered stream of pipeline output for one chunk.
pub struct CommitStream {
    receiver: Option<Receiver<Result<CommitData>>>,
    handles: Vec<JoinHandle<()>>,
}

impl CommitStream {
    /// Next commit's data, `None` when the chunk is exhausted.
    pub fn recv(&self) -> Option<Result<CommitData>> {
        self.receiver.as_ref()?.recv().ok()
    }

    /// Consume and discard remaining output. Used when a replan
    /// invalidates a prefetched chunk. Returns once the producers finish
    /// or `deadline` passes; a producer stalled in a native call past the
    /// deadline is detached rather than joined.
    pub fn drain(mut self, deadline: Duration) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let start = Instant::now();
        let mut finished = false;
        while start.elapsed() < deadline {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            // Dropping the handles detaches the stalled producers.
            self.handles.clear();
        }
    }
}

impl Drop for CommitStream {
    fn drop(&mut self) {
        // Dropping the receiver first unblocks any producer waiting on a
        // full channel; its send fails and the stage thread exits.
        self.receiver.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// The staged producer. One instance serves the whole run; `spawn` starts
/// the stage threads for one chunk.
pub struct Coordinator {
    repo: Arc<dyn Repository>,
    caches: Arc<PipelineCaches>,
    pool: Arc<WorkerPool>,
    differ: Arc<DiffComputer>,
    parser: Option<Arc<dyn UastParser>>,
    policy: StallPolicy,
    buffer_size: usize,
    batch_size: usize,
    arena_budget: u64,
    cancel: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    spill_dir: Arc<TempDir>,
}

impl Coordinator {
    /// Build the coordinator and its worker pool.
    pub fn new(
        repo: Arc<dyn Repository>,
        config: &EngineConfig,
        caches: Arc<PipelineCaches>,
        parser: Option<Arc<dyn UastParser>>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new("pipeline", config.workers)?);
        let spill_dir = Arc::new(
            tempfile::Builder::new()
                .prefix("gitmill-uast-")
                .tempdir()?,
        );
        Ok(Self {
            repo,
            caches,
            pool,
            differ: Arc::new(DiffComputer::default()),
            parser,
            policy: StallPolicy::with_timeout(Duration::from_millis(config.worker_timeout_ms)),
            buffer_size: config.buffer_size.max(1),
            batch_size: config.commit_batch_size.max(1),
            arena_budget: config.blob_arena_size,
            cancel,
            counters: Arc::new(PipelineCounters::default()),
            spill_dir,
        })
    }

    /// Install a custom primary differ.
    pub fn set_differ(&mut self, differ: DiffComputer) {
        self.differ = Arc::new(differ);
    }

    /// Counter snapshot including cache stats.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            tree_diff_ms: c.tree_diff_nanos.load(Ordering::Relaxed) / 1_000_000,
            blob_ms: c.blob_nanos.load(Ordering::Relaxed) / 1_000_000,
            diff_ms: c.diff_nanos.load(Ordering::Relaxed) / 1_000_000,
            parse_ms: c.parse_nanos.load(Ordering::Relaxed) / 1_000_000,
            commits: c.commits.load(Ordering::Relaxed),
            parses: c.parses.load(Ordering::Relaxed),
            spilled_commits: c.spilled_commits.load(Ordering::Relaxed),
            blob_cache: self.caches.blobs.stats(),
            diff_cache: self.caches.diffs.stats(),
        }
    }

    /// Cleaner that removes the parse spill directory; for the exit guard.
    pub fn spill_cleaner(&self) -> Arc<dyn SpillCleaner> {
        Arc::new(DirCleaner {
            path: self.spill_dir.path().to_path_buf(),
        })
    }

    /// Start the stage threads over `commits`. `start_index` is the global
    /// index of the first commit; `prev_tree` carries tree reuse across
    /// chunk boundaries.
    pub fn spawn(
        &self,
        commits: Vec<Arc<dyn Commit>>,
        start_index: usize,
        prev_tree: Option<ObjectHash>,
    ) -> Result<CommitStream> {
        let (tx1, rx1) = mpsc::sync_channel::<Result<StageItem>>(self.buffer_size);
        let (tx2, rx2) = mpsc::sync_channel::<Result<StageItem>>(self.buffer_size);
        let (tx3, rx3) = mpsc::sync_channel::<Result<StageItem>>(self.buffer_size);
        let (tx4, rx4) = mpsc::sync_channel::<Result<CommitData>>(self.buffer_size);

        let mut handles = Vec::with_capacity(4);
        handles.push(self.spawn_tree_diff(commits, start_index, prev_tree, tx1)?);
        handles.push(self.spawn_blob_load(rx1, tx2)?);
        handles.push(self.spawn_text_diff(rx2, tx3)?);
        handles.push(self.spawn_parse(rx3, tx4)?);

        Ok(CommitStream {
            receiver: Some(rx4),
            handles,
        })
    }

    fn spawn_tree_diff(
        &self,
        commits: Vec<Arc<dyn Commit>>,
        start_index: usize,
        mut prev_tree: Option<ObjectHash>,
        tx: SyncSender<Result<StageItem>>,
    ) -> Result<JoinHandle<()>> {
        let repo = Arc::clone(&self.repo);
        let cancel = Arc::clone(&self.cancel);
        let counters = Arc::clone(&self.counters);
        let handle = std::thread::Builder::new()
            .name("stage-tree-diff".into())
            .spawn(move || {
                for (offset, commit) in commits.into_iter().enumerate() {
                    if cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let index = start_index + offset;
                    let started = Instant::now();
                    let changes = repo.diff_trees(prev_tree, commit.tree());
                    counters.record(&counters.tree_diff_nanos, started.elapsed());
                    match changes {
                        Ok(changes) => {
                            prev_tree = Some(commit.tree());
                            let item = StageItem {
                                commit,
                                index,
                                changes,
                                blobs: FxHashMap::default(),
                                diffs: FxHashMap::default(),
                            };
                            if tx.send(Ok(item)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.at_commit(index)));
                            return;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    fn spawn_blob_load(
        &self,
        rx: Receiver<Result<StageItem>>,
        tx: SyncSender<Result<StageItem>>,
    ) -> Result<JoinHandle<()>> {
        let repo = Arc::clone(&self.repo);
        let caches = Arc::clone(&self.caches);
        let pool = Arc::clone(&self.pool);
        let cancel = Arc::clone(&self.cancel);
        let counters = Arc::clone(&self.counters);
        let policy = self.policy;
        let batch_size = self.batch_size;
        let handle = std::thread::Builder::new()
            .name("stage-blobs".into())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    let started = Instant::now();
                    let result =
                        load_blobs(&repo, &caches, &pool, policy, batch_size, &item.changes);
                    counters.record(&counters.blob_nanos, started.elapsed());
                    match result {
                        Ok(blobs) => {
                            item.blobs = blobs;
                            if tx.send(Ok(item)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.at_commit(item.index)));
                            return;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    fn spawn_text_diff(
        &self,
        rx: Receiver<Result<StageItem>>,
        tx: SyncSender<Result<StageItem>>,
    ) -> Result<JoinHandle<()>> {
        let caches = Arc::clone(&self.caches);
        let pool = Arc::clone(&self.pool);
        let differ = Arc::clone(&self.differ);
        let cancel = Arc::clone(&self.cancel);
        let counters = Arc::clone(&self.counters);
        let policy = self.policy;
        let handle = std::thread::Builder::new()
            .name("stage-diffs".into())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    let started = Instant::now();
                    let result = compute_diffs(&caches, &pool, &differ, policy, &item);
                    counters.record(&counters.diff_nanos, started.elapsed());
                    match result {
                        Ok(diffs) => {
                            item.diffs = diffs;
                            if tx.send(Ok(item)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.at_commit(item.index)));
                            return;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    fn spawn_parse(
        &self,
        rx: Receiver<Result<StageItem>>,
        tx: SyncSender<Result<CommitData>>,
    ) -> Result<JoinHandle<()>> {
        let pool = Arc::clone(&self.pool);
        let parser = self.parser.clone();
        let cancel = Arc::clone(&self.cancel);
        let counters = Arc::clone(&self.counters);
        let policy = self.policy;
        let arena_budget = self.arena_budget;
        let spill_dir = Arc::clone(&self.spill_dir);
        let handle = std::thread::Builder::new()
            .name("stage-parse".into())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    let started = Instant::now();
                    let index = item.index;
                    let result = parse_stage(
                        &pool,
                        parser.as_ref(),
                        policy,
                        arena_budget,
                        &spill_dir,
                        item,
                        &counters,
                    );
                    counters.record(&counters.parse_nanos, started.elapsed());
                    match result {
                        Ok(data) => {
                            counters.commits.fetch_add(1, Ordering::Relaxed);
                            if tx.send(Ok(data)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.at_commit(index)));
                            return;
                        }
                    }
                }
            })?;
        Ok(handle)
    }
}

fn load_blobs(
    repo: &Arc<dyn Repository>,
    caches: &PipelineCaches,
    pool: &WorkerPool,
    policy: StallPolicy,
    batch_size: usize,
    changes: &[Change],
) -> Result<FxHashMap<ObjectHash, Bytes>> {
    let mut wanted: Vec<ObjectHash> = Vec::new();
    let mut seen = FxHashSet::default();
    for change in changes {
        for hash in change.blob_hashes() {
            if seen.insert(hash) {
                wanted.push(hash);
            }
        }
    }

    let (mut found, missing) = caches.blobs.get_multi(&wanted);
    for batch in missing.chunks(batch_size) {
        let jobs: Vec<Box<dyn FnOnce() -> Result<(ObjectHash, Bytes)> + Send>> = batch
            .iter()
            .map(|&hash| {
                let repo = Arc::clone(repo);
                Box::new(move || repo.read_blob(hash).map(|bytes| (hash, bytes)))
                    as Box<dyn FnOnce() -> Result<(ObjectHash, Bytes)> + Send>
            })
            .collect();
        for (hash, bytes) in pool.run_batch("blob", policy, jobs)? {
            caches.blobs.put(hash, bytes.clone());
            found.insert(hash, bytes);
        }
    }
    Ok(found)
}

fn compute_diffs(
    caches: &PipelineCaches,
    pool: &WorkerPool,
    differ: &Arc<DiffComputer>,
    policy: StallPolicy,
    item: &StageItem,
) -> Result<FxHashMap<String, FileDiff>> {
    let mut out = FxHashMap::default();
    let mut misses: Vec<(String, DiffKey, Bytes, Bytes)> = Vec::new();

    for change in &item.changes {
        let Change::Modify { from, to } = change else {
            continue;
        };
        if from.hash == ObjectHash::ZERO || to.hash == ObjectHash::ZERO {
            continue;
        }
        let key = (from.hash, to.hash);
        if let Some(diff) = caches.diffs.get(&key) {
            out.insert(to.path.clone(), diff);
            continue;
        }
        let (Some(old), Some(new)) = (item.blobs.get(&from.hash), item.blobs.get(&to.hash)) else {
            continue;
        };
        misses.push((to.path.clone(), key, old.clone(), new.clone()));
    }

    if !misses.is_empty() {
        let jobs: Vec<Box<dyn FnOnce() -> Result<(String, DiffKey, FileDiff)> + Send>> = misses
            .into_iter()
            .map(|(path, key, old, new)| {
                let differ = Arc::clone(differ);
                Box::new(move || {
                    let diff = differ.compute(&old, &new)?;
                    Ok((path, key, diff))
                })
                    as Box<dyn FnOnce() -> Result<(String, DiffKey, FileDiff)> + Send>
            })
            .collect();
        for (path, key, diff) in pool.run_batch("diff", policy, jobs)? {
            caches.diffs.put(key, diff.clone());
            out.insert(path, diff);
        }
    }
    Ok(out)
}

fn parse_stage(
    pool: &WorkerPool,
    parser: Option<&Arc<dyn UastParser>>,
    policy: StallPolicy,
    arena_budget: u64,
    spill_dir: &TempDir,
    item: StageItem,
    counters: &PipelineCounters,
) -> Result<CommitData> {
    let StageItem {
        commit,
        index,
        changes,
        blobs,
        diffs,
    } = item;

    let mut data = CommitData {
        commit,
        index,
        changes,
        blobs,
        diffs,
        uast_changes: None,
        uast_spill: None,
    };

    let Some(parser) = parser else {
        return Ok(data);
    };

    let eligible: Vec<(String, ObjectHash)> = data
        .changes
        .iter()
        .filter_map(|change| match change {
            Change::Insert { to } | Change::Modify { to, .. } => {
                let size = data.blobs.get(&to.hash).map(Bytes::len)?;
                should_parse(parser.as_ref(), &to.path, size).then(|| (to.path.clone(), to.hash))
            }
            Change::Delete { .. } => None,
        })
        .collect();

    if eligible.is_empty() {
        return Ok(data);
    }

    let eligible_bytes: u64 = eligible
        .iter()
        .filter_map(|(_, hash)| data.blobs.get(hash))
        .map(|blob| blob.len() as u64)
        .sum();
    let over_arena = arena_budget > 0 && eligible_bytes > arena_budget;

    if data.changes.len() > UAST_SPILL_THRESHOLD || over_arena {
        // Large commit: parse one file at a time, serialize, release, so
        // peak native memory is bounded by a single parse.
        counters.spilled_commits.fetch_add(1, Ordering::Relaxed);
        let spill_path = spill_dir.path().join(format!("uast-{index}.bin"));
        let mut writer = UastSpillWriter::create(spill_path)?;
        for (path, hash) in eligible {
            let Some(blob) = data.blobs.get(&hash) else {
                continue;
            };
            let tree = parser.parse(&path, blob)?;
            counters.parses.fetch_add(1, Ordering::Relaxed);
            writer.append(&path, hash, tree.as_ref())?;
        }
        debug!(index, records = writer.records(), "spilled commit parses");
        data.uast_spill = Some(writer.finish()?);
        return Ok(data);
    }

    let mut parsed: Vec<UastChange> = Vec::with_capacity(eligible.len());
    if eligible.len() <= PARSE_SEQUENTIAL_MAX {
        for (path, hash) in eligible {
            let Some(blob) = data.blobs.get(&hash) else {
                continue;
            };
            let node = parser.parse(&path, blob)?;
            counters.parses.fetch_add(1, Ordering::Relaxed);
            parsed.push(UastChange { path, hash, node });
        }
    } else {
        for group in eligible.chunks(MAX_PARALLEL_PARSES) {
            let jobs: Vec<Box<dyn FnOnce() -> Result<Option<UastChange>> + Send>> = group
                .iter()
                .cloned()
                .map(|(path, hash)| {
                    let blob = data.blobs.get(&hash).cloned();
                    let parser = Arc::clone(parser);
                    Box::new(move || {
                        let Some(blob) = blob else {
                            return Ok(None);
                        };
                        let node = parser.parse(&path, &blob)?;
                        Ok(Some(UastChange { path, hash, node }))
                    })
                        as Box<dyn FnOnce() -> Result<Option<UastChange>> + Send>
                })
                .collect();
            for change in pool.run_batch("parse", policy, jobs)?.into_iter().flatten() {
                counters.parses.fetch_add(1, Ordering::Relaxed);
                parsed.push(change);
            }
        }
    }
    data.uast_changes = Some(parsed);
    Ok(data)
}

struct DirCleaner {
    path: std::path::PathBuf,
}

impl SpillCleaner for DirCleaner {
    fn cleanup_spills(&self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
