//! Streaming orchestrator: ties the scheduler, planner, pipeline, runner,
//! hibernation, and checkpoints into the chunked execution loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::analyze::{Analyzer, ReportMap, StoreWriter};
use crate::checkpoint::{AggregatorSpillRef, CheckpointManager, StreamingState};
use crate::config::{EngineConfig, StreamingMode};
use crate::error::{EngineError, Result};
use crate::hibernate::{hibernate_and_boot, spill_if_over_budget, SpillGuard};
use crate::memory::{pressure_level, trim_native_allocator, MemorySnapshot, PressureLevel, RuntimeTuning};
use crate::model::{ChunkBounds, ObjectHash};
use crate::pipeline::uast::UastParser;
use crate::pipeline::{CommitStream, Coordinator, PipelineCaches, PipelineStats};
use crate::plan::budget::MAX_CHUNK;
use crate::plan::{
    compute_schedule, AdaptivePlanner, ChunkObservation, GrowthEstimates, PlannerStats, Schedule,
    ScheduleInputs,
};
use crate::repo::{Commit, CommitIter, LogOptions, Repository};
use crate::runner::Runner;

/// How long a stale prefetch is given to drain before being detached.
pub const PREFETCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-run statistics surfaced next to the report map.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Adaptive planner figures.
    pub planner: PlannerStats,
    /// Pipeline stage timings and cache counters.
    pub pipeline: PipelineStats,
    /// Largest `max(heap, rss)` observed at a chunk boundary.
    pub peak_used_bytes: u64,
    /// Hibernation cycles performed.
    pub hibernation_cycles: u64,
    /// Chunks fully processed.
    pub chunks_processed: u64,
    /// Checkpoints written.
    pub checkpoints_saved: u64,
    /// TCs routed across the whole run.
    pub total_tcs: u64,
}

/// Final result of a run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Per-analyzer reports. Empty (but present) in TC-sink mode.
    pub reports: ReportMap,
    /// Run statistics.
    pub stats: EngineStats,
}

/// Callback invoked after each completed chunk.
pub type ChunkHook = Box<dyn FnMut(&mut Runner, usize) -> Result<()> + Send>;

enum CommitSource {
    Materialized(Vec<Arc<dyn Commit>>),
    Forward {
        iter: Box<dyn CommitIter>,
        position: usize,
    },
}

impl CommitSource {
    fn chunk_commits(&mut self, chunk: ChunkBounds) -> Result<Vec<Arc<dyn Commit>>> {
        match self {
            CommitSource::Materialized(commits) => {
                Ok(commits[chunk.start..chunk.end.min(commits.len())].to_vec())
            }
            CommitSource::Forward { iter, position } => {
                if *position < chunk.start {
                    iter.skip(chunk.start - *position)?;
                    *position = chunk.start;
                }
                if *position != chunk.start {
                    return Err(EngineError::Corruption(
                        "commit iterator is out of position".into(),
                    ));
                }
                let mut out = Vec::with_capacity(chunk.len());
                for _ in 0..chunk.len() {
                    match iter.next_commit()? {
                        Some(commit) => out.push(commit),
                        None => break,
                    }
                }
                *position += out.len();
                Ok(out)
            }
        }
    }

    fn supports_prefetch(&self) -> bool {
        matches!(self, CommitSource::Materialized(_))
    }

    fn tree_before(&self, index: usize) -> Option<ObjectHash> {
        match self {
            CommitSource::Materialized(commits) => index
                .checked_sub(1)
                .and_then(|i| commits.get(i))
                .map(|c| c.tree()),
            CommitSource::Forward { .. } => None,
        }
    }
}

/// Drives a full analysis run under the memory budget.
pub struct StreamingOrchestrator {
    repo: Arc<dyn Repository>,
    runner: Runner,
    coordinator: Coordinator,
    caches: Arc<PipelineCaches>,
    config: EngineConfig,
    guard: SpillGuard,
    checkpoint: Option<CheckpointManager>,
    checkpoint_enabled: bool,
    cancel: Arc<AtomicBool>,
    tuning: RuntimeTuning,
    on_chunk_complete: Option<ChunkHook>,
    _agg_tmp: Option<TempDir>,
    stats: EngineStats,
}

impl StreamingOrchestrator {
    /// Assemble the orchestrator. `analyzers` lists plumbing first; the
    /// first `core_count` entries are plumbing.
    pub fn new(
        repo: Arc<dyn Repository>,
        analyzers: Vec<Box<dyn Analyzer>>,
        core_count: usize,
        parser: Option<Arc<dyn UastParser>>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let checkpoint = if config.checkpoint {
            let dir = config
                .checkpoint_dir
                .clone()
                .unwrap_or_else(|| repo.path().join(".gitmill-checkpoint"));
            Some(CheckpointManager::new(dir, repo.path()))
        } else {
            None
        };

        let (agg_root, agg_tmp) = match &checkpoint {
            Some(manager) => (manager.agg_spill_root(), None),
            None => {
                let tmp = tempfile::Builder::new().prefix("gitmill-agg-").tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        let mut agg_options = BTreeMap::new();
        agg_options.insert(
            "spill_dir".to_owned(),
            agg_root.to_string_lossy().into_owned(),
        );

        let mut runner = Runner::new(analyzers, core_count, config.leaf_workers, &agg_options)?;
        let checkpoint_enabled = checkpoint.is_some() && runner.all_checkpointable();
        if checkpoint.is_some() && !checkpoint_enabled {
            warn!("not every analyzer is checkpointable, checkpoints disabled");
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let caches = Arc::new(PipelineCaches::from_config(&config)?);
        let coordinator = Coordinator::new(
            Arc::clone(&repo),
            &config,
            Arc::clone(&caches),
            parser,
            Arc::clone(&cancel),
        )?;

        let guard = SpillGuard::install()?;
        guard.register(coordinator.spill_cleaner());
        if !checkpoint_enabled {
            // Checkpoint-owned aggregator spills must survive an abnormal
            // exit for resume; they are removed with the checkpoint itself.
            for cleaner in runner.spill_cleaners() {
                guard.register(cleaner);
            }
        }

        runner.initialize(repo.as_ref())?;

        Ok(Self {
            repo,
            runner,
            coordinator,
            caches,
            config,
            guard,
            checkpoint,
            checkpoint_enabled,
            cancel,
            tuning: RuntimeTuning::new(),
            on_chunk_complete: None,
            _agg_tmp: agg_tmp,
            stats: EngineStats::default(),
        })
    }

    /// Route TCs to a sink instead of aggregators.
    pub fn set_tc_sink(&mut self, sink: Box<dyn StoreWriter>) {
        self.runner.set_tc_sink(sink);
    }

    /// Install a per-chunk completion hook.
    pub fn set_on_chunk_complete(&mut self, hook: ChunkHook) {
        self.on_chunk_complete = Some(hook);
    }

    /// Flag that cancels the run when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run over the materialized commit list.
    pub fn run(mut self) -> Result<RunOutcome> {
        let commits = self.collect_commits()?;
        let total = commits.len();
        let source = CommitSource::Materialized(commits);
        let result = self.run_source(source, total);
        self.guard.cleanup();
        result
    }

    /// Run in iterator mode: commits are pulled chunk-at-a-time and freed
    /// after each chunk; buffering is disabled. `total` is the commit
    /// count of the sweep, obtained without materializing handles.
    pub fn run_with_iterator(mut self, total: usize) -> Result<RunOutcome> {
        let options = LogOptions {
            first_parent: self.config.first_parent,
        };
        let iter = self.repo.log(&options)?;
        let source = CommitSource::Forward { iter, position: 0 };
        let result = self.run_source(source, total);
        self.guard.cleanup();
        result
    }

    fn collect_commits(&self) -> Result<Vec<Arc<dyn Commit>>> {
        let options = LogOptions {
            first_parent: self.config.first_parent,
        };
        if !self.config.first_parent {
            warn!("topological order may interleave merge ticks; first-parent is the default for a reason");
        }
        let mut iter = self.repo.log(&options)?;
        let mut commits = Vec::new();
        while let Some(commit) = iter.next_commit()? {
            commits.push(commit);
        }
        Ok(commits)
    }

    fn build_schedule(&self, total: usize, iterator_mode: bool) -> (Schedule, bool) {
        let budget = self.config.memory_budget;
        let short_circuit =
            total <= 1 && !self.runner.has_tc_sink() && !self.checkpoint_enabled;
        let streaming = !short_circuit
            && match self.config.streaming {
                StreamingMode::On => true,
                StreamingMode::Off => false,
                StreamingMode::Auto => budget > 0 || total > MAX_CHUNK,
            };

        if !streaming {
            let chunks = if total == 0 {
                Vec::new()
            } else {
                vec![ChunkBounds {
                    start: 0,
                    end: total,
                }]
            };
            return (
                Schedule {
                    chunks,
                    chunk_size: total.max(1),
                    buffering_factor: 1,
                    agg_spill_budget: 0,
                },
                false,
            );
        }

        let inputs = ScheduleInputs {
            total_commits: total,
            memory_budget: budget,
            pipeline_overhead: self.config.pipeline_overhead,
            work_state_per_commit: self.runner.declared_work_state().max(1),
            avg_tc_size: self.runner.declared_avg_tc_size(),
            max_buffering: if iterator_mode {
                1
            } else {
                self.config.max_buffering
            },
        };
        (compute_schedule(&inputs), true)
    }

    fn run_source(&mut self, mut source: CommitSource, total: usize) -> Result<RunOutcome> {
        let budget = self.config.memory_budget;
        let iterator_mode = !source.supports_prefetch();
        let (schedule, streaming) = self.build_schedule(total, iterator_mode);
        let mut chunks = schedule.chunks.clone();
        if !streaming {
            debug!(total, "running single-pass");
        } else {
            info!(
                total,
                chunks = chunks.len(),
                chunk_size = schedule.chunk_size,
                buffering = schedule.buffering_factor,
                agg_spill_budget = schedule.agg_spill_budget,
                "streaming plan ready"
            );
        }

        let declared_work = self.runner.declared_work_state().max(1);
        let declared_tc = self.runner.declared_avg_tc_size();
        let declared = GrowthEstimates {
            work: declared_work,
            tc: declared_tc.max(1),
            // The budget split reserves half as much for aggregators as
            // for working state; predict accordingly.
            agg: (declared_work / 2).max(1),
        };
        let mut planner =
            AdaptivePlanner::new(total, budget, self.config.pipeline_overhead, declared);

        self.tuning
            .apply(self.config.gc_percent, self.config.ballast_size)?;

        let (start_chunk, mut prev_tree) = self.resolve_start(&chunks, total)?;
        let mut prefetched: VecDeque<(ChunkBounds, CommitStream)> = VecDeque::new();
        let buffering = schedule.buffering_factor;
        let mut last_commit: Option<Arc<dyn Commit>> = None;
        let mut i = start_chunk;

        while i < chunks.len() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            if i > start_chunk {
                hibernate_and_boot(&mut self.runner, self.repo.as_ref())?;
                self.stats.hibernation_cycles += 1;
                spill_if_over_budget(&mut self.runner, schedule.agg_spill_budget)?;
            }

            let chunk = chunks[i];
            let snapshot_pre = MemorySnapshot::capture();
            self.runner.begin_chunk()?;
            let agg_before = self.runner.aggregator_state_size();

            let stream = loop {
                match prefetched.pop_front() {
                    Some((bounds, stream)) if bounds == chunk => break stream,
                    Some((bounds, stale)) => {
                        debug!(?bounds, "draining prefetch invalidated by replan");
                        stale.drain(PREFETCH_DRAIN_TIMEOUT);
                    }
                    None => {
                        let commits = source.chunk_commits(chunk)?;
                        break self.coordinator.spawn(commits, chunk.start, prev_tree)?;
                    }
                }
            };

            if buffering >= 2 && source.supports_prefetch() {
                while prefetched.len() < buffering - 1 {
                    let next_index = i + 1 + prefetched.len();
                    if next_index >= chunks.len() {
                        break;
                    }
                    let next = chunks[next_index];
                    let next_prev = source.tree_before(next.start);
                    let commits = source.chunk_commits(next)?;
                    prefetched
                        .push_back((next, self.coordinator.spawn(commits, next.start, next_prev)?));
                }
            }

            while let Some(item) = stream.recv() {
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(EngineError::Cancelled);
                }
                let data = item?;
                last_commit = Some(Arc::clone(&data.commit));
                self.runner.consume(data)?;
            }
            self.runner.end_chunk()?;
            drop(stream);

            let snapshot_post = MemorySnapshot::capture();
            self.stats.peak_used_bytes = self.stats.peak_used_bytes.max(snapshot_post.used());
            self.stats.total_tcs += self.runner.tc_count();
            let agg_after = self.runner.aggregator_state_size();
            let commits_in_chunk = chunk.len().max(1) as u64;
            let total_delta = snapshot_post.delta_since(&snapshot_pre);
            let agg_delta = agg_after.saturating_sub(agg_before);
            let work_delta = total_delta.saturating_sub(agg_delta);
            let observation = ChunkObservation {
                chunk_index: i,
                chunk,
                work_growth: work_delta / commits_in_chunk,
                tc_payload: self.runner.tc_count() * declared.tc / commits_in_chunk,
                agg_growth: agg_delta / commits_in_chunk,
                current_chunks: chunks.clone(),
            };
            if let Some(new_chunks) = planner.observe(&observation) {
                chunks = new_chunks;
            }

            match pressure_level(snapshot_post.used(), budget) {
                PressureLevel::Critical => {
                    warn!(
                        used = snapshot_post.used(),
                        budget, "critical memory pressure, clearing caches"
                    );
                    self.caches.clear();
                    trim_native_allocator();
                }
                PressureLevel::Warning => {
                    warn!(used = snapshot_post.used(), budget, "memory pressure warning");
                }
                PressureLevel::None => {}
            }

            if self.checkpoint_enabled && i + 1 < chunks.len() {
                match self.save_checkpoint(i, &chunks, total, &last_commit) {
                    Ok(()) => self.stats.checkpoints_saved += 1,
                    // The run proceeds; no checkpoint is left behind.
                    Err(e) => warn!(error = %e, "checkpoint save failed, continuing"),
                }
            }

            if let Some(hook) = &mut self.on_chunk_complete {
                hook(&mut self.runner, i)?;
            }

            prev_tree = last_commit.as_ref().map(|c| c.tree());
            self.stats.chunks_processed += 1;
            i += 1;
        }

        for (_, stale) in prefetched {
            stale.drain(PREFETCH_DRAIN_TIMEOUT);
        }

        // Finalize before clearing: collect() still reads aggregator
        // spill frames that live under the checkpoint directory.
        let reports = self.runner.finalize()?;
        if let Some(manager) = &self.checkpoint {
            manager.clear()?;
        }
        self.stats.planner = planner.stats();
        self.stats.pipeline = self.coordinator.stats();
        Ok(RunOutcome {
            reports,
            stats: self.stats.clone(),
        })
    }

    /// Work out where to start: chunk 0, or a validated checkpoint.
    fn resolve_start(
        &mut self,
        chunks: &[ChunkBounds],
        total: usize,
    ) -> Result<(usize, Option<ObjectHash>)> {
        let Some(manager) = &self.checkpoint else {
            return Ok((0, None));
        };
        if self.config.clear_checkpoint {
            manager.clear()?;
            return Ok((0, None));
        }
        if !self.config.resume || !manager.exists() {
            return Ok((0, None));
        }

        let metadata = match manager.validate(&self.runner.analyzer_ids()) {
            Ok(metadata) => metadata,
            Err(e @ EngineError::Checkpoint(_)) => {
                crate::checkpoint::resume_disabled(&e);
                manager.clear()?;
                return Ok((0, None));
            }
            Err(other) => return Err(other),
        };

        let state = &metadata.streaming_state;
        let aligned = state.total == total
            && state.current_chunk < chunks.len()
            && chunks[state.current_chunk].start == state.processed;
        if !aligned {
            // Replanning after the save moved the boundaries; the
            // checkpoint no longer lines up with any chunk edge.
            warn!(
                processed = state.processed,
                chunk = state.current_chunk,
                "checkpoint does not align with the current plan, restarting"
            );
            manager.clear()?;
            return Ok((0, None));
        }

        let state = match manager.load(&mut self.runner) {
            Ok(state) => state,
            Err(e @ EngineError::Checkpoint(_)) => {
                crate::checkpoint::resume_disabled(&e);
                manager.clear()?;
                return Ok((0, None));
            }
            Err(other) => return Err(other),
        };

        let prev_tree = match state.last_commit_hash {
            Some(hash) => Some(self.repo.lookup_commit(hash)?.tree()),
            None => None,
        };
        info!(
            chunk = state.current_chunk,
            processed = state.processed,
            "resuming from checkpoint"
        );
        Ok((state.current_chunk, prev_tree))
    }

    fn save_checkpoint(
        &mut self,
        chunk_index: usize,
        chunks: &[ChunkBounds],
        total: usize,
        last_commit: &Option<Arc<dyn Commit>>,
    ) -> Result<()> {
        let Some(manager) = &self.checkpoint else {
            return Ok(());
        };
        self.runner.spill_aggregators()?;
        let aggregator_spills = self
            .runner
            .aggregator_spill_states()
            .into_iter()
            .map(|(analyzer, state)| AggregatorSpillRef {
                analyzer,
                dir: state.dir,
                count: state.count,
            })
            .collect();
        let state = StreamingState {
            total,
            processed: chunks[chunk_index].end,
            current_chunk: chunk_index + 1,
            total_chunks: chunks.len(),
            last_commit_hash: last_commit.as_ref().map(|c| c.hash()),
            last_tick: self.runner.current_tick(),
            aggregator_spills,
        };
        manager.save(&mut self.runner, state)
    }
}
