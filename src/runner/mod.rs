//! Leaf dispatcher: routes each commit's data through the plumbing
//! analyzers, then the leaves, stamping and delivering TCs.
//!
//! Plumbing runs strictly sequentially on the calling thread. Leaves are
//! grouped by capability: cpu-heavy leaves fork per worker and consume
//! plumbing snapshots off-thread, lightweight and serial leaves run
//! against the live state for cache locality. Worker TCs stay buffered
//! until the chunk ends, then drain in a deterministic order: analyzer
//! slot, worker index, observation order.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::analyze::{
    Aggregator, Analyzer, Report, ReportMap, SpillCleaner, SpillState, StoreWriter,
};
use crate::error::{EngineError, Result};
use crate::model::{CommitData, CommitMeta, IdentityTable, ObjectHash, Tc, TickTable};
use crate::repo::Repository;

pub mod plumbing;
pub mod snapshot;
pub mod workers;

use snapshot::PlumbingSnapshot;
use workers::LeafWorkerPool;

/// What an analyzer sees for one commit.
pub struct ConsumeContext<'a> {
    /// Pipeline output for the commit under consumption.
    pub data: &'a CommitData,
    /// Current tick. Zero while plumbing is still running.
    pub tick: u32,
    /// Current author id. Zero while plumbing is still running.
    pub author_id: u32,
    providers: Option<(&'a mut TickTable, &'a mut IdentityTable)>,
}

impl<'a> ConsumeContext<'a> {
    fn for_plumbing(
        data: &'a CommitData,
        ticks: &'a mut TickTable,
        identities: &'a mut IdentityTable,
    ) -> Self {
        Self {
            data,
            tick: 0,
            author_id: 0,
            providers: Some((ticks, identities)),
        }
    }

    /// Context for a leaf: stamped values, no provider access.
    pub fn for_leaf(data: &'a CommitData, tick: u32, author_id: u32) -> Self {
        Self {
            data,
            tick,
            author_id,
            providers: None,
        }
    }

    /// Mutable provider access. Present only for plumbing analyzers.
    pub fn providers(&mut self) -> Option<(&mut TickTable, &mut IdentityTable)> {
        self.providers
            .as_mut()
            .map(|(ticks, identities)| (&mut **ticks, &mut **identities))
    }
}

/// Stamp a TC exactly once, just after its leaf produced it.
pub(crate) fn stamp_tc(tc: &mut Tc, data: &CommitData, tick: u32, author_id: u32) {
    tc.commit_hash = data.commit.hash();
    tc.tick = tick;
    tc.author_id = author_id;
    tc.timestamp = data.commit.timestamp();
}

/// Owns the analyzer list and drives per-commit consumption.
pub struct Runner {
    analyzers: Vec<Box<dyn Analyzer>>,
    core_count: usize,
    aggregators: Vec<Option<Box<dyn Aggregator>>>,
    ticks: TickTable,
    identities: IdentityTable,
    commit_meta: FxHashMap<ObjectHash, CommitMeta>,
    tc_sink: Option<Box<dyn StoreWriter>>,
    leaf_workers: usize,
    cpu_heavy: Vec<usize>,
    main_leaves: Vec<usize>,
    pool: Option<LeafWorkerPool>,
    tc_count: u64,
}

impl Runner {
    /// Build a runner over `analyzers`, of which the first `core_count`
    /// are plumbing. Leaves are classified by capability; cpu-heavy leaves
    /// go hybrid only when `leaf_workers > 0`.
    pub fn new(
        mut analyzers: Vec<Box<dyn Analyzer>>,
        core_count: usize,
        leaf_workers: usize,
        agg_options: &BTreeMap<String, String>,
    ) -> Result<Self> {
        if core_count > analyzers.len() {
            return Err(EngineError::Config(
                "plumbing count exceeds analyzer count".into(),
            ));
        }

        for analyzer in &mut analyzers {
            analyzer
                .configure(agg_options)
                .map_err(|e| analyzer_error(analyzer.name(), e))?;
        }

        let mut cpu_heavy = Vec::new();
        let mut main_leaves = Vec::new();
        for (idx, analyzer) in analyzers.iter().enumerate().skip(core_count) {
            let heavy = analyzer
                .as_parallelizable()
                .map(|p| !p.sequential_only() && p.cpu_heavy())
                .unwrap_or(false);
            if heavy && leaf_workers > 0 {
                cpu_heavy.push(idx);
            } else {
                main_leaves.push(idx);
            }
        }

        let aggregators = analyzers
            .iter()
            .enumerate()
            .map(|(idx, analyzer)| {
                if idx < core_count {
                    None
                } else {
                    analyzer.new_aggregator(agg_options)
                }
            })
            .collect();

        Ok(Self {
            analyzers,
            core_count,
            aggregators,
            ticks: TickTable::new(),
            identities: IdentityTable::new(),
            commit_meta: FxHashMap::default(),
            tc_sink: None,
            leaf_workers,
            cpu_heavy,
            main_leaves,
            pool: None,
            tc_count: 0,
        })
    }

    /// Route TCs to `sink` instead of aggregators. The final report map
    /// will be empty but present.
    pub fn set_tc_sink(&mut self, sink: Box<dyn StoreWriter>) {
        self.tc_sink = Some(sink);
    }

    /// Whether a TC sink is installed.
    pub fn has_tc_sink(&self) -> bool {
        self.tc_sink.is_some()
    }

    /// Initialize every analyzer against the repository.
    pub fn initialize(&mut self, repo: &dyn Repository) -> Result<()> {
        for analyzer in &mut self.analyzers {
            analyzer
                .initialize(repo)
                .map_err(|e| analyzer_error(analyzer.name(), e))?;
        }
        Ok(())
    }

    /// Fork cpu-heavy leaves and start the worker pool for one chunk.
    pub fn begin_chunk(&mut self) -> Result<()> {
        self.tc_count = 0;
        if self.cpu_heavy.is_empty() || self.leaf_workers == 0 {
            return Ok(());
        }
        let mut forks_per_worker = Vec::with_capacity(self.leaf_workers);
        for _ in 0..self.leaf_workers {
            let mut forks = Vec::with_capacity(self.cpu_heavy.len());
            for &idx in &self.cpu_heavy {
                let mut forked = self.analyzers[idx].fork(1);
                let fork = forked.pop().ok_or_else(|| {
                    EngineError::Config(format!(
                        "analyzer {} is cpu-heavy but does not fork",
                        self.analyzers[idx].name()
                    ))
                })?;
                forks.push(fork);
            }
            forks_per_worker.push(forks);
        }
        self.pool = Some(LeafWorkerPool::spawn(forks_per_worker)?);
        Ok(())
    }

    /// Consume one commit: plumbing, snapshot dispatch, main-thread leaves.
    pub fn consume(&mut self, data: CommitData) -> Result<()> {
        let data = Arc::new(data);

        {
            let Self {
                analyzers,
                ticks,
                identities,
                core_count,
                ..
            } = self;
            for analyzer in analyzers[..*core_count].iter_mut() {
                let mut ctx = ConsumeContext::for_plumbing(&data, ticks, identities);
                analyzer
                    .consume(&mut ctx)
                    .map_err(|e| analyzer_error(analyzer.name(), e))?;
            }
        }

        let tick = self.ticks.current();
        let author = data.commit.author();
        let author_id = self.identities.intern(&author);
        self.commit_meta
            .entry(data.commit.hash())
            .or_insert_with(|| CommitMeta {
                tick,
                timestamp: data.commit.timestamp(),
                author: author.clone(),
            });

        if let Some(pool) = &self.pool {
            pool.dispatch(PlumbingSnapshot {
                data: Arc::clone(&data),
                index: data.index,
                tick,
                author_id,
            })?;
        }

        let main_leaves = self.main_leaves.clone();
        for idx in main_leaves {
            let outcome = {
                let mut ctx = ConsumeContext::for_leaf(&data, tick, author_id);
                self.analyzers[idx].consume(&mut ctx)
            };
            match outcome {
                Ok(Some(mut tc)) => {
                    stamp_tc(&mut tc, &data, tick, author_id);
                    self.route(idx, tc)?;
                }
                Ok(None) => {}
                Err(e) => return Err(analyzer_error(self.analyzers[idx].name(), e)),
            }
        }
        Ok(())
    }

    /// Join leaf workers, merge forks, and drain buffered TCs in the
    /// deterministic order: analyzer slot, worker index, observation order.
    pub fn end_chunk(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            let outcomes = pool.finish()?;

            let mut first_error = None;
            let mut forks_by_slot: Vec<Vec<Box<dyn Analyzer>>> =
                (0..self.cpu_heavy.len()).map(|_| Vec::new()).collect();
            let mut buffers_by_worker = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                if first_error.is_none() {
                    first_error = outcome.error;
                }
                for (slot, fork) in outcome.forks.into_iter().enumerate() {
                    forks_by_slot[slot].push(fork);
                }
                buffers_by_worker.push(outcome.buffers);
            }
            if let Some(error) = first_error {
                return Err(error);
            }

            for (slot, forks) in forks_by_slot.into_iter().enumerate() {
                let idx = self.cpu_heavy[slot];
                self.analyzers[idx]
                    .merge(forks)
                    .map_err(|e| analyzer_error(self.analyzers[idx].name(), e))?;
            }

            for slot in 0..self.cpu_heavy.len() {
                let idx = self.cpu_heavy[slot];
                for worker_buffers in &mut buffers_by_worker {
                    for tc in std::mem::take(&mut worker_buffers[slot]) {
                        self.route(idx, tc)?;
                    }
                }
            }
        }

        if let Some(sink) = &mut self.tc_sink {
            sink.flush()?;
        }
        Ok(())
    }

    fn route(&mut self, slot: usize, tc: Tc) -> Result<()> {
        if tc.payload.is_none() {
            return Ok(());
        }
        self.tc_count += 1;
        let Self {
            analyzers,
            aggregators,
            tc_sink,
            ..
        } = self;
        if let Some(sink) = tc_sink {
            return sink.write_tc(analyzers[slot].name(), &tc);
        }
        if let Some(aggregator) = aggregators[slot].as_mut() {
            if let Err(e) = aggregator.add(&tc) {
                // Programming-level type mismatch; state remains valid.
                warn!(
                    analyzer = analyzers[slot].name(),
                    error = %e,
                    "aggregator rejected TC, dropping"
                );
            }
        }
        Ok(())
    }

    /// TCs routed since the last `begin_chunk`.
    pub fn tc_count(&self) -> u64 {
        self.tc_count
    }

    /// Sum of aggregator state estimates.
    pub fn aggregator_state_size(&self) -> u64 {
        self.aggregators
            .iter()
            .flatten()
            .map(|agg| agg.estimated_state_size())
            .sum()
    }

    /// Force every aggregator to spill; returns total bytes written.
    pub fn spill_aggregators(&mut self) -> Result<u64> {
        let mut spilled = 0;
        for aggregator in self.aggregators.iter_mut().flatten() {
            spilled += aggregator
                .spill()
                .map_err(|e| EngineError::Aggregator(e.to_string()))?;
        }
        Ok(spilled)
    }

    /// Spill locations per analyzer, for checkpoint metadata.
    pub fn aggregator_spill_states(&self) -> Vec<(String, SpillState)> {
        self.aggregators
            .iter()
            .enumerate()
            .filter_map(|(idx, agg)| {
                agg.as_ref()
                    .map(|agg| (self.analyzers[idx].name().to_owned(), agg.spill_state()))
            })
            .collect()
    }

    /// Re-attach spill state after a resume, matching by analyzer name.
    pub fn restore_aggregator_spills(&mut self, spills: &[(String, SpillState)]) -> Result<()> {
        for (name, state) in spills {
            let Some(idx) = self.analyzers.iter().position(|a| a.name() == name) else {
                return Err(EngineError::Aggregator(format!(
                    "spill state references unknown analyzer {name}"
                )));
            };
            if let Some(aggregator) = self.aggregators[idx].as_mut() {
                aggregator
                    .restore_spill_state(state)
                    .map_err(|e| EngineError::Aggregator(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Leaf analyzers, mutable, for the hibernation protocol.
    pub fn leaves_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Analyzer>> + '_ {
        self.analyzers.iter_mut().skip(self.core_count)
    }

    /// All analyzers, mutable, for checkpointing.
    pub fn analyzers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Analyzer>> + '_ {
        self.analyzers.iter_mut()
    }

    /// Analyzer names, for checkpoint fingerprinting.
    pub fn analyzer_ids(&self) -> Vec<String> {
        self.analyzers
            .iter()
            .map(|a| a.name().to_owned())
            .collect()
    }

    /// True when every analyzer can checkpoint.
    pub fn all_checkpointable(&mut self) -> bool {
        self.analyzers
            .iter_mut()
            .all(|a| a.as_checkpointable().is_some())
    }

    /// Every registered spill cleaner, for the exit guard.
    pub fn spill_cleaners(&self) -> Vec<Arc<dyn SpillCleaner>> {
        self.analyzers
            .iter()
            .filter_map(|a| a.as_spill_cleaner())
            .collect()
    }

    /// Collect final reports. TC-sink mode returns an empty (but present)
    /// map: the run happened, aggregators were bypassed.
    pub fn finalize(&mut self) -> Result<ReportMap> {
        let mut reports = ReportMap::new();
        if self.tc_sink.is_some() {
            return Ok(reports);
        }

        let commits_by_tick = self.commits_by_tick_value()?;
        for idx in self.core_count..self.analyzers.len() {
            let mut report = self.analyzers[idx]
                .finalize()
                .map_err(|e| analyzer_error(self.analyzers[idx].name(), e))?;
            if let Some(aggregator) = self.aggregators[idx].as_mut() {
                aggregator
                    .collect()
                    .map_err(|e| EngineError::Aggregator(e.to_string()))?;
                let ticks = aggregator
                    .flush_all()
                    .map_err(|e| EngineError::Aggregator(e.to_string()))?;
                let value = serde_yaml::to_value(&ticks)
                    .map_err(|e| EngineError::Aggregator(e.to_string()))?;
                report.insert("ticks".into(), value);
                aggregator
                    .close()
                    .map_err(|e| EngineError::Aggregator(e.to_string()))?;
            }
            if report.contains_key("commits_by_tick") {
                report.insert("commits_by_tick".into(), commits_by_tick.clone());
            }
            reports.insert(self.analyzers[idx].name().to_owned(), report);
        }
        Ok(reports)
    }

    fn commits_by_tick_value(&self) -> Result<serde_yaml::Value> {
        #[derive(serde::Serialize)]
        struct Entry<'a> {
            hash: String,
            timestamp: i64,
            author: &'a str,
        }
        let mut by_tick: BTreeMap<u32, Vec<Entry<'_>>> = BTreeMap::new();
        for (hash, meta) in &self.commit_meta {
            by_tick.entry(meta.tick).or_default().push(Entry {
                hash: hash.to_hex(),
                timestamp: meta.timestamp,
                author: &meta.author,
            });
        }
        for entries in by_tick.values_mut() {
            entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        }
        serde_yaml::to_value(&by_tick).map_err(|e| EngineError::Other(e.to_string()))
    }

    /// Current tick of the tick provider.
    pub fn current_tick(&self) -> u32 {
        self.ticks.current()
    }

    /// Declared working-state growth: the sum over every leaf.
    pub fn declared_work_state(&self) -> u64 {
        self.analyzers
            .iter()
            .skip(self.core_count)
            .map(|a| a.working_state_size())
            .sum()
    }

    /// Declared average TC payload size: the largest leaf figure.
    pub fn declared_avg_tc_size(&self) -> u64 {
        self.analyzers
            .iter()
            .skip(self.core_count)
            .map(|a| a.avg_tc_size())
            .max()
            .unwrap_or(0)
    }

    /// Snapshot the runner-owned provider state for checkpointing.
    pub fn state_snapshot(&self) -> RunnerState {
        let mut commit_meta: Vec<(ObjectHash, CommitMeta)> = self
            .commit_meta
            .iter()
            .map(|(hash, meta)| (*hash, meta.clone()))
            .collect();
        commit_meta.sort_by_key(|(hash, _)| *hash);
        RunnerState {
            first_timestamp: self.ticks.first_timestamp(),
            current_tick: self.ticks.current(),
            identities: self.identities.names().to_vec(),
            commit_meta,
        }
    }

    /// Restore provider state from a checkpoint.
    pub fn restore_state(&mut self, state: RunnerState) {
        self.ticks = TickTable::from_parts(state.first_timestamp, state.current_tick);
        self.identities = IdentityTable::from_names(state.identities);
        self.commit_meta = state.commit_meta.into_iter().collect();
    }

    /// Render one analyzer's report through its own serializer.
    pub fn serialize_report(
        &self,
        name: &str,
        report: &Report,
        format: crate::analyze::ReportFormat,
        writer: &mut dyn std::io::Write,
    ) -> Result<()> {
        let Some(analyzer) = self.analyzers.iter().find(|a| a.name() == name) else {
            return Err(EngineError::Config(format!("unknown analyzer {name}")));
        };
        analyzer.serialize(report, format, writer)
    }
}

/// Runner-owned provider state persisted alongside analyzer checkpoints.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RunnerState {
    /// First commit timestamp the tick provider observed.
    pub first_timestamp: Option<i64>,
    /// Tick of the last processed commit.
    pub current_tick: u32,
    /// Interned identities in identifier order.
    pub identities: Vec<String>,
    /// Commit metadata side channel, sorted by hash.
    pub commit_meta: Vec<(ObjectHash, CommitMeta)>,
}

fn analyzer_error(name: &str, e: EngineError) -> EngineError {
    EngineError::Analyzer {
        name: name.to_owned(),
        source: Box::new(e),
    }
}
