//! Analyzer and aggregator contracts.
//!
//! Analyzers are polymorphic over a small capability set. Capabilities are
//! discovered through `as_*` accessors returning `Option<&dyn ...>` rather
//! than inheritance, so the runner can group leaves without knowing their
//! concrete types.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Tc, TickData};
use crate::repo::Repository;
use crate::runner::ConsumeContext;

pub mod tick_agg;

pub use tick_agg::{SpillDirCleaner, TickSumAggregator};

/// Final output of one analyzer: a YAML-renderable mapping.
pub type Report = BTreeMap<String, serde_yaml::Value>;

/// Map from analyzer name to its report.
pub type ReportMap = BTreeMap<String, Report>;

/// Output encodings an analyzer can render its report in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Stable key-ordered YAML. Deterministic analyzers are byte-identical
    /// between streaming and single-pass runs in this format.
    #[default]
    Yaml,
    /// Pretty JSON.
    Json,
}

/// Location of an aggregator's persisted spill state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillState {
    /// Directory holding the spill files.
    pub dir: PathBuf,
    /// Number of spill files written so far.
    pub count: u64,
}

/// Owns cumulative per-analyzer state keyed by tick.
pub trait Aggregator: Send {
    /// Fold one tick-coded record into the cumulative state.
    fn add(&mut self, tc: &Tc) -> Result<()>;
    /// Flush and return the aggregate for one tick.
    fn flush_tick(&mut self, tick: u32) -> Result<Option<TickData>>;
    /// Flush every remaining tick in ascending order.
    fn flush_all(&mut self) -> Result<Vec<TickData>>;
    /// Persist the in-memory portion to disk; returns bytes spilled.
    /// In-memory state resets, but disk + subsequent adds still produce
    /// logically equivalent results.
    fn spill(&mut self) -> Result<u64>;
    /// Fold spilled state back in so `flush_all` sees the full history.
    fn collect(&mut self) -> Result<()>;
    /// Conservative estimate of resident state, in bytes.
    fn estimated_state_size(&self) -> u64;
    /// Durable description of the spill location; stable across restarts
    /// once files are fsynced.
    fn spill_state(&self) -> SpillState;
    /// Re-attach previously persisted spill state after a restart.
    fn restore_spill_state(&mut self, state: &SpillState) -> Result<()>;
    /// Drop all state, in-memory and spilled. Optional.
    fn discard_state(&mut self) -> Result<()> {
        Ok(())
    }
    /// Release resources. Called exactly once at the end of a run.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Parallelism capabilities of a leaf analyzer.
pub trait Parallelizable {
    /// Must run on the main thread in declared order.
    fn sequential_only(&self) -> bool {
        false
    }
    /// Dominated by CPU work; worth dispatching to a leaf worker.
    fn cpu_heavy(&self) -> bool {
        false
    }
}

/// Between-chunk state compaction.
pub trait Hibernatable {
    /// Compact working state into a dormant form, freeing live graphs.
    fn hibernate(&mut self) -> Result<()>;
    /// Restore the live form after memory has been reclaimed.
    fn boot(&mut self) -> Result<()>;
}

/// Removal of analyzer-owned temp files on any exit path.
pub trait SpillCleaner: Send + Sync {
    /// Delete every temp file this analyzer created. Idempotent.
    fn cleanup_spills(&self);
}

/// Chunk-boundary persistence of analyzer state.
pub trait Checkpointable {
    /// Write state into `dir`; the file name must be stable for this
    /// analyzer so checksums can be recorded against it.
    fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf>;
    /// Restore state previously written by `save_checkpoint`.
    fn load_checkpoint(&mut self, dir: &Path) -> Result<()>;
}

/// Direct streaming of TCs to an external store, bypassing aggregation.
pub trait StoreWriter {
    /// Emit one stamped record.
    fn write_tc(&mut self, analyzer: &str, tc: &Tc) -> Result<()>;
    /// Flush buffered output, called at each chunk boundary.
    fn flush(&mut self) -> Result<()>;
}

/// Explicit discard of accumulated state without producing a report.
pub trait StateDiscarder {
    /// Drop all accumulated state.
    fn discard_state(&mut self) -> Result<()>;
}

/// A history analyzer: plumbing or leaf.
pub trait Analyzer: Send {
    /// Type-tag introspection; lets `merge` down-cast its forks and the
    /// runner down-cast plumbing analyzers.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Stable identifier, also the key in the report map.
    fn name(&self) -> &str;
    /// CLI flag that enables this analyzer.
    fn flag(&self) -> &str;
    /// One-line description for `--help`.
    fn descriptor(&self) -> &str {
        ""
    }
    /// Names of the configuration options this analyzer accepts.
    fn list_config_options(&self) -> Vec<String> {
        Vec::new()
    }
    /// Apply configuration. Unknown keys are ignored.
    fn configure(&mut self, _options: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }
    /// Bind to the repository before the first commit.
    fn initialize(&mut self, _repo: &dyn Repository) -> Result<()> {
        Ok(())
    }
    /// Observe one commit. Leaves return at most one TC; plumbing
    /// analyzers mutate the shared context and return `None`.
    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>>;
    /// Produce `n` independent copies for worker-parallel execution.
    fn fork(&self, _n: usize) -> Vec<Box<dyn Analyzer>> {
        Vec::new()
    }
    /// Fold forked state back into `self` at the end of a chunk.
    fn merge(&mut self, _forks: Vec<Box<dyn Analyzer>>) -> Result<()> {
        Ok(())
    }
    /// Declared per-commit working-state growth in bytes. Planning only;
    /// correctness never depends on it.
    fn working_state_size(&self) -> u64 {
        0
    }
    /// Declared average TC payload size in bytes. Planning only.
    fn avg_tc_size(&self) -> u64 {
        0
    }
    /// Create this analyzer's aggregator, or `None` for plumbing.
    fn new_aggregator(&self, _options: &BTreeMap<String, String>) -> Option<Box<dyn Aggregator>> {
        None
    }
    /// Render the final report for this analyzer.
    fn serialize(
        &self,
        report: &Report,
        format: ReportFormat,
        writer: &mut dyn Write,
    ) -> Result<()> {
        match format {
            ReportFormat::Yaml => serde_yaml::to_writer(writer, report)
                .map_err(|e| crate::error::EngineError::Other(e.to_string())),
            ReportFormat::Json => serde_json::to_writer_pretty(writer, report)
                .map_err(|e| crate::error::EngineError::Other(e.to_string())),
        }
    }
    /// Whether the report must be byte-identical between streaming and
    /// single-pass runs.
    fn deterministic(&self) -> bool {
        false
    }
    /// Collect the final report contents.
    fn finalize(&mut self) -> Result<Report> {
        Ok(Report::new())
    }

    /// Parallelism capability, if declared.
    fn as_parallelizable(&self) -> Option<&dyn Parallelizable> {
        None
    }
    /// Hibernation capability, if declared.
    fn as_hibernatable(&mut self) -> Option<&mut dyn Hibernatable> {
        None
    }
    /// Spill-cleanup capability, if declared.
    fn as_spill_cleaner(&self) -> Option<Arc<dyn SpillCleaner>> {
        None
    }
    /// Checkpoint capability, if declared.
    fn as_checkpointable(&mut self) -> Option<&mut dyn Checkpointable> {
        None
    }
    /// State-discard capability, if declared.
    fn as_state_discarder(&mut self) -> Option<&mut dyn StateDiscarder> {
        None
    }
}
