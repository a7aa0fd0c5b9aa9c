//! One-shot budget decomposition.
//!
//! A pure function of the run inputs: splits the usable budget into a
//! working-state pool and an aggregator pool, derives the chunk size from
//! the declared per-commit growth, and picks the largest buffering factor
//! the working pool can carry. All arithmetic is integer.

use serde::Serialize;

use super::carve;
use crate::model::ChunkBounds;

/// Fraction of the budget considered usable at all.
pub const USABLE_PCT: u64 = 95;
/// Share of the remaining budget reserved for analyzer working state.
/// Heuristic, not an invariant.
pub const WORK_STATE_PCT: u64 = 60;
/// Share of the remaining budget reserved for aggregator state.
/// Heuristic, not an invariant.
pub const AGG_STATE_PCT: u64 = 30;
/// Safety margin applied to the declared per-commit growth.
/// Heuristic, not an invariant.
pub const SAFETY_PCT: u64 = 50;
/// Smallest chunk the planner will emit.
pub const MIN_CHUNK: usize = 50;
/// Largest chunk the planner will emit.
pub const MAX_CHUNK: usize = 3000;
/// Pipeline overhead assumed when the caller does not measure one.
pub const DEFAULT_PIPELINE_OVERHEAD: u64 = 400 * 1024 * 1024;

/// Inputs to [`compute_schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleInputs {
    /// Number of commits in the sweep.
    pub total_commits: usize,
    /// Memory budget in bytes; zero or negative means unlimited.
    pub memory_budget: i64,
    /// Fixed pipeline overhead (caches, channels, worker stacks).
    pub pipeline_overhead: u64,
    /// Declared working-state growth per commit, bytes.
    pub work_state_per_commit: u64,
    /// Declared average TC payload size, bytes.
    pub avg_tc_size: u64,
    /// Upper bound on the buffering factor (1..=3).
    pub max_buffering: usize,
}

/// Output of the budget decomposition.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    /// Contiguous chunk bounds covering `[0, total_commits)`.
    pub chunks: Vec<ChunkBounds>,
    /// Chunk size every chunk except possibly the last uses.
    pub chunk_size: usize,
    /// How many chunks' pipeline output may be in flight at once.
    pub buffering_factor: usize,
    /// Byte budget aggregators may hold before a forced spill.
    pub agg_spill_budget: u64,
}

/// Decompose the memory budget into a chunked schedule.
pub fn compute_schedule(inputs: &ScheduleInputs) -> Schedule {
    let max_buffering = inputs.max_buffering.clamp(1, 3);
    let work_state = inputs.work_state_per_commit.max(1);
    let eff_growth = work_state + work_state * SAFETY_PCT / 100;

    if inputs.memory_budget <= 0 {
        return finish(inputs, MAX_CHUNK, max_buffering, 0);
    }

    let usable = inputs.memory_budget as u64 * USABLE_PCT / 100;
    let remaining = usable.saturating_sub(inputs.pipeline_overhead);
    if remaining == 0 {
        return finish(inputs, MIN_CHUNK, 1, 0);
    }

    let work_pool = remaining * WORK_STATE_PCT / 100;
    let agg_pool = remaining * AGG_STATE_PCT / 100;
    let raw_chunk = (work_pool / eff_growth) as usize;
    let chunk_size = raw_chunk.clamp(MIN_CHUNK, MAX_CHUNK);

    let mut buffering = 1;
    for factor in 1..=max_buffering {
        if work_pool / (factor as u64 * eff_growth) >= MIN_CHUNK as u64 {
            buffering = factor;
        }
    }

    finish(inputs, chunk_size, buffering, agg_pool)
}

fn finish(
    inputs: &ScheduleInputs,
    chunk_size: usize,
    buffering_factor: usize,
    agg_spill_budget: u64,
) -> Schedule {
    Schedule {
        chunks: carve(0, inputs.total_commits, chunk_size),
        chunk_size,
        buffering_factor,
        agg_spill_budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn inputs() -> ScheduleInputs {
        ScheduleInputs {
            total_commits: 100_000,
            memory_budget: 2 * GIB,
            pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
            work_state_per_commit: 500 * 1024,
            avg_tc_size: 128,
            max_buffering: 1,
        }
    }

    #[test]
    fn two_gib_budget_yields_documented_chunk_size() {
        let schedule = compute_schedule(&inputs());
        assert_eq!(schedule.chunk_size, 1266);
        assert_eq!(schedule.buffering_factor, 1);
        assert!(schedule.agg_spill_budget > 0);
        let covered: usize = schedule.chunks.iter().map(|c| c.len()).sum();
        assert_eq!(covered, 100_000);
    }

    #[test]
    fn unlimited_budget_uses_max_chunk_and_no_agg_budget() {
        let mut i = inputs();
        i.memory_budget = 0;
        i.max_buffering = 3;
        let schedule = compute_schedule(&i);
        assert_eq!(schedule.chunk_size, MAX_CHUNK);
        assert_eq!(schedule.agg_spill_budget, 0);
        assert_eq!(schedule.buffering_factor, 3);
    }

    #[test]
    fn budget_below_overhead_degrades_to_min_chunk() {
        let mut i = inputs();
        i.memory_budget = 64 * 1024 * 1024;
        i.pipeline_overhead = 128 * 1024 * 1024;
        i.max_buffering = 3;
        let schedule = compute_schedule(&i);
        assert_eq!(schedule.chunk_size, MIN_CHUNK);
        assert_eq!(schedule.agg_spill_budget, 0);
        assert_eq!(schedule.buffering_factor, 1);
    }

    #[test]
    fn agg_budget_is_independent_of_buffering() {
        let budgets: Vec<u64> = (1..=3)
            .map(|max_buffering| {
                let mut i = inputs();
                i.max_buffering = max_buffering;
                compute_schedule(&i).agg_spill_budget
            })
            .collect();
        assert_eq!(budgets[0], budgets[1]);
        assert_eq!(budgets[1], budgets[2]);
    }

    #[test]
    fn chunks_are_contiguous_from_zero() {
        let schedule = compute_schedule(&inputs());
        let mut cursor = 0;
        for chunk in &schedule.chunks {
            assert_eq!(chunk.start, cursor);
            assert!(chunk.end > chunk.start);
            cursor = chunk.end;
        }
        assert_eq!(cursor, 100_000);
    }

    #[test]
    fn zero_commits_yields_empty_chunk_list() {
        let mut i = inputs();
        i.total_commits = 0;
        assert!(compute_schedule(&i).chunks.is_empty());
    }
}
