//! Adaptive chunk planner.
//!
//! Tracks three exponential moving averages over per-chunk observations —
//! analyzer working-state growth, TC payload volume, and aggregator state
//! growth — and rebuilds the unprocessed tail of the plan when any of them
//! drifts more than [`DIVERGENCE_PCT`] from the value the current plan was
//! built against. The three metrics call for different chunking reactions,
//! so they are never folded into one number until a replan picks
//! `max(work, agg)` as the dominant memory class.

use tracing::info;

use super::budget::{MAX_CHUNK, MIN_CHUNK, USABLE_PCT};
use super::carve;
use crate::model::ChunkBounds;

/// EMA smoothing factor.
pub const EMA_ALPHA: f64 = 0.3;
/// Relative drift that triggers a replan.
pub const DIVERGENCE_PCT: f64 = 0.25;
/// Floor applied to observed growth; sub-1KiB readings are measurement noise.
pub const MIN_OBSERVED_GROWTH: u64 = 1024;
/// Multiplier applied to declared growth when sizing chunks (3/2).
const GROWTH_SAFETY_NUM: u64 = 3;
const GROWTH_SAFETY_DEN: u64 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct Ema {
    value: Option<f64>,
}

impl Ema {
    fn update(&mut self, observed: u64) -> f64 {
        let x = observed.max(MIN_OBSERVED_GROWTH) as f64;
        let next = match self.value {
            None => x,
            Some(prev) => EMA_ALPHA * x + (1.0 - EMA_ALPHA) * prev,
        };
        self.value = Some(next);
        next
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Declared per-commit growth figures the initial plan is built against.
#[derive(Debug, Clone, Copy)]
pub struct GrowthEstimates {
    /// Working-state growth, bytes per commit.
    pub work: u64,
    /// TC payload volume, bytes per commit.
    pub tc: u64,
    /// Aggregator state growth, bytes per commit.
    pub agg: u64,
}

/// What the orchestrator measured across one completed chunk.
#[derive(Debug, Clone)]
pub struct ChunkObservation {
    /// Index of the completed chunk.
    pub chunk_index: usize,
    /// Bounds of the completed chunk.
    pub chunk: ChunkBounds,
    /// Observed working-state growth, bytes per commit.
    pub work_growth: u64,
    /// Observed TC payload volume, bytes per commit.
    pub tc_payload: u64,
    /// Observed aggregator growth, bytes per commit.
    pub agg_growth: u64,
    /// The plan in effect when the chunk ran.
    pub current_chunks: Vec<ChunkBounds>,
}

/// Planner statistics for the end-of-run report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannerStats {
    /// Growth rate the initial plan used, bytes per commit.
    pub initial_growth_rate: u64,
    /// Growth rate the final plan used, bytes per commit.
    pub final_growth_rate: u64,
    /// Final working-state EMA.
    pub final_work: f64,
    /// Final TC payload EMA.
    pub final_tc: f64,
    /// Final aggregator growth EMA.
    pub final_agg: f64,
    /// Number of mid-run replans.
    pub replan_count: u32,
}

/// Adaptive three-metric chunk planner.
#[derive(Debug)]
pub struct AdaptivePlanner {
    total: usize,
    budget: i64,
    overhead: u64,
    declared_growth: u64,
    initial_growth: u64,
    predicted: GrowthEstimates,
    work_ema: Ema,
    tc_ema: Ema,
    agg_ema: Ema,
    replan_count: u32,
}

impl AdaptivePlanner {
    /// Build a planner from declared growth figures.
    pub fn new(total: usize, budget: i64, overhead: u64, declared: GrowthEstimates) -> Self {
        let declared_growth = declared.work.max(1);
        Self {
            total,
            budget,
            overhead,
            declared_growth,
            initial_growth: declared_growth,
            predicted: declared,
            work_ema: Ema::default(),
            tc_ema: Ema::default(),
            agg_ema: Ema::default(),
            replan_count: 0,
        }
    }

    fn chunk_size(&self) -> usize {
        if self.budget <= 0 {
            return MAX_CHUNK;
        }
        let usable = (self.budget as u64 * USABLE_PCT / 100).saturating_sub(self.overhead);
        let eff_growth = self.declared_growth * GROWTH_SAFETY_NUM / GROWTH_SAFETY_DEN;
        ((usable / eff_growth.max(1)) as usize).clamp(MIN_CHUNK, MAX_CHUNK)
    }

    /// Plan the full commit range.
    pub fn plan(&self) -> Vec<ChunkBounds> {
        self.plan_from(0)
    }

    /// Plan the range `[start, total)` with the current growth estimate.
    pub fn plan_from(&self, start: usize) -> Vec<ChunkBounds> {
        carve(start, self.total, self.chunk_size())
    }

    /// Fold one chunk observation in. Returns a replacement plan when the
    /// observation triggered a replan of the unprocessed tail; the returned
    /// list preserves `current_chunks[..=chunk_index]` bit-for-bit.
    pub fn observe(&mut self, obs: &ChunkObservation) -> Option<Vec<ChunkBounds>> {
        let work = self.work_ema.update(obs.work_growth);
        let tc = self.tc_ema.update(obs.tc_payload);
        let agg = self.agg_ema.update(obs.agg_growth);

        if obs.chunk_index + 1 >= obs.current_chunks.len() {
            return None;
        }

        let diverged = diverges(work, self.predicted.work)
            || diverges(tc, self.predicted.tc)
            || diverges(agg, self.predicted.agg);
        if !diverged {
            return None;
        }

        // Chunk for whichever memory class currently dominates.
        self.declared_growth = (work.max(agg) as u64).max(MIN_OBSERVED_GROWTH);
        self.predicted = GrowthEstimates {
            work: work as u64,
            tc: tc as u64,
            agg: agg as u64,
        };
        self.replan_count += 1;

        let tail_start = obs.current_chunks[obs.chunk_index].end;
        let mut chunks = obs.current_chunks[..=obs.chunk_index].to_vec();
        chunks.extend(carve(tail_start, self.total, self.chunk_size()));
        info!(
            chunk_index = obs.chunk_index,
            new_growth = self.declared_growth,
            total_chunks = chunks.len(),
            replan_count = self.replan_count,
            "replanned remaining chunks"
        );
        Some(chunks)
    }

    /// Statistics for the end-of-run report.
    pub fn stats(&self) -> PlannerStats {
        PlannerStats {
            initial_growth_rate: self.initial_growth,
            final_growth_rate: self.declared_growth,
            final_work: self.work_ema.get(),
            final_tc: self.tc_ema.get(),
            final_agg: self.agg_ema.get(),
            replan_count: self.replan_count,
        }
    }
}

fn diverges(observed: f64, predicted: u64) -> bool {
    let predicted = predicted.max(MIN_OBSERVED_GROWTH) as f64;
    (observed - predicted).abs() / predicted > DIVERGENCE_PCT
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;
    const GIB: i64 = 1024 * 1024 * 1024;

    fn planner() -> AdaptivePlanner {
        AdaptivePlanner::new(
            10_000,
            2 * GIB,
            0,
            GrowthEstimates {
                work: 500 * KIB,
                tc: 128,
                agg: 64 * KIB,
            },
        )
    }

    #[test]
    fn plan_covers_total_contiguously() {
        let chunks = planner().plan();
        let mut cursor = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start, cursor);
            cursor = chunk.end;
        }
        assert_eq!(cursor, 10_000);
    }

    #[test]
    fn plan_equals_plan_from_zero() {
        let p = planner();
        assert_eq!(p.plan(), p.plan_from(0));
    }

    #[test]
    fn prefix_plus_plan_from_split_covers_range() {
        let p = planner();
        let full = p.plan();
        let split = full[2].end;
        let prefix: Vec<_> = full.iter().take(3).copied().collect();
        let tail = p.plan_from(split);
        let mut cursor = 0;
        for chunk in prefix.iter().chain(tail.iter()) {
            assert_eq!(chunk.start, cursor);
            cursor = chunk.end;
        }
        assert_eq!(cursor, 10_000);
    }

    #[test]
    fn unlimited_budget_plans_max_chunks() {
        let p = AdaptivePlanner::new(
            7000,
            0,
            0,
            GrowthEstimates {
                work: 500 * KIB,
                tc: 128,
                agg: 0,
            },
        );
        let chunks = p.plan();
        assert_eq!(chunks[0].len(), MAX_CHUNK);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn triple_overshoot_triggers_one_replan_preserving_prefix() {
        let mut p = planner();
        let chunks = p.plan();
        let before = chunks.len();
        let obs = ChunkObservation {
            chunk_index: 0,
            chunk: chunks[0],
            work_growth: 2250 * KIB,
            tc_payload: 128,
            agg_growth: 64 * KIB,
            current_chunks: chunks.clone(),
        };
        let new_chunks = p.observe(&obs).expect("divergence should replan");
        assert_eq!(p.stats().replan_count, 1);
        assert_eq!(new_chunks[0], chunks[0], "completed chunk must be preserved");
        assert!(new_chunks.len() > before, "higher growth means more chunks");
        let mut cursor = 0;
        for chunk in &new_chunks {
            assert_eq!(chunk.start, cursor);
            cursor = chunk.end;
        }
        assert_eq!(cursor, 10_000);
    }

    #[test]
    fn on_track_observation_does_not_replan() {
        let mut p = planner();
        let chunks = p.plan();
        let obs = ChunkObservation {
            chunk_index: 0,
            chunk: chunks[0],
            work_growth: 510 * KIB,
            tc_payload: 128,
            agg_growth: 64 * KIB,
            current_chunks: chunks,
        };
        assert!(p.observe(&obs).is_none());
        assert_eq!(p.stats().replan_count, 0);
    }

    #[test]
    fn last_chunk_observation_never_replans() {
        let mut p = planner();
        let chunks = p.plan();
        let last = chunks.len() - 1;
        let obs = ChunkObservation {
            chunk_index: last,
            chunk: chunks[last],
            work_growth: 9000 * KIB,
            tc_payload: 128,
            agg_growth: 64 * KIB,
            current_chunks: chunks,
        };
        assert!(p.observe(&obs).is_none());
    }

    #[test]
    fn ema_initializes_then_smooths() {
        let mut ema = Ema::default();
        assert_eq!(ema.update(1000 * KIB), 1000.0 * KIB as f64);
        let next = ema.update(2000 * KIB);
        let expected = 0.3 * (2000.0 * KIB as f64) + 0.7 * (1000.0 * KIB as f64);
        assert!((next - expected).abs() < 1e-6);
    }

    #[test]
    fn negative_scale_observations_clamp_to_floor() {
        let mut ema = Ema::default();
        assert_eq!(ema.update(0), MIN_OBSERVED_GROWTH as f64);
    }
}
