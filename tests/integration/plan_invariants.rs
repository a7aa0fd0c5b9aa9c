#![allow(missing_docs)]

use gitmill::model::ChunkBounds;
use gitmill::plan::budget::{
    compute_schedule, ScheduleInputs, DEFAULT_PIPELINE_OVERHEAD, MAX_CHUNK, MIN_CHUNK,
};
use gitmill::plan::{AdaptivePlanner, ChunkObservation, GrowthEstimates};
use proptest::prelude::*;

const KIB: u64 = 1024;
const GIB: i64 = 1024 * 1024 * 1024;

fn assert_contiguous_cover(chunks: &[ChunkBounds], total: usize) {
    let mut cursor = 0;
    for chunk in chunks {
        assert_eq!(chunk.start, cursor, "chunks must be contiguous");
        assert!(chunk.end > chunk.start, "chunks must be non-empty");
        cursor = chunk.end;
    }
    assert_eq!(cursor, total, "chunks must cover every commit exactly once");
}

#[test]
fn two_gib_hundred_k_commits_scenario() {
    let schedule = compute_schedule(&ScheduleInputs {
        total_commits: 100_000,
        memory_budget: 2 * GIB,
        pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
        work_state_per_commit: 500 * KIB,
        avg_tc_size: 128,
        max_buffering: 1,
    });
    assert_eq!(schedule.chunk_size, 1266);
    assert!(schedule.chunks.len() > 1);
    assert_eq!(schedule.buffering_factor, 1);
    assert!(schedule.agg_spill_budget > 0);
    assert_contiguous_cover(&schedule.chunks, 100_000);
}

#[test]
fn unlimited_budget_boundary() {
    let schedule = compute_schedule(&ScheduleInputs {
        total_commits: 10_000,
        memory_budget: 0,
        pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
        work_state_per_commit: 500 * KIB,
        avg_tc_size: 128,
        max_buffering: 3,
    });
    assert_eq!(schedule.chunk_size, MAX_CHUNK);
    assert_eq!(schedule.agg_spill_budget, 0);
    assert_eq!(schedule.buffering_factor, 3);
}

#[test]
fn budget_below_overhead_boundary() {
    let schedule = compute_schedule(&ScheduleInputs {
        total_commits: 10_000,
        memory_budget: 100 * 1024 * 1024,
        pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
        work_state_per_commit: 500 * KIB,
        avg_tc_size: 128,
        max_buffering: 3,
    });
    assert_eq!(schedule.chunk_size, MIN_CHUNK);
    assert_eq!(schedule.agg_spill_budget, 0);
    assert_eq!(schedule.buffering_factor, 1);
}

#[test]
fn agg_spill_budget_ignores_buffering_factor() {
    let base = ScheduleInputs {
        total_commits: 100_000,
        memory_budget: 4 * GIB,
        pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
        work_state_per_commit: 200 * KIB,
        avg_tc_size: 128,
        max_buffering: 1,
    };
    let budgets: Vec<u64> = (1..=3)
        .map(|max_buffering| {
            compute_schedule(&ScheduleInputs {
                max_buffering,
                ..base.clone()
            })
            .agg_spill_budget
        })
        .collect();
    assert!(budgets.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn replan_on_triple_overshoot() {
    let declared = GrowthEstimates {
        work: 500 * KIB,
        tc: 128,
        agg: 250 * KIB,
    };
    let mut planner = AdaptivePlanner::new(100_000, 2 * GIB, 0, declared);
    let chunks = planner.plan();
    let initial_count = chunks.len();

    let new_chunks = planner
        .observe(&ChunkObservation {
            chunk_index: 0,
            chunk: chunks[0],
            work_growth: 2250 * KIB,
            tc_payload: 128,
            agg_growth: 250 * KIB,
            current_chunks: chunks.clone(),
        })
        .expect("3x overshoot must replan");

    let stats = planner.stats();
    assert_eq!(stats.replan_count, 1);
    assert_eq!(new_chunks[0], chunks[0], "completed chunk preserved bit-for-bit");
    assert!(new_chunks.len() > initial_count);
    assert_contiguous_cover(&new_chunks, 100_000);
    assert!(
        stats.final_growth_rate > stats.initial_growth_rate,
        "tail must use the new growth estimate"
    );
}

#[test]
fn planner_round_trip_laws() {
    let planner = AdaptivePlanner::new(
        77_777,
        3 * GIB,
        64 * 1024 * 1024,
        GrowthEstimates {
            work: 300 * KIB,
            tc: 64,
            agg: 100 * KIB,
        },
    );
    assert_eq!(planner.plan(), planner.plan_from(0));

    let full = planner.plan();
    let split_at = 4.min(full.len());
    let split = full[split_at - 1].end;
    let mut stitched: Vec<ChunkBounds> = full[..split_at].to_vec();
    stitched.extend(planner.plan_from(split));
    assert_contiguous_cover(&stitched, 77_777);
}

#[test]
fn zero_commits_is_an_empty_plan() {
    let schedule = compute_schedule(&ScheduleInputs {
        total_commits: 0,
        memory_budget: GIB,
        pipeline_overhead: 0,
        work_state_per_commit: KIB,
        avg_tc_size: 0,
        max_buffering: 2,
    });
    assert!(schedule.chunks.is_empty());
}

proptest! {
    #[test]
    fn schedule_always_covers_and_respects_bounds(
        total in 0usize..400_000,
        budget in 0i64..(8 * GIB),
        overhead in 0u64..(GIB as u64),
        work in 1u64..(8 * 1024 * KIB),
        max_buffering in 1usize..=3,
    ) {
        let schedule = compute_schedule(&ScheduleInputs {
            total_commits: total,
            memory_budget: budget,
            pipeline_overhead: overhead,
            work_state_per_commit: work,
            avg_tc_size: 64,
            max_buffering,
        });
        assert_contiguous_cover(&schedule.chunks, total);
        prop_assert!((MIN_CHUNK..=MAX_CHUNK).contains(&schedule.chunk_size));
        prop_assert!((1..=3).contains(&schedule.buffering_factor));
        for chunk in schedule.chunks.iter().rev().skip(1) {
            prop_assert_eq!(chunk.len(), schedule.chunk_size);
        }
        if let Some(last) = schedule.chunks.last() {
            prop_assert!(last.len() <= schedule.chunk_size);
        }
    }
}
