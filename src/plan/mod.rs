//! Chunk planning: one-shot budget decomposition and adaptive replanning.

pub mod adaptive;
pub mod budget;

pub use adaptive::{AdaptivePlanner, ChunkObservation, GrowthEstimates, PlannerStats};
pub use budget::{compute_schedule, Schedule, ScheduleInputs};

use crate::model::ChunkBounds;

/// Carve `[start, total)` into contiguous chunks of `chunk_size`, the last
/// possibly shorter.
pub(crate) fn carve(start: usize, total: usize, chunk_size: usize) -> Vec<ChunkBounds> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }
    let mut cursor = start;
    while cursor < total {
        let end = (cursor + chunk_size).min(total);
        chunks.push(ChunkBounds { start: cursor, end });
        cursor = end;
    }
    chunks
}
