//! Plumbing snapshot: the read-only view leaf workers consume.

use std::sync::Arc;

use crate::model::CommitData;

/// Immutable view of one commit's plumbing outputs, captured after every
/// plumbing analyzer ran so parallel leaves observe a stable state. The
/// tick and author are stamped at capture time; the live providers keep
/// moving underneath.
pub struct PlumbingSnapshot {
    /// Shared pipeline output. Holding this keeps blob payloads and parsed
    /// syntax trees alive for the worker.
    pub data: Arc<CommitData>,
    /// Global index of the commit.
    pub index: usize,
    /// Tick captured pre-dispatch.
    pub tick: u32,
    /// Author id captured pre-dispatch.
    pub author_id: u32,
}

impl PlumbingSnapshot {
    /// Drop the snapshot's references. The worker that last used a
    /// snapshot releases it, returning syntax-tree arena memory.
    pub fn release(self) {
        drop(self);
    }
}
