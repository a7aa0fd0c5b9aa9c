//! Leaf worker pool for cpu-heavy analyzers.
//!
//! Each worker owns one fork of every cpu-heavy leaf plus a TC buffer per
//! leaf slot. Snapshots arrive round-robin by commit index; produced TCs
//! stay buffered in the worker until the chunk ends, when the main thread
//! drains them in a deterministic order.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use crate::analyze::Analyzer;
use crate::error::{EngineError, Result};
use crate::model::Tc;
use crate::runner::snapshot::PlumbingSnapshot;
use crate::runner::stamp_tc;

enum WorkerMsg {
    Consume(PlumbingSnapshot),
    Finish,
}

/// What a worker hands back at chunk end.
pub struct WorkerOutcome {
    /// The forks, in cpu-heavy slot order, ready to merge.
    pub forks: Vec<Box<dyn Analyzer>>,
    /// Buffered TCs per cpu-heavy slot, in observation order.
    pub buffers: Vec<Vec<Tc>>,
    /// First error the worker hit, if any.
    pub error: Option<EngineError>,
}

struct LeafWorker {
    sender: Sender<WorkerMsg>,
    handle: JoinHandle<WorkerOutcome>,
}

/// Pool of leaf workers for one chunk.
pub struct LeafWorkerPool {
    workers: Vec<LeafWorker>,
}

impl LeafWorkerPool {
    /// Spawn one worker per entry of `forks_per_worker`; each entry is the
    /// worker's private forks in cpu-heavy slot order.
    pub fn spawn(forks_per_worker: Vec<Vec<Box<dyn Analyzer>>>) -> Result<Self> {
        let mut workers = Vec::with_capacity(forks_per_worker.len());
        for (i, forks) in forks_per_worker.into_iter().enumerate() {
            let (sender, receiver) = mpsc::channel::<WorkerMsg>();
            let handle = thread::Builder::new()
                .name(format!("leaf-{i}"))
                .spawn(move || worker_loop(forks, receiver))?;
            workers.push(LeafWorker { sender, handle });
        }
        Ok(Self { workers })
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hand `snapshot` to the worker selected round-robin by commit index.
    pub fn dispatch(&self, snapshot: PlumbingSnapshot) -> Result<()> {
        let worker = &self.workers[snapshot.index % self.workers.len()];
        worker
            .sender
            .send(WorkerMsg::Consume(snapshot))
            .map_err(|_| EngineError::Corruption("leaf worker channel closed".into()))
    }

    /// Signal end-of-chunk and collect every worker's outcome in worker
    /// index order.
    pub fn finish(self) -> Result<Vec<WorkerOutcome>> {
        for worker in &self.workers {
            let _ = worker.sender.send(WorkerMsg::Finish);
        }
        let mut outcomes = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            let outcome = worker
                .handle
                .join()
                .map_err(|_| EngineError::Corruption("leaf worker panicked".into()))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn worker_loop(
    mut forks: Vec<Box<dyn Analyzer>>,
    receiver: mpsc::Receiver<WorkerMsg>,
) -> WorkerOutcome {
    let mut buffers: Vec<Vec<Tc>> = forks.iter().map(|_| Vec::new()).collect();
    let mut error: Option<EngineError> = None;

    while let Ok(msg) = receiver.recv() {
        match msg {
            WorkerMsg::Consume(snapshot) => {
                // After an error, keep draining so the sender never blocks,
                // but do no further work. The first error wins.
                if error.is_none() {
                    for (slot, fork) in forks.iter_mut().enumerate() {
                        let mut ctx = crate::runner::ConsumeContext::for_leaf(
                            &snapshot.data,
                            snapshot.tick,
                            snapshot.author_id,
                        );
                        match fork.consume(&mut ctx) {
                            Ok(Some(mut tc)) => {
                                stamp_tc(&mut tc, &snapshot.data, snapshot.tick, snapshot.author_id);
                                if tc.payload.is_some() {
                                    buffers[slot].push(tc);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error = Some(EngineError::Analyzer {
                                    name: fork.name().to_owned(),
                                    source: Box::new(e),
                                });
                                break;
                            }
                        }
                    }
                }
                snapshot.release();
            }
            WorkerMsg::Finish => break,
        }
    }

    WorkerOutcome {
        forks,
        buffers,
        error,
    }
}
