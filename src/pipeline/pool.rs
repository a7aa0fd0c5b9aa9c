//! Shared worker pool for blob loads, diff computation, and parsing.
//!
//! Workers pull boxed tasks off a single channel. Batch submission tags
//! each job with its slot so results can be reassembled in input order
//! regardless of completion order. A batch that stops producing results
//! gets a bounded number of backoff waits before surfacing a stall.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{EngineError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long to wait for worker results and how patiently to retry.
#[derive(Debug, Clone, Copy)]
pub struct StallPolicy {
    /// Initial wait per result before the first retry.
    pub timeout: Duration,
    /// Retries before declaring the batch stalled.
    pub retries: u32,
    /// First backoff wait; each further retry multiplies by 4.
    pub backoff_base: Duration,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl StallPolicy {
    /// Policy with a custom initial timeout and default retry shape.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base * 4u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers named `{name}-{i}`.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || loop {
                    let task = receiver.lock().recv();
                    match task {
                        Ok(task) => task(),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Run one fire-and-forget task.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(task));
        }
    }

    /// Run `jobs` across the pool and return their results in submission
    /// order. The first job error aborts the batch; a batch that produces
    /// nothing for the policy's timeout plus every backoff wait returns
    /// [`EngineError::Stalled`].
    pub fn run_batch<T: Send + 'static>(
        &self,
        kind: &'static str,
        policy: StallPolicy,
        jobs: Vec<Box<dyn FnOnce() -> Result<T> + Send>>,
    ) -> Result<Vec<T>> {
        let total = jobs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (tx, rx) = mpsc::channel::<(usize, Result<T>)>();
        for (slot, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            self.execute(move || {
                let _ = tx.send((slot, job()));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut received = 0usize;
        let mut retries = 0u32;
        let mut wait = policy.timeout;

        while received < total {
            match rx.recv_timeout(wait) {
                Ok((slot, Ok(value))) => {
                    slots[slot] = Some(value);
                    received += 1;
                    retries = 0;
                    wait = policy.timeout;
                }
                Ok((_, Err(e))) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    retries += 1;
                    if retries > policy.retries {
                        return Err(EngineError::Stalled {
                            kind,
                            retries: policy.retries,
                        });
                    }
                    wait = policy.backoff(retries);
                    warn!(kind, retries, wait_ms = wait.as_millis() as u64, "worker batch slow, backing off");
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Stalled {
                        kind,
                        retries,
                    });
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| EngineError::Corruption("batch slot left unfilled".into()))
            })
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
