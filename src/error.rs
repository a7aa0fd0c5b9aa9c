use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

use crate::checkpoint::CheckpointError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the streaming engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),
    /// Repository open or object lookup failed.
    #[error("repository error: {0}")]
    Repository(String),
    /// A pipeline stage failed while producing data for one commit.
    #[error("pipeline stage failed at commit {commit_index}: {source}")]
    Stage {
        /// Index of the commit whose stage work failed.
        commit_index: usize,
        /// Underlying stage failure.
        #[source]
        source: Box<EngineError>,
    },
    /// A worker exceeded its timeout on every retry.
    #[error("{kind} worker stalled after {retries} retries")]
    Stalled {
        /// Kind of request that stalled (blob load, diff, parse).
        kind: &'static str,
        /// Number of retries attempted before giving up.
        retries: u32,
    },
    /// An analyzer returned an error from `consume`.
    #[error("analyzer {name} failed: {source}")]
    Analyzer {
        /// Analyzer name as registered with the runner.
        name: String,
        /// The analyzer's own error.
        #[source]
        source: Box<EngineError>,
    },
    /// Aggregator spill/collect/flush/restore failure.
    #[error("aggregator error: {0}")]
    Aggregator(String),
    /// Checkpoint save/load/validate failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// On-disk state failed an integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// The run was cancelled by the caller or a signal.
    #[error("cancelled")]
    Cancelled,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Free-form failure from an external collaborator.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Wrap this error with the commit index it occurred at.
    pub fn at_commit(self, commit_index: usize) -> Self {
        EngineError::Stage {
            commit_index,
            source: Box::new(self),
        }
    }

    /// Process exit code for this error per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Cancelled => 130,
            _ => 2,
        }
    }
}

/// Acquire a `std::sync::Mutex`, mapping poisoning to a fatal corruption error.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("engine lock poisoned - fatal error");
        EngineError::Corruption("engine lock poisoned - fatal error".into())
    })
}
