//! # Gitmill - Memory-Bounded Git History Analysis
//!
//! Gitmill replays a repository's commit history through a staged
//! pipeline (tree diffs, blobs, textual diffs, syntax trees) and a set of
//! downstream analyzers, while a streaming scheduler keeps resident
//! memory under a user budget.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gitmill::{EngineConfig, StreamingOrchestrator};
//! use gitmill::testkit::{self, SyntheticRepo};
//!
//! let repo = Arc::new(SyntheticRepo::generate(42, 1000, 5));
//! let (analyzers, core_count) = testkit::standard_analyzers();
//! let mut config = EngineConfig::default();
//! config.memory_budget = 2 * 1024 * 1024 * 1024;
//!
//! let engine = StreamingOrchestrator::new(repo, analyzers, core_count, None, config)?;
//! let outcome = engine.run()?;
//! println!("{} analyzer reports", outcome.reports.len());
//! # Ok::<(), gitmill::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Budget scheduler**: one-shot decomposition of the memory budget
//!   into chunk size, aggregator spill budget, and buffering factor
//! - **Adaptive planner**: three-metric EMA feedback that replans the
//!   remaining chunks when observed growth diverges from the plan
//! - **Coordinator**: ordered multi-stage pipeline with per-stage caches
//! - **Runner**: plumbing/leaf dispatch with fork/merge parallelism
//! - **Hibernation & checkpoints**: between-chunk state eviction and
//!   crash-tolerant resume

pub mod analyze;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hibernate;
pub mod logging;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod repo;
pub mod runner;
pub mod stream;
pub mod testkit;

// Re-export the main public API
pub use crate::analyze::{Aggregator, Analyzer, Report, ReportFormat, ReportMap};
pub use crate::config::{EngineConfig, StreamingMode};
pub use crate::error::{EngineError, Result};
pub use crate::model::{Change, ChunkBounds, CommitData, FileDiff, ObjectHash, Tc, TickData};
pub use crate::repo::{Commit, CommitIter, LogOptions, Repository};
pub use crate::runner::Runner;
pub use crate::stream::{EngineStats, RunOutcome, StreamingOrchestrator};
