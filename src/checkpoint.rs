//! Chunk-boundary checkpointing.
//!
//! A checkpoint directory holds `metadata.json` plus one state file per
//! checkpointable analyzer, each fingerprinted with a SHA-256 checksum.
//! Every write lands via temp file + atomic rename. Validation failures
//! never abort a run; they disable resume and the sweep restarts clean.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::analyze::SpillState;
use crate::error::Result;
use crate::model::ObjectHash;
use crate::runner::Runner;

/// On-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;
/// Metadata file name inside the checkpoint directory.
pub const METADATA_FILE: &str = "metadata.json";
/// Runner provider-state file inside the checkpoint directory.
pub const RUNNER_STATE_FILE: &str = "runner.json";

/// Why a checkpoint was rejected.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint belongs to a different repository path.
    #[error("checkpoint belongs to a different repository")]
    RepoPathMismatch,
    /// The analyzer set changed since the checkpoint was written.
    #[error("checkpoint analyzer set does not match")]
    AnalyzerMismatch,
    /// A state file is missing or fails its checksum.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
    /// The on-disk format version is unsupported.
    #[error("checkpoint version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version found on disk.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// The metadata file cannot be parsed at all.
    #[error("malformed checkpoint metadata: {0}")]
    Malformed(String),
}

/// Durable reference to one aggregator's spill state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSpillRef {
    /// Owning analyzer.
    pub analyzer: String,
    /// Spill directory.
    pub dir: PathBuf,
    /// Spill frame count.
    pub count: u64,
}

/// Where the streaming sweep stood when the checkpoint was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingState {
    /// Total commits in the sweep.
    pub total: usize,
    /// Commits fully processed; equals the end of the last finished chunk.
    pub processed: usize,
    /// Index of the next chunk to run.
    pub current_chunk: usize,
    /// Chunk count of the plan in effect.
    pub total_chunks: usize,
    /// Hash of the last processed commit.
    pub last_commit_hash: Option<ObjectHash>,
    /// Tick of the last processed commit.
    pub last_tick: u32,
    /// Aggregator spill locations.
    pub aggregator_spills: Vec<AggregatorSpillRef>,
}

/// `metadata.json` contents.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Format version.
    pub version: u32,
    /// Repository path the run was opened on.
    pub repo_path: PathBuf,
    /// Stable hash of the normalized absolute repository path.
    pub repo_hash: String,
    /// RFC-3339 write timestamp.
    pub created_at: String,
    /// Names of every analyzer in declared order.
    pub analyzer_ids: Vec<String>,
    /// Streaming position.
    pub streaming_state: StreamingState,
    /// Hex SHA-256 per analyzer state file.
    pub checksums: BTreeMap<String, String>,
}

/// Stable fingerprint of a repository path.
pub fn repo_fingerprint(path: &Path) -> String {
    let normalized = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("{:016x}", xxh64(normalized.to_string_lossy().as_bytes(), 0))
}

/// Saves, validates, loads, and clears checkpoints for one run.
pub struct CheckpointManager {
    dir: PathBuf,
    repo_path: PathBuf,
    repo_hash: String,
}

impl CheckpointManager {
    /// Manager rooted at `dir` for the repository at `repo_path`.
    pub fn new(dir: PathBuf, repo_path: &Path) -> Self {
        Self {
            dir,
            repo_hash: repo_fingerprint(repo_path),
            repo_path: repo_path.to_path_buf(),
        }
    }

    /// The checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Root for aggregator spill subdirectories, one per analyzer.
    pub fn agg_spill_root(&self) -> PathBuf {
        self.dir.join("agg")
    }

    /// Whether a checkpoint exists on disk.
    pub fn exists(&self) -> bool {
        self.dir.join(METADATA_FILE).is_file()
    }

    /// Write a checkpoint: spill state files for every analyzer, then the
    /// metadata, atomically.
    pub fn save(&self, runner: &mut Runner, streaming_state: StreamingState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut checksums = BTreeMap::new();
        for analyzer in runner.analyzers_mut() {
            if let Some(checkpointable) = analyzer.as_checkpointable() {
                let file = checkpointable.save_checkpoint(&self.dir)?;
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        CheckpointError::CorruptCheckpoint(
                            "analyzer checkpoint has no file name".into(),
                        )
                    })?;
                checksums.insert(name, file_checksum(&file)?);
            }
        }

        let runner_json = serde_json::to_string_pretty(&runner.state_snapshot())
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        let runner_path = self.dir.join(RUNNER_STATE_FILE);
        atomic_write(&self.dir, &runner_path, runner_json.as_bytes())?;
        checksums.insert(RUNNER_STATE_FILE.to_owned(), file_checksum(&runner_path)?);

        let metadata = CheckpointMetadata {
            version: CHECKPOINT_VERSION,
            repo_path: self.repo_path.clone(),
            repo_hash: self.repo_hash.clone(),
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            analyzer_ids: runner.analyzer_ids(),
            streaming_state,
            checksums,
        };

        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        atomic_write(&self.dir, &self.dir.join(METADATA_FILE), json.as_bytes())?;
        info!(
            dir = %self.dir.display(),
            processed = metadata.streaming_state.processed,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Parse and validate the on-disk checkpoint against this run.
    pub fn validate(&self, analyzer_ids: &[String]) -> Result<CheckpointMetadata> {
        let raw = fs::read_to_string(self.dir.join(METADATA_FILE))
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        let metadata: CheckpointMetadata =
            serde_json::from_str(&raw).map_err(|e| CheckpointError::Malformed(e.to_string()))?;

        if metadata.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: metadata.version,
                expected: CHECKPOINT_VERSION,
            }
            .into());
        }
        if metadata.repo_hash != self.repo_hash {
            return Err(CheckpointError::RepoPathMismatch.into());
        }

        let mut expected: Vec<&String> = analyzer_ids.iter().collect();
        let mut found: Vec<&String> = metadata.analyzer_ids.iter().collect();
        expected.sort();
        found.sort();
        if expected != found {
            return Err(CheckpointError::AnalyzerMismatch.into());
        }

        for (name, recorded) in &metadata.checksums {
            let path = self.dir.join(name);
            if !path.is_file() {
                return Err(CheckpointError::CorruptCheckpoint(format!(
                    "state file {name} is missing"
                ))
                .into());
            }
            let actual = file_checksum(&path)?;
            if &actual != recorded {
                return Err(CheckpointError::CorruptCheckpoint(format!(
                    "state file {name} fails its checksum"
                ))
                .into());
            }
        }
        Ok(metadata)
    }

    /// Validate, restore every analyzer, and return the streaming state
    /// (including aggregator spill references).
    pub fn load(&self, runner: &mut Runner) -> Result<StreamingState> {
        let metadata = self.validate(&runner.analyzer_ids())?;
        for analyzer in runner.analyzers_mut() {
            if let Some(checkpointable) = analyzer.as_checkpointable() {
                checkpointable.load_checkpoint(&self.dir)?;
            }
        }
        let runner_raw = fs::read_to_string(self.dir.join(RUNNER_STATE_FILE))
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        let runner_state = serde_json::from_str(&runner_raw)
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        runner.restore_state(runner_state);
        let spills: Vec<(String, SpillState)> = metadata
            .streaming_state
            .aggregator_spills
            .iter()
            .map(|s| {
                (
                    s.analyzer.clone(),
                    SpillState {
                        dir: s.dir.clone(),
                        count: s.count,
                    },
                )
            })
            .collect();
        runner.restore_aggregator_spills(&spills)?;
        info!(
            processed = metadata.streaming_state.processed,
            chunk = metadata.streaming_state.current_chunk,
            "checkpoint restored"
        );
        Ok(metadata.streaming_state)
    }

    /// Remove the checkpoint directory entirely.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Log a validation failure and fall through to a fresh run.
pub fn resume_disabled(error: &crate::error::EngineError) {
    warn!(%error, "checkpoint rejected, restarting from the beginning");
}

fn atomic_write(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(target)
        .map_err(|e| CheckpointError::CorruptCheckpoint(e.to_string()))?;
    Ok(())
}

fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
