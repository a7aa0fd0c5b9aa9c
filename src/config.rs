//! Engine configuration.
//!
//! Flat struct with named presets, humanized size parsing for the CLI
//! surface, and an optional TOML overlay file. Flags win over the file,
//! the file wins over defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::plan::budget::DEFAULT_PIPELINE_OVERHEAD;

/// Whether chunked streaming execution is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Stream when a memory budget is set or history is large.
    #[default]
    Auto,
    /// Always stream.
    On,
    /// Single-pass only.
    Off,
}

impl FromStr for StreamingMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(StreamingMode::Auto),
            "on" => Ok(StreamingMode::On),
            "off" => Ok(StreamingMode::Off),
            other => Err(EngineError::Config(format!(
                "invalid streaming mode {other:?}, expected auto|on|off"
            ))),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memory budget in bytes; 0 means unlimited.
    pub memory_budget: i64,
    /// Pipeline worker pool size.
    pub workers: usize,
    /// Leaf worker pool size for cpu-heavy analyzers.
    pub leaf_workers: usize,
    /// Bounded buffer size between pipeline stages.
    pub buffer_size: usize,
    /// Commits pulled per batch in iterator mode.
    pub commit_batch_size: usize,
    /// Blob cache capacity, bytes.
    pub blob_cache_size: u64,
    /// Diff cache capacity, entries.
    pub diff_cache_size: usize,
    /// Arena budget for parsed syntax trees, bytes.
    pub blob_arena_size: u64,
    /// One-shot allocator tuning; `None` leaves the allocator alone.
    pub gc_percent: Option<u32>,
    /// Ballast allocation held for the process lifetime, bytes.
    pub ballast_size: u64,
    /// Save checkpoints at chunk boundaries.
    pub checkpoint: bool,
    /// Where checkpoints live; `None` derives `<repo>/.gitmill-checkpoint`.
    pub checkpoint_dir: Option<PathBuf>,
    /// Resume from an existing checkpoint when valid.
    pub resume: bool,
    /// Remove any existing checkpoint before starting.
    pub clear_checkpoint: bool,
    /// Streaming mode selection.
    pub streaming: StreamingMode,
    /// Follow first parents only at merges.
    pub first_parent: bool,
    /// Upper bound on the buffering factor (1..=3).
    pub max_buffering: usize,
    /// Fixed pipeline overhead assumed by the budget scheduler.
    pub pipeline_overhead: u64,
    /// Per-request worker timeout before a stall retry, milliseconds.
    pub worker_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget: 0,
            workers: 4,
            leaf_workers: 2,
            buffer_size: 64,
            commit_batch_size: 256,
            blob_cache_size: 256 * 1024 * 1024,
            diff_cache_size: 4096,
            blob_arena_size: 64 * 1024 * 1024,
            gc_percent: None,
            ballast_size: 0,
            checkpoint: false,
            checkpoint_dir: None,
            resume: false,
            clear_checkpoint: false,
            streaming: StreamingMode::Auto,
            first_parent: true,
            max_buffering: 2,
            pipeline_overhead: DEFAULT_PIPELINE_OVERHEAD,
            worker_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Preset for tight budgets: small caches, no overlap, aggressive trim.
    pub fn low_memory() -> Self {
        Self {
            memory_budget: 512 * 1024 * 1024,
            workers: 2,
            leaf_workers: 1,
            buffer_size: 16,
            commit_batch_size: 64,
            blob_cache_size: 32 * 1024 * 1024,
            diff_cache_size: 512,
            blob_arena_size: 16 * 1024 * 1024,
            gc_percent: Some(50),
            max_buffering: 1,
            ..Self::default()
        }
    }

    /// Preset for large machines: wide pools, triple buffering.
    pub fn throughput() -> Self {
        Self {
            workers: 8,
            leaf_workers: 4,
            buffer_size: 256,
            commit_batch_size: 1024,
            blob_cache_size: 1024 * 1024 * 1024,
            diff_cache_size: 16384,
            max_buffering: 3,
            ..Self::default()
        }
    }

    /// Validate the combination of knobs.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.leaf_workers == 0 {
            return Err(EngineError::Config(
                "leaf workers must be at least 1".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::Config("buffer size must be at least 1".into()));
        }
        if !(1..=3).contains(&self.max_buffering) {
            return Err(EngineError::Config(
                "max buffering must be between 1 and 3".into(),
            ));
        }
        if self.resume && !self.checkpoint {
            return Err(EngineError::Config(
                "--resume requires --checkpoint".into(),
            ));
        }
        Ok(())
    }

    /// Overlay values from a TOML config file, then re-validate.
    pub fn overlay_file(mut self, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("invalid config file: {e}")))?;

        if let Some(s) = file.memory_budget {
            self.memory_budget = parse_size(&s)? as i64;
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if let Some(v) = file.leaf_workers {
            self.leaf_workers = v;
        }
        if let Some(v) = file.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = file.commit_batch_size {
            self.commit_batch_size = v;
        }
        if let Some(s) = file.blob_cache_size {
            self.blob_cache_size = parse_size(&s)?;
        }
        if let Some(v) = file.diff_cache_size {
            self.diff_cache_size = v;
        }
        if let Some(s) = file.blob_arena_size {
            self.blob_arena_size = parse_size(&s)?;
        }
        if let Some(v) = file.gc_percent {
            self.gc_percent = Some(crate::memory::validate_gc_percent(v)?);
        }
        if let Some(s) = file.ballast_size {
            self.ballast_size = parse_size(&s)?;
        }
        if let Some(v) = file.streaming {
            self.streaming = v;
        }
        if let Some(v) = file.first_parent {
            self.first_parent = v;
        }
        if let Some(v) = file.max_buffering {
            self.max_buffering = v;
        }
        if let Some(v) = file.worker_timeout_ms {
            self.worker_timeout_ms = v;
        }
        self.validate()?;
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    memory_budget: Option<String>,
    workers: Option<usize>,
    leaf_workers: Option<usize>,
    buffer_size: Option<usize>,
    commit_batch_size: Option<usize>,
    blob_cache_size: Option<String>,
    diff_cache_size: Option<usize>,
    blob_arena_size: Option<String>,
    gc_percent: Option<i64>,
    ballast_size: Option<String>,
    streaming: Option<StreamingMode>,
    first_parent: Option<bool>,
    max_buffering: Option<usize>,
    worker_timeout_ms: Option<u64>,
}

/// Parse a humanized size string: `256MB`, `2GiB`, `1048576`.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    bytesize::ByteSize::from_str(trimmed)
        .map(|b| b.as_u64())
        .map_err(|_| EngineError::Config(format!("invalid size string {input:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_size_accepts_humanized_forms() {
        assert_eq!(parse_size("0").expect("zero"), 0);
        assert_eq!(parse_size("256MB").expect("mb"), 256_000_000);
        assert_eq!(parse_size("2GiB").expect("gib"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1024").expect("bytes"), 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().expect("default is valid");
        EngineConfig::low_memory().validate().expect("preset is valid");
        EngineConfig::throughput().validate().expect("preset is valid");
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let mut config = EngineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.resume = true;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_buffering = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overlay_applies_and_validates() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "memory_budget = \"1GiB\"\nworkers = 3\nstreaming = \"on\""
        )
        .expect("write config");
        let config = EngineConfig::default()
            .overlay_file(file.path())
            .expect("overlay");
        assert_eq!(config.memory_budget, 1024 * 1024 * 1024);
        assert_eq!(config.workers, 3);
        assert_eq!(config.streaming, StreamingMode::On);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "wrokers = 3").expect("write config");
        assert!(EngineConfig::default().overlay_file(file.path()).is_err());
    }
}
