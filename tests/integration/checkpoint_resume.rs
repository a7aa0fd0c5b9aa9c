#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use gitmill::analyze::ReportMap;
use gitmill::checkpoint::{CheckpointError, CheckpointManager, METADATA_FILE};
use gitmill::config::{EngineConfig, StreamingMode};
use gitmill::stream::StreamingOrchestrator;
use gitmill::testkit::{self, SyntheticRepo};
use gitmill::{EngineError, Repository};

const MIB: i64 = 1024 * 1024;

fn streaming_config(checkpoint_dir: Option<&Path>) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.memory_budget = 10 * MIB;
    config.pipeline_overhead = 0;
    config.streaming = StreamingMode::On;
    config.max_buffering = 1;
    if let Some(dir) = checkpoint_dir {
        config.checkpoint = true;
        config.checkpoint_dir = Some(dir.to_path_buf());
    }
    config
}

fn new_engine(
    repo: &Arc<SyntheticRepo>,
    config: EngineConfig,
) -> StreamingOrchestrator {
    let (analyzers, core_count) = testkit::standard_analyzers();
    StreamingOrchestrator::new(
        Arc::clone(repo) as Arc<dyn Repository>,
        analyzers,
        core_count,
        None,
        config,
    )
    .expect("engine")
}

fn reports_yaml(reports: &ReportMap) -> String {
    serde_yaml::to_string(reports).expect("yaml")
}

/// Run to completion without interruptions, no checkpointing.
fn baseline(repo: &Arc<SyntheticRepo>) -> String {
    let outcome = new_engine(repo, streaming_config(None)).run().expect("baseline");
    reports_yaml(&outcome.reports)
}

#[test]
fn crash_and_resume_produces_the_uninterrupted_report() {
    let repo = Arc::new(SyntheticRepo::generate(31, 150, 4));
    let expected = baseline(&repo);

    let dir = tempfile::tempdir().expect("tmpdir");
    let checkpoint_dir = dir.path().join("cp");

    // First process: crash (via a hook error) after the second chunk's
    // checkpoint has been written.
    let mut engine = new_engine(&repo, streaming_config(Some(&checkpoint_dir)));
    engine.set_on_chunk_complete(Box::new(|_runner, chunk_index| {
        if chunk_index == 1 {
            return Err(EngineError::Other("simulated crash".into()));
        }
        Ok(())
    }));
    let err = engine.run().expect_err("simulated crash");
    assert!(matches!(err, EngineError::Other(_)));
    assert!(
        checkpoint_dir.join(METADATA_FILE).is_file(),
        "the checkpoint must survive the crash"
    );

    // Fresh process: resume and finish.
    let mut config = streaming_config(Some(&checkpoint_dir));
    config.resume = true;
    let outcome = new_engine(&repo, config).run().expect("resumed run");

    assert_eq!(reports_yaml(&outcome.reports), expected);
    assert!(
        outcome.stats.chunks_processed < 3,
        "resume must not reprocess completed chunks"
    );
    assert!(
        !checkpoint_dir.exists(),
        "successful completion must remove the checkpoint directory"
    );
}

#[test]
fn completed_run_leaves_no_checkpoint_behind() {
    let repo = Arc::new(SyntheticRepo::generate(8, 150, 3));
    let dir = tempfile::tempdir().expect("tmpdir");
    let checkpoint_dir = dir.path().join("cp");

    let outcome = new_engine(&repo, streaming_config(Some(&checkpoint_dir)))
        .run()
        .expect("run");
    assert!(outcome.stats.checkpoints_saved >= 2);
    assert!(!checkpoint_dir.exists());
}

fn interrupted_checkpoint(repo: &Arc<SyntheticRepo>, checkpoint_dir: &Path) {
    let mut engine = new_engine(repo, streaming_config(Some(checkpoint_dir)));
    engine.set_on_chunk_complete(Box::new(|_runner, chunk_index| {
        if chunk_index == 0 {
            return Err(EngineError::Other("simulated crash".into()));
        }
        Ok(())
    }));
    engine.run().expect_err("simulated crash");
    assert!(checkpoint_dir.join(METADATA_FILE).is_file());
}

#[test]
fn corrupt_state_file_is_rejected_and_run_restarts_clean() {
    let repo = Arc::new(SyntheticRepo::generate(55, 150, 3));
    let expected = baseline(&repo);

    let dir = tempfile::tempdir().expect("tmpdir");
    let checkpoint_dir = dir.path().join("cp");
    interrupted_checkpoint(&repo, &checkpoint_dir);

    // Flip bytes in one analyzer state file.
    let target = checkpoint_dir.join("line_stats.ckpt");
    let mut bytes = std::fs::read(&target).expect("state file");
    bytes[0] ^= 0xFF;
    std::fs::write(&target, bytes).expect("corrupt state file");

    let manager = CheckpointManager::new(checkpoint_dir.clone(), repo.path());
    let ids = vec![
        "ticks".to_owned(),
        "identity".to_owned(),
        "line_stats".to_owned(),
        "churn".to_owned(),
        "tc_echo".to_owned(),
    ];
    match manager.validate(&ids) {
        Err(EngineError::Checkpoint(CheckpointError::CorruptCheckpoint(_))) => {}
        other => panic!("expected corrupt checkpoint, got {other:?}"),
    }

    // The engine degrades to a fresh run and still produces the baseline.
    let mut config = streaming_config(Some(&checkpoint_dir));
    config.resume = true;
    let outcome = new_engine(&repo, config).run().expect("degraded run");
    assert_eq!(reports_yaml(&outcome.reports), expected);
}

#[test]
fn version_and_repo_mismatches_are_detected() {
    let repo = Arc::new(SyntheticRepo::generate(66, 150, 3));
    let dir = tempfile::tempdir().expect("tmpdir");
    let checkpoint_dir = dir.path().join("cp");
    interrupted_checkpoint(&repo, &checkpoint_dir);

    let ids = vec![
        "ticks".to_owned(),
        "identity".to_owned(),
        "line_stats".to_owned(),
        "churn".to_owned(),
        "tc_echo".to_owned(),
    ];

    // Different repository path.
    let other_repo = SyntheticRepo::generate(67, 10, 1);
    let manager = CheckpointManager::new(checkpoint_dir.clone(), other_repo.path());
    match manager.validate(&ids) {
        Err(EngineError::Checkpoint(CheckpointError::RepoPathMismatch)) => {}
        other => panic!("expected repo mismatch, got {other:?}"),
    }

    // Different analyzer set.
    let manager = CheckpointManager::new(checkpoint_dir.clone(), repo.path());
    let short_ids = ids[..3].to_vec();
    match manager.validate(&short_ids) {
        Err(EngineError::Checkpoint(CheckpointError::AnalyzerMismatch)) => {}
        other => panic!("expected analyzer mismatch, got {other:?}"),
    }

    // Bumped version.
    let metadata_path = checkpoint_dir.join(METADATA_FILE);
    let raw = std::fs::read_to_string(&metadata_path).expect("metadata");
    let mut value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    value["version"] = serde_json::json!(99);
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&value).expect("json"))
        .expect("rewrite metadata");
    match manager.validate(&ids) {
        Err(EngineError::Checkpoint(CheckpointError::VersionMismatch { found: 99, .. })) => {}
        other => panic!("expected version mismatch, got {other:?}"),
    }
}

#[test]
fn aggregator_spill_state_round_trips_through_checkpoint() {
    let repo = Arc::new(SyntheticRepo::generate(91, 150, 3));
    let dir = tempfile::tempdir().expect("tmpdir");
    let checkpoint_dir = dir.path().join("cp");
    interrupted_checkpoint(&repo, &checkpoint_dir);

    let raw = std::fs::read_to_string(checkpoint_dir.join(METADATA_FILE)).expect("metadata");
    let metadata: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let spills = metadata["streaming_state"]["aggregator_spills"]
        .as_array()
        .expect("spill list");
    assert_eq!(spills.len(), 3, "one spill ref per leaf aggregator");
    for spill in spills {
        let spill_dir = Path::new(spill["dir"].as_str().expect("dir"));
        let count = spill["count"].as_u64().expect("count");
        if count > 0 {
            assert!(spill_dir.is_dir(), "spilled frames must be on disk");
            assert_eq!(
                std::fs::read_dir(spill_dir).expect("read dir").count() as u64,
                count
            );
        }
    }
    assert_eq!(metadata["streaming_state"]["processed"], 50);
    assert_eq!(metadata["streaming_state"]["current_chunk"], 1);
}
