#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gitmill::analyze::Aggregator;
use gitmill::analyze::TickSumAggregator;
use gitmill::hibernate::SpillGuard;
use gitmill::model::{ObjectHash, Tc};
use gitmill::runner::Runner;
use gitmill::testkit;

fn tc(tick: u32) -> Tc {
    Tc {
        commit_hash: ObjectHash::ZERO,
        tick,
        author_id: 0,
        timestamp: 0,
        payload: Some(serde_json::json!({ "n": 1 })),
    }
}

#[test]
fn guard_removes_every_registered_spill_dir() {
    let root = tempfile::tempdir().expect("tmpdir");

    let mut aggs: Vec<TickSumAggregator> = (0..3)
        .map(|i| TickSumAggregator::new(root.path().join(format!("agg-{i}"))))
        .collect();
    let guard = SpillGuard::detached();
    for agg in &aggs {
        guard.register(Arc::new(agg.cleaner()));
    }
    for agg in &mut aggs {
        agg.add(&tc(0)).expect("add");
        agg.spill().expect("spill");
    }
    assert_eq!(std::fs::read_dir(root.path()).expect("ls").count(), 3);

    guard.cleanup();
    assert_eq!(
        std::fs::read_dir(root.path()).expect("ls").count(),
        0,
        "no analyzer-owned spill directory may remain"
    );
}

#[test]
fn guard_cleanup_is_idempotent_across_paths() {
    let root = tempfile::tempdir().expect("tmpdir");
    let spill_dir = root.path().join("agg");
    let mut agg = TickSumAggregator::new(spill_dir.clone());
    agg.add(&tc(1)).expect("add");
    agg.spill().expect("spill");

    {
        let guard = SpillGuard::detached();
        guard.register(Arc::new(agg.cleaner()));
        guard.cleanup(); // explicit path
        assert!(!spill_dir.exists());
        std::fs::create_dir_all(&spill_dir).expect("recreate");
        // Drop must not clean a second time.
    }
    assert!(spill_dir.exists(), "cleanup ran twice");
}

#[test]
fn runner_spills_are_cleaned_through_registered_cleaners() {
    let root = tempfile::tempdir().expect("tmpdir");
    let (analyzers, core_count) = testkit::standard_analyzers();
    let mut options = BTreeMap::new();
    options.insert(
        "spill_dir".to_owned(),
        root.path().to_string_lossy().into_owned(),
    );
    let mut runner = Runner::new(analyzers, core_count, 0, &options).expect("runner");

    let guard = SpillGuard::detached();
    for cleaner in runner.spill_cleaners() {
        guard.register(cleaner);
    }
    assert_eq!(runner.spill_cleaners().len(), 3, "one cleaner per leaf");

    // Nothing spilled yet: cleanup of absent dirs is a no-op.
    guard.cleanup();
    assert!(root.path().exists());
}
