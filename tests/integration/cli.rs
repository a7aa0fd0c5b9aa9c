#![allow(missing_docs)]

use assert_cmd::Command;

fn gitmill() -> Command {
    Command::cargo_bin("gitmill").expect("binary")
}

#[test]
fn plan_prints_the_documented_chunk_size() {
    gitmill()
        .args([
            "plan",
            "--commits",
            "100000",
            "--memory-budget",
            "2GiB",
            "--work-state",
            "500KiB",
            "--max-buffering",
            "1",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"chunk_size\": 1266"))
        .stdout(predicates::str::contains("\"buffering_factor\": 1"));
}

#[test]
fn usage_errors_exit_with_code_one() {
    gitmill()
        .args(["analyze", "--streaming", "sideways"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn invalid_size_string_is_a_configuration_error() {
    gitmill()
        .args(["analyze", "--memory-budget", "lots"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("invalid size string"));
}

#[test]
fn analyze_smoke_run_produces_reports() {
    gitmill()
        .args(["analyze", "--commits", "120", "--authors", "3", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicates::str::contains("line_stats"))
        .stdout(predicates::str::contains("total_added"));
}

#[test]
fn checkpoint_inspect_on_missing_dir_fails_cleanly() {
    gitmill()
        .args(["checkpoint", "inspect", "/nonexistent/checkpoint"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("no checkpoint metadata"));
}
