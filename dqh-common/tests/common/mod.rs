//! Shared fixtures for integration tests

#![allow(dead_code)]

use dqh_common::config::{DuplicateCheckPolicy, HarnessConfig, ReopenPolicy};
use dqh_common::models::{CheckResult, CloseDetails, OpenRun, RunOutcome, ValidationRun};
use dqh_common::{Harness, Stage};
use tempfile::TempDir;

/// Harness over a fresh database in a temp dir; keep the TempDir alive
pub async fn setup() -> (TempDir, Harness) {
    setup_with(HarnessConfig::default()).await
}

pub async fn setup_with(mut config: HarnessConfig) -> (TempDir, Harness) {
    let dir = TempDir::new().unwrap();
    config.database.path = dir.path().join("harness.db");
    let harness = Harness::open(&config).await.unwrap();
    (dir, harness)
}

pub fn policy_config(reopen: ReopenPolicy, duplicates: DuplicateCheckPolicy) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.tracker.reopen_policy = reopen;
    config.tracker.duplicate_checks = duplicates;
    config
}

/// Open, record every check, close
pub async fn record_run(
    harness: &Harness,
    run_id: &str,
    parent_run_id: &str,
    stage: Stage,
    tool: &str,
    checks: Vec<CheckResult>,
    outcome: RunOutcome,
) -> ValidationRun {
    let handle = harness
        .validation_runs
        .open(&OpenRun::new(run_id, stage, tool).parent(parent_run_id))
        .await
        .unwrap();
    for check in &checks {
        harness.validation_runs.record_check(&handle, check).await.unwrap();
    }
    harness
        .validation_runs
        .close(&handle, outcome, CloseDetails::default())
        .await
        .unwrap()
}
