//! Integration tests for baseline/experiment comparison
//!
//! Each test records closed validation runs for a baseline `b1` and an
//! experiment `e1`, then scores the pair.

mod common;

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use common::{record_run, setup};
use dqh_common::comparison::{compare, MutationScope, RunPair, Verdict};
use dqh_common::models::{CheckResult, CheckStatus, OpenRun, RunOutcome};
use dqh_common::{Error, RunMode, RunStatus, Stage};

fn pair() -> RunPair {
    RunPair::new("b1", "e1")
}

#[tokio::test]
async fn test_fk_mutation_is_detected() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 0).with_rule_type("foreign_key")],
        RunOutcome::Success,
    )
    .await;
    record_run(
        &harness,
        "e1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 3).with_rule_type("foreign_key")],
        RunOutcome::Success,
    )
    .await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.verdict, Verdict::Detected);
    assert_eq!(record.baseline, Some(CheckStatus::Pass));
    assert_eq!(record.experiment, Some(CheckStatus::Fail));
    assert_eq!(record.experiment_rows_failed, Some(3));

    assert_eq!(report.rows.len(), 2);
    let experiment_row = report
        .rows
        .iter()
        .find(|r| r.run_mode == RunMode::Experiment)
        .unwrap();
    assert_eq!(experiment_row.check_name.as_deref(), Some("fk_home_team"));
    assert_eq!(experiment_row.rows_failed, 3);
    assert_eq!(experiment_row.checks_failed, 1);
    assert_eq!(experiment_row.detection_verdict, Verdict::Detected);

    let metrics = report.metrics_for(Stage::Load, "sql").unwrap();
    assert_eq!(metrics.detected, 1);
    assert_eq!(metrics.detection_rate, Some(1.0));
}

#[tokio::test]
async fn test_missing_experiment_tool_run_is_skipped() {
    let (_dir, harness) = setup().await;

    for (run_id, tool) in [("b1", "sql"), ("b1", "soda"), ("e1", "sql")] {
        record_run(
            &harness,
            run_id,
            "b1",
            Stage::Load,
            tool,
            vec![
                CheckResult::from_row_count("not_null_id", 0),
                CheckResult::from_row_count("unique_id", 0),
            ],
            RunOutcome::Success,
        )
        .await;
    }

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    let soda_rows: Vec<_> = report.rows.iter().filter(|r| r.tool == "soda").collect();
    assert_eq!(soda_rows.len(), 3);
    assert!(soda_rows
        .iter()
        .all(|r| r.detection_verdict == Verdict::Skipped));

    let placeholder = soda_rows
        .iter()
        .find(|r| r.run_mode == RunMode::Experiment)
        .unwrap();
    assert_eq!(placeholder.check_name, None);
    assert_eq!(placeholder.run_id, "e1");
    assert_eq!(placeholder.checks_total, 0);

    let soda = report.metrics_for(Stage::Load, "soda").unwrap();
    assert_eq!(soda.skipped, 2);
    assert_eq!(soda.detection_rate, None);

    let sql = report.metrics_for(Stage::Load, "sql").unwrap();
    assert_eq!(sql.missed, 2);
    assert_eq!(sql.skipped, 0);
}

#[tokio::test]
async fn test_expected_pair_without_runs_is_skipped() {
    let (_dir, harness) = setup().await;

    let expected = vec![(Stage::Transform, "dbt".to_string())];
    let report = compare(&harness.validation_runs, &pair(), &expected, &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 2);
    assert!(report
        .rows
        .iter()
        .all(|r| r.detection_verdict == Verdict::Skipped && r.check_name.is_none()));
    assert_eq!(report.metrics_for(Stage::Transform, "dbt").unwrap().skipped, 1);
}

#[tokio::test]
async fn test_runs_without_checks_still_report() {
    let (_dir, harness) = setup().await;

    // Both tools crashed before recording anything
    record_run(&harness, "b1", "b1", Stage::Extract, "soda", vec![], RunOutcome::Failed).await;
    record_run(&harness, "e1", "b1", Stage::Extract, "soda", vec![], RunOutcome::Failed).await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 2);
    assert!(report
        .rows
        .iter()
        .all(|r| r.detection_verdict == Verdict::Skipped && r.check_name.is_none()));
    let modes: Vec<RunMode> = report.rows.iter().map(|r| r.run_mode).collect();
    assert_eq!(modes, vec![RunMode::Baseline, RunMode::Experiment]);

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].check_name, None);
    assert_eq!(report.records[0].verdict, Verdict::Skipped);
    assert_eq!(report.metrics_for(Stage::Extract, "soda").unwrap().skipped, 1);
}

#[tokio::test]
async fn test_empty_run_against_missing_side_keeps_both_rows() {
    let (_dir, harness) = setup().await;

    record_run(&harness, "b1", "b1", Stage::Extract, "soda", vec![], RunOutcome::Success).await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.rows[0].run_mode, RunMode::Baseline);
    assert_eq!(report.rows[0].run_id, "b1");
    assert_eq!(report.rows[1].run_mode, RunMode::Experiment);
    assert!(report.rows.iter().all(|r| r.check_name.is_none()));
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.metrics_for(Stage::Extract, "soda").unwrap().skipped, 1);
}

#[tokio::test]
async fn test_one_sided_empty_run_keeps_placeholder_row() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 0)],
        RunOutcome::Success,
    )
    .await;
    record_run(&harness, "e1", "b1", Stage::Load, "sql", vec![], RunOutcome::Failed).await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    let experiment_rows: Vec<_> = report
        .rows
        .iter()
        .filter(|r| r.run_mode == RunMode::Experiment)
        .collect();
    assert_eq!(experiment_rows.len(), 1);
    assert_eq!(experiment_rows[0].check_name, None);
    assert_eq!(experiment_rows[0].detection_verdict, Verdict::Skipped);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].check_name.as_deref(), Some("fk_home_team"));
}

#[tokio::test]
async fn test_experiment_error_is_never_detected() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Extract,
        "gx",
        vec![CheckResult::from_row_count("expect_column_values_to_not_be_null", 0)],
        RunOutcome::Success,
    )
    .await;
    record_run(
        &harness,
        "e1",
        "b1",
        Stage::Extract,
        "gx",
        vec![CheckResult::errored(
            "expect_column_values_to_not_be_null",
            "column dropped by mutation",
        )],
        RunOutcome::Success,
    )
    .await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.records[0].verdict, Verdict::Missed);
    let metrics = report.metrics_for(Stage::Extract, "gx").unwrap();
    assert_eq!(metrics.detected, 0);
    assert_eq!(metrics.detection_rate, Some(0.0));
}

#[tokio::test]
async fn test_baseline_failure_is_false_positive() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_away_team", 4)],
        RunOutcome::Success,
    )
    .await;
    record_run(
        &harness,
        "e1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_away_team", 9)],
        RunOutcome::Success,
    )
    .await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();
    assert_eq!(report.records[0].verdict, Verdict::FalsePositive);
}

#[tokio::test]
async fn test_scope_separates_missed_from_unaffected() {
    let (_dir, harness) = setup().await;
    let checks = || {
        vec![
            CheckResult::from_row_count("fk_home_team", 0).with_rule_type("foreign_key"),
            CheckResult::from_row_count("not_null_score", 0).with_rule_type("not_null"),
        ]
    };
    record_run(&harness, "b1", "b1", Stage::Load, "sql", checks(), RunOutcome::Success).await;
    record_run(&harness, "e1", "b1", Stage::Load, "sql", checks(), RunOutcome::Success).await;

    let scope = MutationScope::all().with_rule_type("foreign_key");
    let report = compare(&harness.validation_runs, &pair(), &[], &scope)
        .await
        .unwrap();

    let verdicts: BTreeMap<_, _> = report
        .records
        .iter()
        .map(|r| (r.check_name.clone().unwrap(), r.verdict))
        .collect();
    assert_eq!(verdicts["fk_home_team"], Verdict::Missed);
    assert_eq!(verdicts["not_null_score"], Verdict::Unaffected);
}

#[tokio::test]
async fn test_last_result_per_check_decides() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![
            CheckResult::from_row_count("fk_home_team", 2),
            CheckResult::from_row_count("fk_home_team", 0),
        ],
        RunOutcome::Success,
    )
    .await;
    record_run(
        &harness,
        "e1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 3)],
        RunOutcome::Success,
    )
    .await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.records[0].baseline, Some(CheckStatus::Pass));
    assert_eq!(report.records[0].verdict, Verdict::Detected);

    let baseline_row = report
        .rows
        .iter()
        .find(|r| r.run_mode == RunMode::Baseline)
        .unwrap();
    assert_eq!(baseline_row.check_status, Some(CheckStatus::Pass));
    assert_eq!(baseline_row.checks_total, 2);
    assert_eq!(baseline_row.checks_failed, 1);
}

#[tokio::test]
async fn test_latest_timestamp_decides_over_insert_order() {
    let (_dir, harness) = setup().await;
    let t0 = Utc::now();

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 0)],
        RunOutcome::Success,
    )
    .await;

    // A late FAIL is recorded before an earlier PASS
    let mut late_fail = CheckResult::from_row_count("fk_home_team", 3);
    late_fail.started_at = t0 + Duration::seconds(10);
    late_fail.finished_at = Some(t0 + Duration::seconds(11));
    let mut early_pass = CheckResult::from_row_count("fk_home_team", 0);
    early_pass.started_at = t0;
    early_pass.finished_at = Some(t0 + Duration::seconds(1));
    record_run(
        &harness,
        "e1",
        "b1",
        Stage::Load,
        "sql",
        vec![late_fail, early_pass],
        RunOutcome::Success,
    )
    .await;

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].experiment, Some(CheckStatus::Fail));
    assert_eq!(report.records[0].verdict, Verdict::Detected);
}

#[tokio::test]
async fn test_summary_reproduces_stored_fail_counts() {
    let (_dir, harness) = setup().await;

    let mut stored = Vec::new();
    for (run_id, tool) in [("b1", "sql"), ("b1", "soda"), ("e1", "sql"), ("e1", "soda")] {
        let failing = if run_id == "e1" { 2 } else { 0 };
        let run = record_run(
            &harness,
            run_id,
            "b1",
            Stage::Load,
            tool,
            vec![
                CheckResult::from_row_count("fk_home_team", failing),
                CheckResult::from_row_count("fk_home_team", 1),
                CheckResult::from_predicate("row_count_match", run_id == "b1"),
                CheckResult::errored("freshness", "timeout"),
            ],
            RunOutcome::Success,
        )
        .await;
        stored.push(run);
    }

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();

    for run in &stored {
        let mode = if run.run_id == "b1" {
            RunMode::Baseline
        } else {
            RunMode::Experiment
        };
        let derived: i64 = report
            .rows
            .iter()
            .filter(|r| r.run_mode == mode && r.tool == run.tool && r.stage == run.stage)
            .map(|r| r.checks_failed)
            .sum();
        assert_eq!(derived, run.checks_failed, "{} {}", run.run_id, run.tool);
    }
}

#[tokio::test]
async fn test_open_runs_are_ignored() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 0)],
        RunOutcome::Success,
    )
    .await;
    let handle = harness
        .validation_runs
        .open(&OpenRun::new("e1", Stage::Load, "sql").parent("b1"))
        .await
        .unwrap();
    harness
        .validation_runs
        .record_check(&handle, &CheckResult::from_row_count("fk_home_team", 3))
        .await
        .unwrap();

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();
    assert!(report
        .rows
        .iter()
        .all(|r| r.detection_verdict == Verdict::Skipped));
}

#[tokio::test]
async fn test_failed_runs_still_compare() {
    let (_dir, harness) = setup().await;

    record_run(
        &harness,
        "b1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 0)],
        RunOutcome::Success,
    )
    .await;
    let e1 = record_run(
        &harness,
        "e1",
        "b1",
        Stage::Load,
        "sql",
        vec![CheckResult::from_row_count("fk_home_team", 5)],
        RunOutcome::Failed,
    )
    .await;
    assert_eq!(e1.status, RunStatus::Failed);

    let report = compare(&harness.validation_runs, &pair(), &[], &MutationScope::all())
        .await
        .unwrap();
    assert_eq!(report.records[0].verdict, Verdict::Detected);
}

#[tokio::test]
async fn test_resolve_pair_through_batch_status() {
    let (_dir, harness) = setup().await;

    harness
        .batches
        .upsert("L_SQL", "b1", "exp_e1", RunStatus::Success, None)
        .await
        .unwrap();

    let pair = RunPair::resolve(&harness.batches, &harness.validation_runs, "b1", "exp_e1")
        .await
        .unwrap();
    assert_eq!(pair, RunPair::new("b1", "exp_e1"));

    let unrelated =
        RunPair::resolve(&harness.batches, &harness.validation_runs, "b2", "exp_e1").await;
    assert!(matches!(unrelated, Err(Error::InvalidInput(_))));

    let same = RunPair::resolve(&harness.batches, &harness.validation_runs, "b1", "b1").await;
    assert!(matches!(same, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_resolve_pair_falls_back_to_validation_parent() {
    let (_dir, harness) = setup().await;

    record_run(&harness, "e1", "b1", Stage::Load, "sql", vec![], RunOutcome::Success).await;

    let pair = RunPair::resolve(&harness.batches, &harness.validation_runs, "b1", "e1")
        .await
        .unwrap();
    assert_eq!(pair.experiment_run_id, "e1");
}
