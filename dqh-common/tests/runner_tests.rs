//! Integration tests for the stage runner and the SQL count adapter
//!
//! The warehouse is a separate SQLite file with a tiny games/teams model; the
//! experiment run carries games rows pointing at a missing team.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::setup;
use dqh_common::adapters::{
    AdapterReport, CheckSink, SqlCheckSpec, SqlCountAdapter, StageRunner, StageTarget,
    ToolAdapter, ToolOutcome,
};
use dqh_common::comparison::{compare, MutationScope, RunPair, Verdict};
use dqh_common::config::ExperimentConfig;
use dqh_common::models::CheckResult;
use dqh_common::{CheckStatus, RunStatus, Stage};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

async fn warehouse(dir: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(dir.join("warehouse.db"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .unwrap();

    for sql in [
        "CREATE TABLE teams (run_id TEXT NOT NULL, team_id INTEGER NOT NULL)",
        "CREATE TABLE games (run_id TEXT NOT NULL, game_id INTEGER NOT NULL, home_team_id INTEGER)",
        "INSERT INTO teams VALUES ('b1', 1), ('b1', 2), ('exp_e1', 1), ('exp_e1', 2)",
        "INSERT INTO games VALUES ('b1', 10, 1), ('b1', 11, 2), \
         ('exp_e1', 10, 1), ('exp_e1', 11, 99), ('exp_e1', 12, 98), ('exp_e1', 13, 97)",
    ] {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
    pool
}

fn specs() -> Vec<SqlCheckSpec> {
    vec![
        SqlCheckSpec::new(
            "fk_home_team",
            "SELECT COUNT(*) FROM games g WHERE g.run_id = {run_id} AND NOT EXISTS \
             (SELECT 1 FROM teams t WHERE t.run_id = g.run_id AND t.team_id = g.home_team_id)",
        )
        .rule_type("foreign_key")
        .severity("error")
        .stage(Stage::Load),
        SqlCheckSpec::new(
            "not_null_home_team",
            "SELECT COUNT(*) FROM games WHERE run_id = {run_id} AND home_team_id IS NULL",
        )
        .rule_type("not_null"),
        SqlCheckSpec::new("pk_venues", "SELECT COUNT(*) FROM venues").rule_type("primary_key"),
    ]
}

/// Records one check, then breaks
struct CrashingAdapter;

#[async_trait]
impl ToolAdapter for CrashingAdapter {
    fn tool(&self) -> &str {
        "soda"
    }

    async fn execute(
        &self,
        _target: &StageTarget,
        sink: &mut dyn CheckSink,
    ) -> anyhow::Result<AdapterReport> {
        sink.record(CheckResult::from_row_count("row_count_games", 0)).await?;
        anyhow::bail!("soda scan exited with status 2")
    }
}

#[tokio::test]
async fn test_sql_adapter_run_records_checks_and_batch_status() {
    let (dir, harness) = setup().await;
    let pool = warehouse(dir.path()).await;
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(
        SqlCountAdapter::new(pool, specs()).with_report_dir(dir.path().join("reports")),
    )];

    let runner = StageRunner::new(harness.clone());
    let target = StageTarget::experiment(Stage::Load, "exp_e1", "b1").with_dag("etl_dag");
    let summaries = runner.run(&target, &adapters).await.unwrap();

    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.layer, "L_SQL");
    // fk_home_team FAIL, pk_venues ERROR (no such table)
    assert_eq!(summary.outcome, ToolOutcome::ChecksFailed { failing: 2 });

    let run = summary.validation_run.as_ref().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.checks_total, 3);
    assert_eq!(run.checks_failed, 1);
    assert_eq!(run.rows_failed, 3);
    assert_eq!(run.parent_run_id.as_deref(), Some("b1"));
    assert!(run.config_hash.as_ref().is_some_and(|h| h.len() == 64));
    let report_path = run.report_path.as_ref().unwrap();
    assert!(Path::new(report_path).exists());

    let checks = harness
        .validation_runs
        .check_results(run.validation_run_id)
        .await
        .unwrap();
    let by_name: BTreeMap<_, _> = checks
        .iter()
        .map(|c| (c.result.check_name.as_str(), &c.result))
        .collect();
    assert_eq!(by_name["fk_home_team"].status, CheckStatus::Fail);
    assert_eq!(by_name["fk_home_team"].rows_failed, Some(3));
    assert_eq!(by_name["fk_home_team"].severity.as_deref(), Some("error"));
    assert_eq!(by_name["not_null_home_team"].status, CheckStatus::Pass);
    assert_eq!(by_name["pk_venues"].status, CheckStatus::Error);
    assert!(by_name["pk_venues"].message.is_some());

    let batch = harness.batches.get("L_SQL", "exp_e1").await.unwrap();
    assert_eq!(batch.status, RunStatus::Failed);
    assert_eq!(batch.parent_run_id, "b1");
    assert_eq!(batch.dag_id.as_deref(), Some("etl_dag"));
    assert!(batch.error_message.is_some());
}

#[tokio::test]
async fn test_stage_filter_on_check_specs() {
    let (dir, harness) = setup().await;
    let pool = warehouse(dir.path()).await;
    let adapters: Vec<Arc<dyn ToolAdapter>> =
        vec![Arc::new(SqlCountAdapter::new(pool, specs()))];

    let summaries = StageRunner::new(harness.clone())
        .run(&StageTarget::baseline(Stage::Extract, "b1"), &adapters)
        .await
        .unwrap();

    // fk_home_team is Load-only
    let run = summaries[0].validation_run.as_ref().unwrap();
    assert_eq!(run.checks_total, 2);
}

#[tokio::test]
async fn test_adapter_failure_closes_run_failed_and_keeps_checks() {
    let (_dir, harness) = setup().await;
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(CrashingAdapter)];

    let summaries = StageRunner::new(harness.clone())
        .run(&StageTarget::baseline(Stage::Extract, "b1"), &adapters)
        .await
        .unwrap();

    match &summaries[0].outcome {
        ToolOutcome::AdapterFailed { message } => assert!(message.contains("exited with status 2")),
        other => panic!("expected AdapterFailed, got {:?}", other),
    }

    let run = harness.validation_runs.get("b1", Stage::Extract, "soda").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.checks_total, 1);
    assert!(run.message.unwrap().contains("exited with status 2"));

    let batch = harness.batches.get("E_SODA", "b1").await.unwrap();
    assert_eq!(batch.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_runs_carry_resource_usage_in_meta() {
    let (dir, harness) = setup().await;
    let pool = warehouse(dir.path()).await;
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
        Arc::new(SqlCountAdapter::new(pool, specs())),
        Arc::new(CrashingAdapter),
    ];

    StageRunner::new(harness.clone())
        .run(&StageTarget::baseline(Stage::Load, "b1"), &adapters)
        .await
        .unwrap();

    for tool in ["sql", "soda"] {
        let run = harness.validation_runs.get("b1", Stage::Load, tool).await.unwrap();
        let meta = run.meta.unwrap();
        let wall = meta["resources"]["wall_time_s"].as_f64().unwrap();
        assert!(wall >= 0.0, "{} wall time {}", tool, wall);
    }

    let soda = harness.validation_runs.get("b1", Stage::Load, "soda").await.unwrap();
    assert_eq!(soda.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_failed_batch_is_retried_with_attempt_count() {
    let (_dir, harness) = setup().await;
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(CrashingAdapter)];
    let runner = StageRunner::new(harness.clone());
    let target = StageTarget::baseline(Stage::Extract, "b1");

    runner.run(&target, &adapters).await.unwrap();
    runner.run(&target, &adapters).await.unwrap();

    let batch = harness.batches.get("E_SODA", "b1").await.unwrap();
    assert_eq!(batch.attempts, 1);
    assert_eq!(harness.validation_runs.list_for_run("b1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_tools_disabled_for_stage_are_skipped() {
    let (dir, harness) = setup().await;
    let pool = warehouse(dir.path()).await;
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
        Arc::new(SqlCountAdapter::new(pool, specs())),
        Arc::new(CrashingAdapter),
    ];

    let mut tools_by_stage = BTreeMap::new();
    tools_by_stage.insert(Stage::Load, vec!["sql".to_string()]);
    let experiment = ExperimentConfig {
        name: "fk_breakage".to_string(),
        baseline_run_id: Some("b1".to_string()),
        tools_by_stage: Some(tools_by_stage),
    };

    let summaries = StageRunner::new(harness.clone())
        .with_experiment(experiment)
        .run(&StageTarget::baseline(Stage::Load, "b1"), &adapters)
        .await
        .unwrap();

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].tool, "sql");
    assert!(summaries[0].validation_run.is_some());
    assert_eq!(summaries[1].tool, "soda");
    assert_eq!(summaries[1].outcome, ToolOutcome::Skipped);
    assert!(harness.validation_runs.get("b1", Stage::Load, "soda").await.is_err());
}

#[tokio::test]
async fn test_end_to_end_detection() {
    let (dir, harness) = setup().await;
    let pool = warehouse(dir.path()).await;
    let adapters: Vec<Arc<dyn ToolAdapter>> =
        vec![Arc::new(SqlCountAdapter::new(pool, specs()))];
    let runner = StageRunner::new(harness.clone());

    runner
        .run(&StageTarget::baseline(Stage::Load, "b1"), &adapters)
        .await
        .unwrap();
    runner
        .run(&StageTarget::experiment(Stage::Load, "exp_e1", "b1"), &adapters)
        .await
        .unwrap();

    let pair = RunPair::resolve(&harness.batches, &harness.validation_runs, "b1", "exp_e1")
        .await
        .unwrap();
    let scope = MutationScope::all().with_rule_type("foreign_key");
    let report = compare(&harness.validation_runs, &pair, &[], &scope)
        .await
        .unwrap();

    let fk = report
        .records
        .iter()
        .find(|r| r.check_name.as_deref() == Some("fk_home_team"))
        .unwrap();
    assert_eq!(fk.verdict, Verdict::Detected);
    assert_eq!(fk.experiment_rows_failed, Some(3));

    // pk_venues errors on both sides; not in scope
    let pk = report
        .records
        .iter()
        .find(|r| r.check_name.as_deref() == Some("pk_venues"))
        .unwrap();
    assert_eq!(pk.verdict, Verdict::Unaffected);
}
