//! Subcommand implementations

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use dqh_common::adapters::{SqlCheckSpec, SqlCountAdapter, StageRunner, StageTarget, ToolAdapter};
use dqh_common::comparison::{self, MutationScope, RunPair};
use dqh_common::config::HarnessConfig;
use dqh_common::db::migrations::get_schema_version;
use dqh_common::models::{CloseDetails, RunOutcome};
use dqh_common::{Harness, RunStatus, Stage};

use crate::OutputFormat;

pub async fn init(harness: &Harness) -> Result<()> {
    let version = get_schema_version(&harness.pool).await?;
    println!("schema version {}", version);
    Ok(())
}

pub fn baseline_or_config(baseline: Option<String>, config: &HarnessConfig) -> Result<String> {
    baseline
        .or_else(|| {
            config
                .experiment
                .as_ref()
                .and_then(|e| e.baseline_run_id.clone())
        })
        .ok_or_else(|| anyhow!("--baseline not given and experiment.baseline_run_id not set"))
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    })
}

pub struct SummaryRequest {
    pub baseline: String,
    pub experiment: String,
    pub format: OutputFormat,
    pub scope_rule_types: Vec<String>,
    pub scope_checks: Vec<String>,
    pub metrics: bool,
    pub output: Option<PathBuf>,
}

pub async fn summary(harness: &Harness, config: &HarnessConfig, req: SummaryRequest) -> Result<()> {
    let pair = RunPair::resolve(
        &harness.batches,
        &harness.validation_runs,
        &req.baseline,
        &req.experiment,
    )
    .await?;

    let scope = MutationScope {
        rule_types: req.scope_rule_types.into_iter().collect(),
        check_names: req.scope_checks.into_iter().collect(),
    };
    let expected = config
        .experiment
        .as_ref()
        .map(|e| e.expected_pairs())
        .unwrap_or_default();

    let report = comparison::compare(&harness.validation_runs, &pair, &expected, &scope).await?;
    let mut out = open_output(req.output.as_deref())?;

    match (req.metrics, req.format) {
        (false, OutputFormat::Tsv) => comparison::write_tsv(&report.rows, &mut out)?,
        (false, OutputFormat::Json) => writeln!(out, "{}", comparison::to_json(&report.rows)?)?,
        (true, OutputFormat::Json) => {
            writeln!(out, "{}", serde_json::to_string_pretty(&report.metrics)?)?
        }
        (true, OutputFormat::Tsv) => {
            writeln!(
                out,
                "stage\ttool\tdetected\tmissed\tfalse_positive\tunaffected\tskipped\tdetection_rate"
            )?;
            for m in &report.metrics {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    m.stage.code(),
                    m.tool,
                    m.detected,
                    m.missed,
                    m.false_positive,
                    m.unaffected,
                    m.skipped,
                    m.detection_rate
                        .map(|r| format!("{:.4}", r))
                        .unwrap_or_default()
                )?;
            }
        }
    }
    out.flush()?;

    if let Some(path) = &req.output {
        info!("Summary written to {}", path.display());
    }
    Ok(())
}

pub async fn experiments(harness: &Harness, baseline: &str) -> Result<()> {
    let runs = harness.batches.experiments_of(baseline).await?;
    if runs.is_empty() {
        warn!(baseline, "No experiment runs found");
    }
    for run in runs {
        println!("{}", run);
    }
    Ok(())
}

pub async fn batches(harness: &Harness, layer: &str, status: RunStatus) -> Result<()> {
    let rows = harness.batches.list_by_status(layer, status).await?;
    println!("layer\tparent_run_id\trun_id\tstatus\tattempts\tlast_updated_at\terror_message");
    for row in rows {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.layer,
            row.parent_run_id,
            row.run_id,
            row.status,
            row.attempts,
            row.last_updated_at.to_rfc3339(),
            row.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn close_run(
    harness: &Harness,
    run_id: &str,
    stage: Stage,
    tool: &str,
    message: &str,
) -> Result<()> {
    let handle = harness
        .validation_runs
        .find_active(run_id, stage, tool)
        .await?
        .ok_or_else(|| anyhow!("no open validation run for {}/{}/{}", run_id, stage, tool))?;

    let run = harness
        .validation_runs
        .close(&handle, RunOutcome::Failed, CloseDetails::message(message))
        .await?;

    println!(
        "closed validation run {} as {} after {} checks",
        run.validation_run_id, run.status, run.checks_total
    );
    Ok(())
}

pub async fn audit(harness: &Harness, run_id: &str, layer: &str, timing: bool) -> Result<()> {
    if timing {
        println!("entity_name\ttasks\tseconds_sum");
        for t in harness.audit.timing_summary(run_id, layer).await? {
            println!("{}\t{}\t{:.3}", t.entity_name, t.tasks, t.seconds_sum);
        }
        return Ok(());
    }

    println!("audit_id\ttask_id\tentity_name\tstatus\tstarted_at\tfinished_at\trows_processed");
    for e in harness.audit.list(run_id, layer).await? {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            e.audit_id,
            e.task_id.unwrap_or_default(),
            e.entity_name,
            e.status,
            e.started_at.to_rfc3339(),
            e.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            e.rows_processed.map(|r| r.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChecksFile {
    #[serde(rename = "check", default)]
    checks: Vec<SqlCheckSpec>,
}

fn load_checks(path: &Path) -> Result<Vec<SqlCheckSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: ChecksFile =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    if file.checks.is_empty() {
        bail!("{} defines no [[check]] entries", path.display());
    }
    Ok(file.checks)
}

pub struct SqlCheckRequest {
    pub stage: Stage,
    pub run_id: String,
    pub baseline: Option<String>,
    pub dag_id: Option<String>,
    pub checks: PathBuf,
    pub warehouse: PathBuf,
    pub report_dir: Option<PathBuf>,
}

pub async fn sql_check(harness: &Harness, config: &HarnessConfig, req: SqlCheckRequest) -> Result<()> {
    let specs = load_checks(&req.checks)?;

    let options = SqliteConnectOptions::new()
        .filename(&req.warehouse)
        .read_only(true);
    let warehouse = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open warehouse {}", req.warehouse.display()))?;

    let mut adapter = SqlCountAdapter::new(warehouse, specs);
    if let Some(dir) = req.report_dir {
        adapter = adapter.with_report_dir(dir);
    }
    let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(adapter)];

    let mut target = match req.baseline {
        Some(baseline) => StageTarget::experiment(req.stage, &req.run_id, baseline),
        None => StageTarget::baseline(req.stage, &req.run_id),
    };
    if let Some(dag_id) = req.dag_id {
        target = target.with_dag(dag_id);
    }

    let mut runner = StageRunner::new(harness.clone());
    if let Some(experiment) = &config.experiment {
        runner = runner.with_experiment(experiment.clone());
    }

    for summary in runner.run(&target, &adapters).await? {
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}
