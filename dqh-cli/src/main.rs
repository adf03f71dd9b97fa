//! dqh - Data-quality harness command line
//!
//! Inspects and maintains the harness bookkeeping database: schema setup,
//! baseline/experiment summaries, batch polling, audit timings, a watchdog
//! command to close stuck validation runs, and SQL constraint checks against
//! a SQLite warehouse.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dqh_common::config::{HarnessConfig, CONFIG_ENV_VAR, DATABASE_ENV_VAR};
use dqh_common::{Harness, RunStatus, Stage};
use tracing::info;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "dqh")]
#[command(about = "Data-quality validation harness")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR, global = true)]
    config: Option<PathBuf>,

    /// Harness database path, overrides the config file
    #[arg(short, long, env = DATABASE_ENV_VAR, global = true)]
    database: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides logging.level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Tsv,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the bookkeeping schema
    Init,

    /// Flat comparison summary of an experiment against its baseline
    Summary {
        /// Baseline run id (defaults to experiment.baseline_run_id)
        #[arg(long)]
        baseline: Option<String>,
        #[arg(long)]
        experiment: String,
        #[arg(long, value_enum, default_value = "tsv")]
        format: OutputFormat,
        /// Rule type covering the mutated area (repeatable)
        #[arg(long = "scope-rule-type")]
        scope_rule_types: Vec<String>,
        /// Check name covering the mutated area (repeatable)
        #[arg(long = "scope-check")]
        scope_checks: Vec<String>,
        /// Print per-tool detection metrics instead of rows
        #[arg(long)]
        metrics: bool,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List experiment runs derived from a baseline
    Experiments {
        #[arg(long)]
        baseline: Option<String>,
    },

    /// List batch rows of a layer in a status
    Batches {
        /// Layer name, e.g. L_SQL
        #[arg(long)]
        layer: String,
        #[arg(long, value_parser = parse_status, default_value = "NEW")]
        status: RunStatus,
    },

    /// Close a stuck validation run as FAILED
    CloseRun {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_parser = parse_stage)]
        stage: Stage,
        #[arg(long)]
        tool: String,
        #[arg(long, default_value = "closed by watchdog")]
        message: String,
    },

    /// Audit entries and per-entity timings of a run/layer
    Audit {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        layer: String,
        /// Seconds per entity instead of raw entries
        #[arg(long)]
        timing: bool,
    },

    /// Run SQL count checks from a TOML file against a SQLite warehouse
    SqlCheck {
        #[arg(long, value_parser = parse_stage)]
        stage: Stage,
        #[arg(long)]
        run_id: String,
        /// Baseline run id when `run_id` is an experiment
        #[arg(long)]
        baseline: Option<String>,
        #[arg(long)]
        dag_id: Option<String>,
        /// TOML file with `[[check]]` entries
        #[arg(long)]
        checks: PathBuf,
        /// SQLite database the checks query
        #[arg(long)]
        warehouse: PathBuf,
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
}

fn parse_stage(value: &str) -> std::result::Result<Stage, String> {
    value.parse().map_err(|e: dqh_common::Error| e.to_string())
}

fn parse_status(value: &str) -> std::result::Result<RunStatus, String> {
    value
        .trim()
        .to_ascii_uppercase()
        .parse()
        .map_err(|e: dqh_common::Error| e.to_string())
}

fn init_tracing(level: &str) {
    let directive: tracing_subscriber::filter::Directive = level
        .parse()
        .unwrap_or_else(|_| tracing::Level::INFO.into());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = HarnessConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?
        .with_database_override(args.database.as_deref());

    init_tracing(args.log_level.as_deref().unwrap_or(&config.logging.level));

    info!(
        "Starting dqh v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Database path: {}", config.database.path.display());

    let harness = Harness::open(&config)
        .await
        .with_context(|| format!("Failed to open {}", config.database.path.display()))?;

    match args.command {
        Command::Init => commands::init(&harness).await,
        Command::Summary {
            baseline,
            experiment,
            format,
            scope_rule_types,
            scope_checks,
            metrics,
            output,
        } => {
            let baseline = commands::baseline_or_config(baseline, &config)?;
            commands::summary(
                &harness,
                &config,
                commands::SummaryRequest {
                    baseline,
                    experiment,
                    format,
                    scope_rule_types,
                    scope_checks,
                    metrics,
                    output,
                },
            )
            .await
        }
        Command::Experiments { baseline } => {
            let baseline = commands::baseline_or_config(baseline, &config)?;
            commands::experiments(&harness, &baseline).await
        }
        Command::Batches { layer, status } => commands::batches(&harness, &layer, status).await,
        Command::CloseRun {
            run_id,
            stage,
            tool,
            message,
        } => commands::close_run(&harness, &run_id, stage, &tool, &message).await,
        Command::Audit {
            run_id,
            layer,
            timing,
        } => commands::audit(&harness, &run_id, &layer, timing).await,
        Command::SqlCheck {
            stage,
            run_id,
            baseline,
            dag_id,
            checks,
            warehouse,
            report_dir,
        } => {
            commands::sql_check(
                &harness,
                &config,
                commands::SqlCheckRequest {
                    stage,
                    run_id,
                    baseline,
                    dag_id,
                    checks,
                    warehouse,
                    report_dir,
                },
            )
            .await
        }
    }
}
