//! Per-stage runner
//!
//! Drives every enabled tool adapter for one stage target concurrently. Per
//! tool:
//!
//! 1. batch status `NEW -> PROCESSING` on layer `{STAGE}_{TOOL}`
//! 2. open the validation run
//! 3. stream checks through a `TrackerSink`
//! 4. close the run: SUCCESS when the adapter completed, FAILED when it errored;
//!    `meta.resources` carries wall time, CPU and RSS for the adapter call
//! 5. final batch status: FAILED when any check failed or errored
//!
//! Tools are isolated from each other; one adapter erroring does not stop the
//! others.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::resources::{with_resources, ResourceMeter};
use super::{StageTarget, ToolAdapter, TrackerSink};
use crate::config::ExperimentConfig;
use crate::models::{CloseDetails, OpenRun, RunOutcome, RunStatus, Stage, ValidationRun};
use crate::{Error, Harness, Result};

/// Batch status layer for a stage/tool, e.g. `E_SQL`
pub fn layer_name(stage: Stage, tool: &str) -> String {
    format!("{}_{}", stage.code(), tool.trim().to_uppercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    Passed,
    ChecksFailed { failing: u32 },
    AdapterFailed { message: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRunSummary {
    pub tool: String,
    pub layer: String,
    pub outcome: ToolOutcome,
    pub validation_run: Option<ValidationRun>,
}

pub struct StageRunner {
    harness: Harness,
    experiment: Option<ExperimentConfig>,
}

impl StageRunner {
    pub fn new(harness: Harness) -> Self {
        Self {
            harness,
            experiment: None,
        }
    }

    /// Restrict tools per stage to the experiment's `tools_by_stage`
    pub fn with_experiment(mut self, experiment: ExperimentConfig) -> Self {
        self.experiment = Some(experiment);
        self
    }

    fn tool_enabled(&self, stage: Stage, tool: &str) -> bool {
        self.experiment
            .as_ref()
            .map_or(true, |e| e.tool_enabled(stage, tool))
    }

    /// Run every enabled adapter against `target`
    ///
    /// Summaries come back in adapter order. Bookkeeping failures (database
    /// errors, duplicate opens) abort with the first error after all tools
    /// have finished.
    pub async fn run(
        &self,
        target: &StageTarget,
        adapters: &[Arc<dyn ToolAdapter>],
    ) -> Result<Vec<ToolRunSummary>> {
        let mut slots: Vec<Option<ToolRunSummary>> = vec![None; adapters.len()];
        let mut join_set = JoinSet::new();

        for (index, adapter) in adapters.iter().enumerate() {
            let tool = adapter.tool().to_lowercase();
            if !self.tool_enabled(target.stage, &tool) {
                info!(stage = %target.stage, tool = %tool, "Skipping tool not enabled for stage");
                slots[index] = Some(ToolRunSummary {
                    layer: layer_name(target.stage, &tool),
                    tool,
                    outcome: ToolOutcome::Skipped,
                    validation_run: None,
                });
                continue;
            }

            let harness = self.harness.clone();
            let target = target.clone();
            let adapter = Arc::clone(adapter);
            join_set.spawn(async move { (index, run_tool(harness, target, adapter).await) });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(summary))) => slots[index] = Some(summary),
                Ok((index, Err(e))) => {
                    error!(tool = %adapters[index].tool(), error = %e, "Tool bookkeeping failed");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    error!(error = %join_err, "Tool task panicked");
                    first_error
                        .get_or_insert(Error::Internal(format!("tool task failed: {}", join_err)));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

async fn run_tool(
    harness: Harness,
    target: StageTarget,
    adapter: Arc<dyn ToolAdapter>,
) -> Result<ToolRunSummary> {
    let tool = adapter.tool().to_lowercase();
    let layer = layer_name(target.stage, &tool);
    let dag_id = target.dag_id.as_deref();

    let existing = harness
        .batches
        .get_exact(&layer, &target.parent_run_id, &target.run_id)
        .await?;
    if existing.is_none() {
        harness
            .batches
            .upsert_for_dag(dag_id, &layer, &target.parent_run_id, &target.run_id, RunStatus::New, None)
            .await?;
    }
    harness
        .batches
        .upsert_for_dag(
            dag_id,
            &layer,
            &target.parent_run_id,
            &target.run_id,
            RunStatus::Processing,
            None,
        )
        .await?;

    let mut request = OpenRun::new(&target.run_id, target.stage, &tool)
        .parent(&target.parent_run_id)
        .kind(target.kind());
    if let Some(dag_id) = &target.dag_id {
        request = request.dag(dag_id);
    }
    if let Some(suite) = adapter.suite() {
        request = request.suite(suite);
    }
    if let Some(hash) = adapter.config_hash() {
        request = request.config_hash(hash);
    }

    let handle = match harness.validation_runs.open(&request).await {
        Ok(handle) => handle,
        Err(e) => {
            fail_batch(&harness, &target, &layer, &format!("could not open validation run: {}", e))
                .await;
            return Err(e);
        }
    };

    let mut sink = TrackerSink::new(harness.validation_runs.clone(), handle.clone());
    let meter = ResourceMeter::start();
    let executed = adapter.execute(&target, &mut sink).await;
    let resources = meter.finish();

    let (run, outcome) = match executed {
        Ok(report) => {
            let details = CloseDetails {
                rows_checked: report.rows_checked,
                report_path: report.report_path,
                message: None,
                meta: Some(with_resources(report.meta, resources)),
            };
            let run = harness
                .validation_runs
                .close(&handle, RunOutcome::Success, details)
                .await?;
            let outcome = match sink.failing() {
                0 => ToolOutcome::Passed,
                failing => ToolOutcome::ChecksFailed { failing },
            };
            (run, outcome)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(
                tool = %tool,
                run_id = %target.run_id,
                recorded = sink.recorded(),
                error = %message,
                "Tool adapter failed; closing run as FAILED"
            );
            let details = CloseDetails {
                meta: Some(with_resources(None, resources)),
                ..CloseDetails::message(&message)
            };
            let run = harness
                .validation_runs
                .close(&handle, RunOutcome::Failed, details)
                .await?;
            (run, ToolOutcome::AdapterFailed { message })
        }
    };

    let (status, error_message) = match &outcome {
        ToolOutcome::Passed => (RunStatus::Success, None),
        ToolOutcome::ChecksFailed { failing } => (
            RunStatus::Failed,
            Some(format!("{} {} checks failed", failing, layer)),
        ),
        ToolOutcome::AdapterFailed { message } => (RunStatus::Failed, Some(message.clone())),
        ToolOutcome::Skipped => (RunStatus::Success, None),
    };
    harness
        .batches
        .upsert_for_dag(
            dag_id,
            &layer,
            &target.parent_run_id,
            &target.run_id,
            status,
            error_message.as_deref(),
        )
        .await?;

    info!(
        tool = %tool,
        layer = %layer,
        run_id = %target.run_id,
        checks_total = run.checks_total,
        checks_failed = run.checks_failed,
        batch_status = %status,
        "Tool run finished"
    );

    Ok(ToolRunSummary {
        tool,
        layer,
        outcome,
        validation_run: Some(run),
    })
}

async fn fail_batch(harness: &Harness, target: &StageTarget, layer: &str, message: &str) {
    if let Err(e) = harness
        .batches
        .upsert_for_dag(
            target.dag_id.as_deref(),
            layer,
            &target.parent_run_id,
            &target.run_id,
            RunStatus::Failed,
            Some(message),
        )
        .await
    {
        error!(layer, error = %e, "Failed to mark batch FAILED");
    }
}
