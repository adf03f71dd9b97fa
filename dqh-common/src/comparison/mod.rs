//! Baseline/experiment comparison
//!
//! Scores an experiment run (mutated data) against its baseline, per stage,
//! tool and check:
//!
//! - only closed validation runs count, the latest one per (run, stage, tool)
//! - within a run the chronologically last result per `check_name` decides
//!   the outcome (`finished_at`, else `started_at`; insertion order breaks ties)
//! - a (stage, tool) with no closed run on one side yields `SKIPPED` rows
//!
//! The flat summary keeps per-attempt counters, so summing `checks_failed` per
//! (run mode, stage, tool) reproduces the stored run counters.

mod summary;
mod verdict;

pub use summary::{to_json, write_tsv, SummaryRow, SUMMARY_COLUMNS};
pub use verdict::{DetectionMetrics, MutationScope, Verdict};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::models::{CheckStatus, RunMode, Stage, StoredCheckResult, ValidationRun};
use crate::tracking::{BatchStatusTracker, ValidationRunTracker};
use crate::{Error, Result};

/// A baseline run and one experiment derived from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPair {
    pub baseline_run_id: String,
    pub experiment_run_id: String,
}

impl RunPair {
    /// Unchecked pair
    pub fn new(baseline_run_id: impl Into<String>, experiment_run_id: impl Into<String>) -> Self {
        Self {
            baseline_run_id: baseline_run_id.into(),
            experiment_run_id: experiment_run_id.into(),
        }
    }

    /// Pair verified against the bookkeeping tables
    ///
    /// The experiment's batch status rows must carry the baseline as
    /// `parent_run_id`. Validation runs recording the same parent are accepted
    /// when no batch rows exist.
    pub async fn resolve(
        batches: &BatchStatusTracker,
        runs: &ValidationRunTracker,
        baseline_run_id: &str,
        experiment_run_id: &str,
    ) -> Result<Self> {
        if baseline_run_id == experiment_run_id {
            return Err(Error::InvalidInput(format!(
                "baseline and experiment are the same run: {}",
                baseline_run_id
            )));
        }

        if batches
            .is_derived_from(experiment_run_id, baseline_run_id)
            .await?
        {
            return Ok(Self::new(baseline_run_id, experiment_run_id));
        }

        let via_validation = runs
            .list_for_run(experiment_run_id)
            .await?
            .iter()
            .any(|r| r.parent_run_id.as_deref() == Some(baseline_run_id));

        if via_validation {
            warn!(
                baseline_run_id,
                experiment_run_id,
                "No batch status links the pair; using validation run parent"
            );
            return Ok(Self::new(baseline_run_id, experiment_run_id));
        }

        Err(Error::InvalidInput(format!(
            "run {} is not derived from baseline {}",
            experiment_run_id, baseline_run_id
        )))
    }
}

/// Outcome of one check across the pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub stage: Stage,
    pub tool: String,
    /// `None` for a skipped (stage, tool) with no checks on either side
    pub check_name: Option<String>,
    pub rule_type: Option<String>,
    pub baseline: Option<CheckStatus>,
    pub experiment: Option<CheckStatus>,
    pub experiment_rows_failed: Option<i64>,
    pub in_scope: bool,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub pair: RunPair,
    pub records: Vec<ComparisonRecord>,
    pub rows: Vec<SummaryRow>,
    pub metrics: Vec<DetectionMetrics>,
}

impl ComparisonReport {
    pub fn metrics_for(&self, stage: Stage, tool: &str) -> Option<&DetectionMetrics> {
        self.metrics
            .iter()
            .find(|m| m.stage == stage && m.tool == tool)
    }
}

/// Per-check view of one validation run
struct CheckTally {
    last: StoredCheckResult,
    attempts: i64,
    failed: i64,
    rows_failed: i64,
}

struct RunSide {
    run: ValidationRun,
    checks: BTreeMap<String, CheckTally>,
}

impl RunSide {
    fn build(run: ValidationRun, results: Vec<StoredCheckResult>) -> Self {
        let mut checks: BTreeMap<String, CheckTally> = BTreeMap::new();
        for stored in results {
            let failed = stored.result.status == CheckStatus::Fail;
            let rows = if failed {
                stored.result.rows_failed.unwrap_or(0)
            } else {
                0
            };
            match checks.get_mut(&stored.result.check_name) {
                Some(tally) => {
                    tally.attempts += 1;
                    tally.failed += failed as i64;
                    tally.rows_failed += rows;
                    if scored_order(&stored) >= scored_order(&tally.last) {
                        tally.last = stored;
                    }
                }
                None => {
                    checks.insert(
                        stored.result.check_name.clone(),
                        CheckTally {
                            last: stored,
                            attempts: 1,
                            failed: failed as i64,
                            rows_failed: rows,
                        },
                    );
                }
            }
        }
        Self { run, checks }
    }

    fn status_of(&self, check_name: &str) -> Option<CheckStatus> {
        self.checks.get(check_name).map(|t| t.last.result.status)
    }

    fn rule_type_of(&self, check_name: &str) -> Option<&str> {
        self.checks
            .get(check_name)
            .and_then(|t| t.last.result.rule_type.as_deref())
    }
}

/// Chronological position of an attempt; the insertion id breaks ties
fn scored_order(stored: &StoredCheckResult) -> (DateTime<Utc>, i64) {
    let result = &stored.result;
    (
        result.finished_at.unwrap_or(result.started_at),
        stored.validation_check_id,
    )
}

type ToolKey = (Stage, String);

/// Latest closed validation run per (stage, tool) of one run id
async fn closed_runs(
    runs: &ValidationRunTracker,
    run_id: &str,
) -> Result<BTreeMap<ToolKey, RunSide>> {
    let mut latest: BTreeMap<ToolKey, ValidationRun> = BTreeMap::new();
    for run in runs.list_for_run(run_id).await? {
        if !run.status.is_terminal() {
            debug!(
                validation_run_id = run.validation_run_id,
                status = %run.status,
                "Ignoring open validation run in comparison"
            );
            continue;
        }
        // list_for_run is ordered by id, so later runs replace earlier ones
        latest.insert((run.stage, run.tool.to_lowercase()), run);
    }

    let mut sides = BTreeMap::new();
    for (key, run) in latest {
        let results = runs.check_results(run.validation_run_id).await?;
        sides.insert(key, RunSide::build(run, results));
    }
    Ok(sides)
}

/// Compare an experiment run against its baseline
///
/// `expected_pairs` lists (stage, tool) combinations that must show up even
/// when neither side ran them, as SKIPPED rows.
pub async fn compare(
    runs: &ValidationRunTracker,
    pair: &RunPair,
    expected_pairs: &[(Stage, String)],
    scope: &MutationScope,
) -> Result<ComparisonReport> {
    let baseline = closed_runs(runs, &pair.baseline_run_id).await?;
    let experiment = closed_runs(runs, &pair.experiment_run_id).await?;

    let keys: BTreeSet<ToolKey> = baseline
        .keys()
        .chain(experiment.keys())
        .cloned()
        .chain(expected_pairs.iter().map(|(s, t)| (*s, t.to_lowercase())))
        .collect();

    let mut report = ComparisonReport {
        pair: pair.clone(),
        records: Vec::new(),
        rows: Vec::new(),
        metrics: Vec::new(),
    };

    for key in keys {
        let mut metrics = DetectionMetrics::new(key.0, key.1.clone());
        let b = baseline.get(&key);
        let e = experiment.get(&key);

        match (b, e) {
            (Some(b), Some(e)) => compare_sides(pair, &key, b, e, scope, &mut report, &mut metrics),
            _ => skip_sides(pair, &key, b, e, &mut report, &mut metrics),
        }

        report.metrics.push(metrics);
    }

    info!(
        baseline_run_id = %pair.baseline_run_id,
        experiment_run_id = %pair.experiment_run_id,
        tools = report.metrics.len(),
        rows = report.rows.len(),
        detected = report.metrics.iter().map(|m| m.detected).sum::<u32>(),
        "Comparison complete"
    );

    Ok(report)
}

fn summary_row(
    pair: &RunPair,
    key: &ToolKey,
    mode: RunMode,
    run_id: &str,
    side: Option<&RunSide>,
    check_name: Option<&str>,
    verdict: Verdict,
) -> SummaryRow {
    let tally = side.zip(check_name).and_then(|(s, name)| s.checks.get(name));
    SummaryRow {
        baseline_run_id: pair.baseline_run_id.clone(),
        experiment_run_id: pair.experiment_run_id.clone(),
        stage: key.0,
        tool: key.1.clone(),
        run_mode: mode,
        run_id: run_id.to_string(),
        check_name: check_name.map(str::to_string),
        rule_type: tally.and_then(|t| t.last.result.rule_type.clone()),
        check_status: tally.map(|t| t.last.result.status),
        checks_total: tally.map_or(0, |t| t.attempts),
        checks_failed: tally.map_or(0, |t| t.failed),
        rows_checked: side.and_then(|s| s.run.rows_checked),
        rows_failed: tally.map_or(0, |t| t.rows_failed),
        detection_verdict: verdict,
    }
}

fn compare_sides(
    pair: &RunPair,
    key: &ToolKey,
    baseline: &RunSide,
    experiment: &RunSide,
    scope: &MutationScope,
    report: &mut ComparisonReport,
    metrics: &mut DetectionMetrics,
) {
    let names: BTreeSet<&String> = baseline
        .checks
        .keys()
        .chain(experiment.checks.keys())
        .collect();

    let sides = [
        (RunMode::Baseline, &pair.baseline_run_id, baseline),
        (RunMode::Experiment, &pair.experiment_run_id, experiment),
    ];
    for (mode, run_id, side) in sides {
        if side.checks.is_empty() {
            debug!(
                stage = %key.0,
                tool = %key.1,
                run_mode = %mode,
                validation_run_id = side.run.validation_run_id,
                "Closed validation run recorded no checks"
            );
            report.rows.push(summary_row(
                pair,
                key,
                mode,
                run_id,
                Some(side),
                None,
                Verdict::Skipped,
            ));
        }
    }
    if names.is_empty() {
        report.records.push(skipped_record(key));
        metrics.add(Verdict::Skipped);
    }

    for name in names {
        let rule_type = experiment
            .rule_type_of(name)
            .or_else(|| baseline.rule_type_of(name));
        let in_scope = scope.covers(name, rule_type);
        let b_status = baseline.status_of(name);
        let e_status = experiment.status_of(name);
        let verdict = Verdict::classify(b_status, e_status, in_scope);
        metrics.add(verdict);

        if baseline.checks.contains_key(name) {
            report.rows.push(summary_row(
                pair,
                key,
                RunMode::Baseline,
                &pair.baseline_run_id,
                Some(baseline),
                Some(name.as_str()),
                verdict,
            ));
        }
        if experiment.checks.contains_key(name) {
            report.rows.push(summary_row(
                pair,
                key,
                RunMode::Experiment,
                &pair.experiment_run_id,
                Some(experiment),
                Some(name.as_str()),
                verdict,
            ));
        }

        report.records.push(ComparisonRecord {
            stage: key.0,
            tool: key.1.clone(),
            check_name: Some(name.clone()),
            rule_type: rule_type.map(str::to_string),
            baseline: b_status,
            experiment: e_status,
            experiment_rows_failed: experiment
                .checks
                .get(name)
                .and_then(|t| t.last.result.rows_failed),
            in_scope,
            verdict,
        });
    }
}

fn skip_sides(
    pair: &RunPair,
    key: &ToolKey,
    baseline: Option<&RunSide>,
    experiment: Option<&RunSide>,
    report: &mut ComparisonReport,
    metrics: &mut DetectionMetrics,
) {
    warn!(
        stage = %key.0,
        tool = %key.1,
        baseline = baseline.is_some(),
        experiment = experiment.is_some(),
        "No closed validation run on one side; marking SKIPPED"
    );

    let sides = [
        (RunMode::Baseline, &pair.baseline_run_id, baseline),
        (RunMode::Experiment, &pair.experiment_run_id, experiment),
    ];

    let mut recorded = false;
    for (mode, run_id, side) in sides {
        match side {
            Some(side) if !side.checks.is_empty() => {
                for (name, tally) in &side.checks {
                    report.rows.push(summary_row(
                        pair,
                        key,
                        mode,
                        run_id,
                        Some(side),
                        Some(name.as_str()),
                        Verdict::Skipped,
                    ));
                    let status = Some(tally.last.result.status);
                    let (b, e) = match mode {
                        RunMode::Baseline => (status, None),
                        RunMode::Experiment => (None, status),
                    };
                    report.records.push(ComparisonRecord {
                        stage: key.0,
                        tool: key.1.clone(),
                        check_name: Some(name.clone()),
                        rule_type: tally.last.result.rule_type.clone(),
                        baseline: b,
                        experiment: e,
                        experiment_rows_failed: None,
                        in_scope: false,
                        verdict: Verdict::Skipped,
                    });
                    metrics.add(Verdict::Skipped);
                    recorded = true;
                }
            }
            // Missing run, or a run that closed without recording a check
            _ => report.rows.push(summary_row(
                pair,
                key,
                mode,
                run_id,
                side,
                None,
                Verdict::Skipped,
            )),
        }
    }

    if !recorded {
        report.records.push(skipped_record(key));
        metrics.add(Verdict::Skipped);
    }
}

/// Placeholder record for a (stage, tool) with nothing to compare
fn skipped_record(key: &ToolKey) -> ComparisonRecord {
    ComparisonRecord {
        stage: key.0,
        tool: key.1.clone(),
        check_name: None,
        rule_type: None,
        baseline: None,
        experiment: None,
        experiment_rows_failed: None,
        in_scope: false,
        verdict: Verdict::Skipped,
    }
}
