//! Single-round evaluation of candidate patches against a dataset.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::{InstanceResult, Prepared, RunOptions};
use crate::io::dataset::{DatasetRecord, select_records, write_json, write_jsonl};
use crate::io::log_sink::LogPaths;
use crate::scheduler::{Engine, ScheduleOptions};

/// Aggregated outcome of an evaluation run, written as `evaluation_report.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub run_id: String,
    pub resolved: usize,
    pub unresolved: usize,
    pub errors: usize,
    pub total: usize,
    /// Instance id to seconds spent.
    pub resolved_instances: BTreeMap<String, f64>,
    pub unresolved_instances: BTreeMap<String, f64>,
    pub errors_instances: Vec<String>,
}

impl EvaluationReport {
    pub fn from_results(run_id: &str, results: &BTreeMap<String, InstanceResult>) -> Self {
        let mut report = EvaluationReport {
            run_id: run_id.to_string(),
            total: results.len(),
            ..EvaluationReport::default()
        };
        for (id, result) in results {
            match result.elapsed_secs() {
                None => report.errors_instances.push(id.clone()),
                Some(secs) if result.is_resolved() => {
                    report.resolved_instances.insert(id.clone(), secs);
                }
                Some(secs) => {
                    report.unresolved_instances.insert(id.clone(), secs);
                }
            }
        }
        report.resolved = report.resolved_instances.len();
        report.unresolved = report.unresolved_instances.len();
        report.errors = report.errors_instances.len();
        report
    }
}

/// Default run id, `evaluate-%Y%m%d-%H%M%S`.
pub fn default_run_id() -> String {
    Local::now().format("evaluate-%Y%m%d-%H%M%S").to_string()
}

/// Build evaluation instances: patches `[test_patch, candidate]` where the
/// candidate is the prediction for the id (gold patch without predictions),
/// targets `PASS_TO_PASS` then `FAIL_TO_PASS`. A record without an
/// environment spec is rejected on its own; unknown ids fail the whole call.
pub fn prepare_instances(
    records: &[DatasetRecord],
    ids: Option<&[String]>,
    predictions: Option<&HashMap<String, String>>,
) -> Result<Prepared> {
    let mut prepared = Prepared::default();
    for record in select_records(records, ids)? {
        let candidate = predictions
            .and_then(|p| p.get(&record.instance_id))
            .unwrap_or(&record.patch);
        match record.to_instance(
            vec![record.test_patch.clone(), candidate.clone()],
            record.target_tests(),
        ) {
            Ok(instance) => prepared.instances.push(instance),
            Err(err) => {
                warn!(instance_id = %record.instance_id, err = %err, "instance rejected");
                prepared.reject(&record.instance_id, &err);
            }
        }
    }
    Ok(prepared)
}

#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    pub run_id: String,
    /// Root of this run's logs.
    pub log_dir: PathBuf,
    /// Directory receiving `evaluation_report.json`.
    pub output_path: PathBuf,
    /// Also write `resolved_dataset.jsonl`.
    pub output_passed: bool,
    pub max_workers: usize,
    pub timeout: Duration,
    pub failfast: bool,
    pub batch_mode: bool,
    pub network_isolation: bool,
    pub remove_images: bool,
}

#[derive(Debug)]
pub struct EvaluateOutcome {
    pub report: EvaluationReport,
    pub results: BTreeMap<String, InstanceResult>,
    pub report_path: PathBuf,
}

/// Run one evaluation round over the prepared instances and persist the
/// summary; rejected records are reported as errors.
#[instrument(skip_all, fields(run_id = %opts.run_id))]
pub async fn run_evaluate(
    engine: &Engine,
    records: &[DatasetRecord],
    prepared: Prepared,
    opts: &EvaluateOptions,
) -> Result<EvaluateOutcome> {
    let scheduler = engine.scheduler(LogPaths::new(&opts.log_dir));
    let mut results = scheduler
        .evaluate(
            prepared.instances,
            ScheduleOptions {
                max_workers: opts.max_workers,
                timeout: opts.timeout,
                batch_mode: opts.batch_mode,
                run: RunOptions {
                    short: true,
                    skipped_ok: true,
                    ignore_collector_errors: false,
                    failfast: opts.failfast,
                    network_isolation: opts.network_isolation,
                },
            },
        )
        .await;
    results.extend(prepared.rejected);

    let report = EvaluationReport::from_results(&opts.run_id, &results);
    let report_path = opts.output_path.join("evaluation_report.json");
    write_json(&report_path, &report)?;

    if opts.output_passed {
        let resolved: Vec<&DatasetRecord> = records
            .iter()
            .filter(|r| report.resolved_instances.contains_key(&r.instance_id))
            .collect();
        write_jsonl(&opts.output_path.join("resolved_dataset.jsonl"), &resolved)?;
    }

    if opts.remove_images {
        let removed = engine.images.remove_images().await;
        info!(count = removed.len(), "removed images");
    }

    info!(
        total = report.total,
        resolved = report.resolved,
        unresolved = report.unresolved,
        errors = report.errors,
        "evaluation finished"
    );
    Ok(EvaluateOutcome {
        report,
        results,
        report_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunOutput;
    use crate::error::ErrorKind;

    fn record(id: &str) -> DatasetRecord {
        serde_json::from_value(serde_json::json!({
            "instance_id": id,
            "repo": "owner/proj",
            "base_commit": "abc",
            "patch": "GOLD",
            "test_patch": "TEST",
            "FAIL_TO_PASS": ["f2p"],
            "PASS_TO_PASS": ["p2p"],
            "spec_dict": {"python": "3.11", "test_cmd": "pytest"},
        }))
        .expect("record")
    }

    #[test]
    fn predictions_replace_the_gold_patch() {
        let records = vec![record("a"), record("b")];
        let predictions = HashMap::from([("a".to_string(), "MODEL".to_string())]);
        let instances = prepare_instances(&records, None, Some(&predictions))
            .expect("prepare")
            .instances;
        assert_eq!(instances[0].patches, vec!["TEST", "MODEL"]);
        assert_eq!(instances[1].patches, vec!["TEST", "GOLD"]);
        assert_eq!(instances[0].tests, vec!["p2p", "f2p"]);
    }

    #[test]
    fn unknown_instance_ids_are_rejected() {
        let records = vec![record("a")];
        assert!(prepare_instances(&records, Some(&["zzz".to_string()]), None).is_err());
    }

    #[test]
    fn records_without_a_spec_are_rejected_individually() {
        let mut bare = record("bare");
        bare.spec_dict = None;
        let records = vec![record("a"), bare];
        let prepared = prepare_instances(&records, None, None).expect("prepare");
        assert_eq!(prepared.instances.len(), 1);
        assert_eq!(prepared.instances[0].instance_id, "a");
        let rejected = &prepared.rejected["bare"];
        assert!(
            rejected
                .error_message()
                .is_some_and(|e| e.contains("has no spec_dict"))
        );
        assert_eq!(
            EvaluationReport::from_results("r", &prepared.rejected).errors_instances,
            vec!["bare"]
        );
    }

    #[test]
    fn report_splits_resolved_unresolved_and_errors() {
        let results = BTreeMap::from([
            (
                "ok".to_string(),
                InstanceResult::Completed {
                    output: RunOutput::Short(BTreeMap::from([("t".to_string(), true)])),
                    time: 2.0,
                },
            ),
            (
                "bad".to_string(),
                InstanceResult::Completed {
                    output: RunOutput::Short(BTreeMap::from([("t".to_string(), false)])),
                    time: 3.0,
                },
            ),
            (
                "err".to_string(),
                InstanceResult::Failed {
                    error: "boom".to_string(),
                    kind: ErrorKind::Other,
                },
            ),
        ]);
        let report = EvaluationReport::from_results("run-1", &results);
        assert_eq!(report.total, 3);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.resolved_instances["ok"], 2.0);
        assert_eq!(report.errors_instances, vec!["err"]);
    }

    #[test]
    fn default_run_id_has_prefix() {
        assert!(default_run_id().starts_with("evaluate-"));
    }
}
