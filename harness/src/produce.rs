//! Differential produce run.
//!
//! Every instance is evaluated twice with full reports: once with the test
//! patch and the gold patch (golden round) and once with the test patch alone
//! (pre-golden round). The two report sets are classified per test into
//! `FAIL_TO_PASS`, `PASS_TO_PASS`, `FAIL_TO_FAIL`, and `PASS_TO_FAIL`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::classifier::{Classification, ClassificationOutcome, classify};
use crate::core::identity::image_identity;
use crate::core::patch::extract_modified_test_files;
use crate::core::types::{Instance, InstanceResult, RunOptions};
use crate::io::dataset::{DatasetRecord, write_json, write_jsonl};
use crate::io::log_sink::LogPaths;
use crate::scheduler::{Engine, ScheduleOptions};

const CONTINUE_ON_COLLECTION_ERRORS: &str = "--continue-on-collection-errors";
const SCORE_FIELDS: [&str; 3] = ["task_score", "evaluation_score", "difficulty_score"];

/// Instances for both rounds, in dataset order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRounds {
    pub golden: Vec<Instance>,
    pub pre_golden: Vec<Instance>,
    /// Records that could not become an instance; they fail both rounds.
    pub rejected: BTreeMap<String, InstanceResult>,
}

/// Targets are the test files the test patch touches; the test command keeps
/// running past collection errors.
pub fn prepare_rounds(records: &[DatasetRecord], black_list: &[String]) -> ProduceRounds {
    let mut rounds = ProduceRounds {
        golden: Vec::with_capacity(records.len()),
        pre_golden: Vec::with_capacity(records.len()),
        rejected: BTreeMap::new(),
    };
    for record in records {
        let tests = extract_modified_test_files(&record.test_patch, black_list);
        let mut golden = match record.to_instance(
            vec![record.test_patch.clone(), record.patch.clone()],
            tests,
        ) {
            Ok(instance) => instance,
            Err(err) => {
                warn!(instance_id = %record.instance_id, err = %err, "instance rejected");
                rounds
                    .rejected
                    .insert(record.instance_id.clone(), InstanceResult::rejected(&err));
                continue;
            }
        };
        if !golden.spec.test_cmd.contains(CONTINUE_ON_COLLECTION_ERRORS) {
            golden.spec.test_cmd = format!("{} {CONTINUE_ON_COLLECTION_ERRORS}", golden.spec.test_cmd);
        }
        let pre_golden = Instance {
            patches: vec![record.test_patch.clone()],
            ..golden.clone()
        };
        rounds.golden.push(golden);
        rounds.pre_golden.push(pre_golden);
    }
    rounds
}

#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub run_id: Option<String>,
    /// Parent of the per-round log directories.
    pub log_root: PathBuf,
    pub output_path: PathBuf,
    pub output_passed: bool,
    pub max_workers: usize,
    pub timeout: Duration,
    pub batch_mode: bool,
    pub black_list: Vec<String>,
}

impl ProduceOptions {
    fn suffix(&self) -> String {
        self.run_id
            .as_deref()
            .map(|id| format!("-{id}"))
            .unwrap_or_default()
    }

    pub fn golden_log_dir(&self) -> PathBuf {
        self.log_root
            .join(format!("produce-golden-eval{}", self.suffix()))
    }

    pub fn pre_golden_log_dir(&self) -> PathBuf {
        self.log_root
            .join(format!("produce-pre-golden-eval{}", self.suffix()))
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_path
            .join(format!("produce_report{}.json", self.suffix()))
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.output_path
            .join(format!("produced_dataset{}.jsonl", self.suffix()))
    }
}

#[derive(Debug)]
pub struct ProduceOutcome {
    pub classifications: BTreeMap<String, ClassificationOutcome>,
    pub report_path: PathBuf,
    pub dataset_path: Option<PathBuf>,
}

/// Run both rounds, classify, and persist the report (and dataset).
#[instrument(skip_all, fields(records = records.len()))]
pub async fn run_produce(
    engine: &Engine,
    records: &[DatasetRecord],
    opts: &ProduceOptions,
) -> Result<ProduceOutcome> {
    let rounds = prepare_rounds(records, &opts.black_list);
    let schedule = ScheduleOptions {
        max_workers: opts.max_workers,
        timeout: opts.timeout,
        batch_mode: opts.batch_mode,
        run: RunOptions {
            short: false,
            skipped_ok: true,
            ignore_collector_errors: true,
            failfast: false,
            network_isolation: true,
        },
    };

    info!("running golden round");
    let mut golden = engine
        .scheduler(LogPaths::new(opts.golden_log_dir()))
        .evaluate(rounds.golden, schedule)
        .await;
    info!("running pre-golden round");
    let mut pre_golden = engine
        .scheduler(LogPaths::new(opts.pre_golden_log_dir()))
        .evaluate(rounds.pre_golden, schedule)
        .await;
    golden.extend(rounds.rejected.clone());
    pre_golden.extend(rounds.rejected);

    let classifications = classify(&pre_golden, &golden);
    let report_path = opts.report_path();
    write_json(&report_path, &classifications).context("write produce report")?;

    let dataset_path = if opts.output_passed {
        let path = opts.dataset_path();
        let rows = produced_rows(records, &classifications)?;
        info!(rows = rows.len(), "writing produced dataset");
        write_jsonl(&path, &rows).context("write produced dataset")?;
        Some(path)
    } else {
        None
    };

    Ok(ProduceOutcome {
        classifications,
        report_path,
        dataset_path,
    })
}

/// Records augmented with their classification, keeping those with a
/// non-empty `FAIL_TO_PASS`.
pub fn produced_rows(
    records: &[DatasetRecord],
    classifications: &BTreeMap<String, ClassificationOutcome>,
) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    for record in records {
        let Some(classification) = classifications
            .get(&record.instance_id)
            .and_then(ClassificationOutcome::classification)
        else {
            continue;
        };
        if classification.fail_to_pass.is_empty() {
            continue;
        }
        rows.push(augment(record, classification)?);
    }
    Ok(rows)
}

fn augment(record: &DatasetRecord, classification: &Classification) -> Result<Value> {
    let mut value = serde_json::to_value(record).context("serialize dataset record")?;
    let Value::Object(map) = &mut value else {
        anyhow::bail!("dataset record {} is not an object", record.instance_id);
    };
    let sets = [
        ("FAIL_TO_PASS", &classification.fail_to_pass),
        ("PASS_TO_PASS", &classification.pass_to_pass),
        ("FAIL_TO_FAIL", &classification.fail_to_fail),
        ("PASS_TO_FAIL", &classification.pass_to_fail),
    ];
    for (key, set) in sets {
        map.insert(key.to_string(), Value::from(set.iter().cloned().collect::<Vec<_>>()));
    }
    for field in SCORE_FIELDS {
        map.entry(field).or_insert_with(|| Value::from(-1));
    }
    let image = record
        .spec_dict
        .as_ref()
        .map(|spec| image_identity(&record.repo, spec).image_name)
        .unwrap_or_default();
    map.insert("image".to_string(), Value::String(image));
    Ok(value)
}
