//! Shared types used by the evaluation pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::core::report::TestReport;
use crate::core::spec::EnvironmentSpec;
use crate::error::{ErrorKind, HarnessError};

/// One evaluation unit: a repository revision, a patch set, and target tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub repo: String,
    pub instance_id: String,
    pub base_commit: String,
    /// Applied in order; by convention the test patch comes first.
    pub patches: Vec<String>,
    /// Target test node ids.
    pub tests: Vec<String>,
    pub spec: EnvironmentSpec,
    /// Overrides the scheduler-wide timeout when set.
    pub timeout: Option<Duration>,
}

/// Instances ready to schedule, plus records that could not become one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub instances: Vec<Instance>,
    /// Recorded in place of a run, keyed by instance id.
    pub rejected: BTreeMap<String, InstanceResult>,
}

impl Prepared {
    pub fn reject(&mut self, instance_id: &str, err: &anyhow::Error) {
        self.rejected
            .insert(instance_id.to_string(), InstanceResult::rejected(err));
    }
}

/// Per-run switches for the instance runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Return a `nodeid -> passed` map instead of the full report.
    pub short: bool,
    /// Count `skipped` as a pass in the short map.
    pub skipped_ok: bool,
    /// Tolerate non-import collector failures.
    pub ignore_collector_errors: bool,
    /// Stop the test run at the first failure.
    pub failfast: bool,
    /// Run the container with networking disabled.
    pub network_isolation: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            short: true,
            skipped_ok: true,
            ignore_collector_errors: false,
            failfast: false,
            network_isolation: true,
        }
    }
}

/// What the instance runner hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunOutput {
    Short(BTreeMap<String, bool>),
    Full(TestReport),
}

impl RunOutput {
    /// True when every reported test passed (vacuously true for an empty run).
    pub fn all_passed(&self) -> bool {
        match self {
            RunOutput::Short(map) => map.values().all(|passed| *passed),
            RunOutput::Full(report) => report.tests.iter().all(|t| t.outcome.is_pass()),
        }
    }
}

/// Recorded outcome of one instance in a scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InstanceResult {
    Completed {
        #[serde(rename = "tests")]
        output: RunOutput,
        /// Wall-clock seconds spent running the container.
        time: f64,
    },
    Failed {
        error: String,
        kind: ErrorKind,
    },
}

impl InstanceResult {
    pub fn failed(err: &HarnessError) -> Self {
        InstanceResult::Failed {
            error: err.to_string(),
            kind: err.kind(),
        }
    }

    /// Failure of a record that never became a runnable instance.
    pub fn rejected(err: &anyhow::Error) -> Self {
        InstanceResult::Failed {
            error: format!("{err:#}"),
            kind: ErrorKind::Other,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, InstanceResult::Failed { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            InstanceResult::Failed { error, .. } => Some(error),
            InstanceResult::Completed { .. } => None,
        }
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        match self {
            InstanceResult::Completed { time, .. } => Some(*time),
            InstanceResult::Failed { .. } => None,
        }
    }

    /// True when the instance completed and every target test passed.
    pub fn is_resolved(&self) -> bool {
        match self {
            InstanceResult::Completed { output, .. } => output.all_passed(),
            InstanceResult::Failed { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_short_result_serializes_tests_and_time() {
        let result = InstanceResult::Completed {
            output: RunOutput::Short(BTreeMap::from([("t1".to_string(), true)])),
            time: 1.5,
        };
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["tests"]["t1"], true);
        assert_eq!(json["time"], 1.5);
        assert!(result.is_resolved());
    }

    #[test]
    fn failed_result_carries_kind() {
        let err = HarnessError::container_timeout(Duration::from_secs(5));
        let result = InstanceResult::failed(&err);
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["error"], "Container timed out after 5 seconds.");
        assert!(!result.is_resolved());
    }

    #[test]
    fn any_failing_test_leaves_instance_unresolved() {
        let output = RunOutput::Short(BTreeMap::from([
            ("t1".to_string(), true),
            ("t2".to_string(), false),
        ]));
        assert!(!output.all_passed());
    }
}
