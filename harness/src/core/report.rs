//! Structured test report model and reconciliation against requested tests.
//!
//! The report is the JSON document written by the test command inside the
//! container (one record per executed test node, optional collectors, and an
//! optional root directory). Unknown keys are preserved so a full report can be
//! handed back to callers without loss.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HarnessError, HarnessResult};

/// Outcome of a single test node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Error,
    Xfailed,
    Xpassed,
    #[serde(other)]
    Unknown,
}

impl Outcome {
    /// Passed or skipped.
    pub fn is_pass(self) -> bool {
        matches!(self, Outcome::Passed | Outcome::Skipped)
    }

    /// Failed or errored.
    pub fn is_fail(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Error)
    }
}

/// Crash location reported for a failing phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Crash {
    Location {
        path: String,
        lineno: i64,
        message: String,
    },
    Text(String),
    Other(Value),
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crash::Location {
                path,
                lineno,
                message,
            } => write!(f, "{path}:{lineno}: {message}"),
            Crash::Text(text) => f.write_str(text),
            Crash::Other(value) => write!(f, "{value}"),
        }
    }
}

/// One of the setup/call/teardown sub-records of a test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<Crash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longrepr: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub nodeid: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<PhaseReport>,
    /// Test-level crash record, present in some report versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<Crash>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestOutcome {
    /// Phases in execution order.
    pub fn phases(&self) -> [Option<&PhaseReport>; 3] {
        [self.setup.as_ref(), self.call.as_ref(), self.teardown.as_ref()]
    }

    /// `error` entry standing in for a requested test that never ran.
    pub fn missing(nodeid: &str, collector_longrepr: Option<&str>) -> Self {
        let setup = PhaseReport {
            outcome: Some("failed".to_string()),
            duration: Some(0.0),
            longrepr: Some(
                collector_longrepr
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{nodeid} not found in the working directory.")),
            ),
            ..PhaseReport::default()
        };
        let teardown = collector_longrepr.is_none().then(|| PhaseReport {
            outcome: Some("skipped".to_string()),
            duration: Some(0.0),
            longrepr: Some(format!("{nodeid} not found in the working directory.")),
            ..PhaseReport::default()
        });
        let mut extra = Map::new();
        extra.insert("lineno".to_string(), Value::from(0));
        extra.insert("keywords".to_string(), Value::Array(Vec::new()));
        Self {
            nodeid: nodeid.to_string(),
            outcome: Outcome::Error,
            setup: Some(setup),
            call: None,
            teardown,
            crash: None,
            extra,
        }
    }
}

/// A test-discovery unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collector {
    pub nodeid: String,
    pub outcome: String,
    #[serde(default)]
    pub longrepr: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Collector {
    pub fn failed(&self) -> bool {
        self.outcome == "failed"
    }

    /// Module resolution failures point at a broken environment, never at the patch.
    pub fn is_import_error(&self) -> bool {
        self.longrepr.contains("ModuleNotFoundError") || self.longrepr.contains("ImportError")
    }
}

/// Root directory the test runner uses inside the image.
pub const DEFAULT_ROOT: &str = "/workspace";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestReport {
    #[serde(default)]
    pub tests: Vec<TestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collectors: Option<Vec<Collector>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestReport {
    /// `nodeid -> passed` map; with `skipped_ok` a skipped test counts as passed.
    pub fn short_results(&self, skipped_ok: bool) -> BTreeMap<String, bool> {
        self.tests
            .iter()
            .map(|t| {
                let passed = if skipped_ok {
                    t.outcome.is_pass()
                } else {
                    t.outcome == Outcome::Passed
                };
                (t.nodeid.clone(), passed)
            })
            .collect()
    }

    /// Rebuild a minimal report from a short `nodeid -> passed` map.
    pub fn from_short(map: &BTreeMap<String, bool>) -> Self {
        let tests = map
            .iter()
            .map(|(nodeid, passed)| TestOutcome {
                nodeid: nodeid.clone(),
                outcome: if *passed {
                    Outcome::Passed
                } else {
                    Outcome::Failed
                },
                setup: None,
                call: None,
                teardown: None,
                crash: None,
                extra: Map::new(),
            })
            .collect();
        Self {
            tests,
            ..Self::default()
        }
    }

    /// Root directory marker when it differs from the image's working directory.
    pub fn non_default_root(&self) -> Option<&str> {
        self.root
            .as_deref()
            .filter(|root| !root.is_empty() && *root != DEFAULT_ROOT)
    }
}

/// Switches controlling [`collect_report`].
#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    pub short: bool,
    pub skipped_ok: bool,
    pub ignore_collector_errors: bool,
}

/// A parsed and reconciled report.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub report: TestReport,
    pub short: BTreeMap<String, bool>,
    /// Requested tests absent from the report.
    pub missing: Vec<String>,
    /// Collectors that failed for a non-import reason and were tolerated.
    pub tolerated_collectors: BTreeMap<String, String>,
}

/// Parse the raw report file and reconcile it with the requested tests.
///
/// `stderr` is the captured error output of the test command; it is surfaced
/// when the report file is empty.
pub fn collect_report(
    report_text: &str,
    stderr: &str,
    tests: &[String],
    opts: CollectOptions,
) -> HarnessResult<Collected> {
    if report_text.trim().is_empty() {
        if stderr.trim().is_empty() {
            return Err(HarnessError::Report(
                "Error while generating the test reports. Is the test command writing a JSON report?"
                    .to_string(),
            ));
        }
        return Err(HarnessError::Report(format!(
            "Error while generating the test reports.\n{stderr}"
        )));
    }
    let mut report: TestReport = serde_json::from_str(report_text)
        .map_err(|e| HarnessError::Report(format!("parse test report: {e}")))?;

    let mut short = report.short_results(opts.skipped_ok);

    let mut tolerated = BTreeMap::new();
    if !tests.is_empty()
        && let Some(collectors) = &report.collectors
    {
        for collector in collectors.iter().filter(|c| c.failed()) {
            if collector.is_import_error() {
                return Err(HarnessError::Collection {
                    nodeid: collector.nodeid.clone(),
                    longrepr: collector.longrepr.clone(),
                    import_error: true,
                });
            }
            tolerated.insert(collector.nodeid.clone(), collector.longrepr.clone());
        }
        if !opts.ignore_collector_errors
            && let Some((nodeid, longrepr)) = tolerated.iter().next()
        {
            return Err(HarnessError::Collection {
                nodeid: nodeid.clone(),
                longrepr: longrepr.clone(),
                import_error: false,
            });
        }
    }

    let mut missing = Vec::new();
    for test in tests {
        if reported(&short, test) {
            continue;
        }
        short.insert(test.clone(), false);
        missing.push(test.clone());
        if !opts.short {
            let longrepr = tolerated
                .iter()
                .find(|(nodeid, _)| test.contains(nodeid.as_str()))
                .map(|(_, longrepr)| longrepr.as_str());
            report.tests.push(TestOutcome::missing(test, longrepr));
        }
    }

    Ok(Collected {
        report,
        short,
        missing,
        tolerated_collectors: tolerated,
    })
}

/// A target counts as reported when its node id is present, or when it names
/// a test file whose node ids (`file::name`) are.
fn reported(short: &BTreeMap<String, bool>, test: &str) -> bool {
    short.contains_key(test)
        || short
            .keys()
            .any(|nodeid| nodeid.strip_prefix(test).is_some_and(|rest| rest.starts_with("::")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTS: CollectOptions = CollectOptions {
        short: false,
        skipped_ok: true,
        ignore_collector_errors: false,
    };

    fn tests_of(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_report_and_empty_stderr_is_a_report_error() {
        let err = collect_report("", "", &[], OPTS).expect_err("error");
        assert!(matches!(err, HarnessError::Report(_)));
    }

    #[test]
    fn empty_report_surfaces_stderr() {
        let err = collect_report("  ", "usage: pytest [options]", &[], OPTS).expect_err("error");
        assert!(err.to_string().contains("usage: pytest"));
    }

    #[test]
    fn skipped_counts_as_pass_only_when_allowed() {
        let text = r#"{"tests": [{"nodeid": "a.py::t", "outcome": "skipped"}]}"#;
        let loose = collect_report(text, "", &[], OPTS).expect("collect");
        assert!(loose.short["a.py::t"]);

        let strict = collect_report(
            text,
            "",
            &[],
            CollectOptions {
                skipped_ok: false,
                ..OPTS
            },
        )
        .expect("collect");
        assert!(!strict.short["a.py::t"]);
    }

    #[test]
    fn missing_tests_are_marked_failed_and_synthesized() {
        let text = r#"{"tests": [{"nodeid": "a.py::t1", "outcome": "passed"}]}"#;
        let collected =
            collect_report(text, "", &tests_of(&["a.py::t1", "a.py::t2"]), OPTS).expect("collect");
        assert!(!collected.short["a.py::t2"]);
        assert_eq!(collected.missing, vec!["a.py::t2".to_string()]);
        let synthesized = collected
            .report
            .tests
            .iter()
            .find(|t| t.nodeid == "a.py::t2")
            .expect("synthesized entry");
        assert_eq!(synthesized.outcome, Outcome::Error);
        let setup = synthesized.setup.as_ref().expect("setup");
        assert_eq!(
            setup.longrepr.as_deref(),
            Some("a.py::t2 not found in the working directory.")
        );
    }

    #[test]
    fn requested_tests_absent_from_a_larger_report_are_marked_failed() {
        let text = r#"{"tests": [
            {"nodeid": "a.py::t1", "outcome": "passed"},
            {"nodeid": "a.py::t3", "outcome": "passed"}
        ]}"#;
        let collected =
            collect_report(text, "", &tests_of(&["a.py::t1", "a.py::t2"]), OPTS).expect("collect");
        assert!(collected.short["a.py::t1"]);
        assert!(!collected.short["a.py::t2"]);
        assert_eq!(collected.missing, vec!["a.py::t2".to_string()]);
        assert!(collected.report.tests.iter().any(|t| t.nodeid == "a.py::t2"));
    }

    #[test]
    fn file_targets_are_covered_by_their_node_ids() {
        let text = r#"{"tests": [{"nodeid": "tests/test_a.py::t1", "outcome": "failed"}]}"#;
        let collected = collect_report(
            text,
            "",
            &tests_of(&["tests/test_a.py", "tests/test_b.py"]),
            OPTS,
        )
        .expect("collect");
        assert_eq!(collected.missing, vec!["tests/test_b.py".to_string()]);
        assert!(!collected.short.contains_key("tests/test_a.py"));
    }

    #[test]
    fn import_error_collectors_always_fail() {
        let text = r#"{
            "tests": [],
            "collectors": [{"nodeid": "a.py", "outcome": "failed", "longrepr": "ModuleNotFoundError: numpy"}]
        }"#;
        let opts = CollectOptions {
            ignore_collector_errors: true,
            ..OPTS
        };
        let err = collect_report(text, "", &tests_of(&["a.py::t1"]), opts).expect_err("error");
        assert!(matches!(
            err,
            HarnessError::Collection {
                import_error: true,
                ..
            }
        ));
    }

    #[test]
    fn other_collector_failures_follow_configuration() {
        let text = r#"{
            "tests": [],
            "collectors": [{"nodeid": "a.py", "outcome": "failed", "longrepr": "SyntaxError"}]
        }"#;
        let tests = tests_of(&["a.py::t1"]);
        let err = collect_report(text, "", &tests, OPTS).expect_err("strict");
        assert!(matches!(
            err,
            HarnessError::Collection {
                import_error: false,
                ..
            }
        ));

        let opts = CollectOptions {
            ignore_collector_errors: true,
            ..OPTS
        };
        let collected = collect_report(text, "", &tests, opts).expect("tolerated");
        let synthesized = &collected.report.tests[0];
        assert_eq!(
            synthesized.setup.as_ref().and_then(|p| p.longrepr.as_deref()),
            Some("SyntaxError")
        );
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let text = r#"{"created": 1.0, "tests": [{"nodeid": "t", "outcome": "passed", "lineno": 3}]}"#;
        let collected = collect_report(text, "", &[], OPTS).expect("collect");
        let json = serde_json::to_value(&collected.report).expect("json");
        assert_eq!(json["created"], 1.0);
        assert_eq!(json["tests"][0]["lineno"], 3);
    }

    #[test]
    fn crash_location_renders_path_and_line() {
        let crash: Crash =
            serde_json::from_str(r#"{"path": "a.py", "lineno": 7, "message": "AssertionError"}"#)
                .expect("crash");
        assert_eq!(crash.to_string(), "a.py:7: AssertionError");
    }
}
