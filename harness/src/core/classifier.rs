//! Differential classification of test outcomes between two rounds.
//!
//! The pre round runs the instance without the candidate patch, the post round
//! with it. Every test node observed in the post round lands in at most one of
//! four transition sets.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::report::{Outcome, TestOutcome, TestReport};
use crate::core::types::{InstanceResult, RunOutput};

/// Per-instance transition sets plus crash details for the still/newly failing tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: BTreeSet<String>,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: BTreeSet<String>,
    #[serde(rename = "FAIL_TO_FAIL")]
    pub fail_to_fail: BTreeSet<String>,
    #[serde(rename = "PASS_TO_FAIL")]
    pub pass_to_fail: BTreeSet<String>,
    #[serde(rename = "FAIL_TO_FAIL_DETAILS")]
    pub fail_to_fail_details: BTreeMap<String, String>,
    #[serde(rename = "PASS_TO_FAIL_DETAILS")]
    pub pass_to_fail_details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ClassificationOutcome {
    Classified(Classification),
    Error { error: String },
}

impl ClassificationOutcome {
    pub fn classification(&self) -> Option<&Classification> {
        match self {
            ClassificationOutcome::Classified(c) => Some(c),
            ClassificationOutcome::Error { .. } => None,
        }
    }
}

/// Crash text for one failing test.
///
/// `error` concatenates the long-form text of every phase. `failed` prefers a
/// test-level crash, then the first phase (call, setup, teardown) carrying a
/// crash record, then that phase order's long-form text.
pub fn crash_detail(test: &TestOutcome) -> Option<String> {
    match test.outcome {
        Outcome::Error => {
            let mut text = String::new();
            for (i, phase) in test.phases().into_iter().enumerate() {
                if let Some(phase) = phase {
                    text.push_str(phase.longrepr.as_deref().unwrap_or_default());
                    if i < 2 {
                        text.push('\n');
                    }
                }
            }
            Some(text)
        }
        Outcome::Failed => {
            if let Some(crash) = &test.crash {
                return Some(crash.to_string());
            }
            let ordered = [test.call.as_ref(), test.setup.as_ref(), test.teardown.as_ref()];
            let crash = ordered
                .iter()
                .flatten()
                .find_map(|phase| phase.crash.as_ref().map(ToString::to_string));
            let longrepr = || {
                ordered
                    .iter()
                    .flatten()
                    .find_map(|phase| phase.longrepr.clone())
            };
            Some(crash.or_else(longrepr).unwrap_or_default())
        }
        _ => None,
    }
}

/// `nodeid -> crash text` for every failed or errored test in the report.
pub fn crash_details(report: &TestReport) -> BTreeMap<String, String> {
    report
        .tests
        .iter()
        .filter_map(|t| crash_detail(t).map(|d| (t.nodeid.clone(), d)))
        .collect()
}

fn pass_set(report: &TestReport) -> BTreeSet<String> {
    report
        .tests
        .iter()
        .filter(|t| t.outcome.is_pass())
        .map(|t| t.nodeid.clone())
        .collect()
}

fn fail_set(report: &TestReport) -> BTreeSet<String> {
    report
        .tests
        .iter()
        .filter(|t| t.outcome.is_fail())
        .map(|t| t.nodeid.clone())
        .collect()
}

fn intersect(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    a.intersection(b).cloned().collect()
}

fn pick(details: &BTreeMap<String, String>, keys: &BTreeSet<String>) -> BTreeMap<String, String> {
    keys.iter()
        .filter_map(|k| details.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// Join a node id onto a root directory with POSIX path semantics.
fn rooted(root: &str, nodeid: &str) -> String {
    if nodeid.starts_with('/') {
        nodeid.to_string()
    } else if root.ends_with('/') {
        format!("{root}{nodeid}")
    } else {
        format!("{root}/{nodeid}")
    }
}

impl Classification {
    fn rebase(self, root: &str) -> Self {
        let ids = |set: BTreeSet<String>| set.iter().map(|id| rooted(root, id)).collect();
        let details = |map: BTreeMap<String, String>| {
            map.into_iter()
                .map(|(id, detail)| (rooted(root, &id), detail))
                .collect()
        };
        Self {
            fail_to_pass: ids(self.fail_to_pass),
            pass_to_pass: ids(self.pass_to_pass),
            fail_to_fail: ids(self.fail_to_fail),
            pass_to_fail: ids(self.pass_to_fail),
            fail_to_fail_details: details(self.fail_to_fail_details),
            pass_to_fail_details: details(self.pass_to_fail_details),
        }
    }
}

/// Classify one instance from its pre-round and post-round reports.
///
/// `pre` is `Err(message)` when the baseline could not be evaluated; every
/// observed test is then treated as starting from failing.
pub fn classify_reports(pre: Result<&TestReport, &str>, post: &TestReport) -> Classification {
    let post_pass = pass_set(post);
    let details = crash_details(post);
    let post_fail: BTreeSet<String> = details.keys().cloned().collect();

    let classification = match pre {
        Err(_) => Classification {
            fail_to_pass: post_pass,
            fail_to_fail: post_fail,
            fail_to_fail_details: details,
            ..Classification::default()
        },
        Ok(pre) => {
            let pre_pass = pass_set(pre);
            let pre_fail = fail_set(pre);
            let fail_to_fail = intersect(&pre_fail, &post_fail);
            let pass_to_fail = intersect(&pre_pass, &post_fail);
            Classification {
                fail_to_pass: intersect(&pre_fail, &post_pass),
                pass_to_pass: intersect(&pre_pass, &post_pass),
                fail_to_fail_details: pick(&details, &fail_to_fail),
                pass_to_fail_details: pick(&details, &pass_to_fail),
                fail_to_fail,
                pass_to_fail,
            }
        }
    };

    match post.non_default_root() {
        Some(root) => classification.rebase(root),
        None => classification,
    }
}

fn as_report(output: &RunOutput) -> Cow<'_, TestReport> {
    match output {
        RunOutput::Full(report) => Cow::Borrowed(report),
        RunOutput::Short(map) => Cow::Owned(TestReport::from_short(map)),
    }
}

/// Classify every instance present in both rounds.
pub fn classify(
    pre_results: &BTreeMap<String, InstanceResult>,
    post_results: &BTreeMap<String, InstanceResult>,
) -> BTreeMap<String, ClassificationOutcome> {
    let mut out = BTreeMap::new();
    for (instance_id, post) in post_results {
        let Some(pre) = pre_results.get(instance_id) else {
            continue;
        };
        let outcome = match post {
            InstanceResult::Failed { error, .. } => ClassificationOutcome::Error {
                error: error.clone(),
            },
            InstanceResult::Completed { output, .. } => {
                let post_report = as_report(output);
                let classification = match pre {
                    InstanceResult::Failed { error, .. } => {
                        classify_reports(Err(error.as_str()), &*post_report)
                    }
                    InstanceResult::Completed { output, .. } => {
                        classify_reports(Ok(&*as_report(output)), &*post_report)
                    }
                };
                ClassificationOutcome::Classified(classification)
            }
        };
        out.insert(instance_id.clone(), outcome);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::{Crash, PhaseReport};
    use crate::error::ErrorKind;

    fn outcome(nodeid: &str, outcome: Outcome) -> TestOutcome {
        TestOutcome {
            nodeid: nodeid.to_string(),
            outcome,
            setup: None,
            call: None,
            teardown: None,
            crash: None,
            extra: serde_json::Map::new(),
        }
    }

    fn report(entries: &[(&str, Outcome)]) -> TestReport {
        TestReport {
            tests: entries.iter().map(|(id, o)| outcome(id, *o)).collect(),
            ..TestReport::default()
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn computes_transition_sets() {
        let pre = report(&[
            ("t1", Outcome::Failed),
            ("t2", Outcome::Error),
            ("t3", Outcome::Passed),
        ]);
        let post = report(&[
            ("t1", Outcome::Passed),
            ("t2", Outcome::Error),
            ("t3", Outcome::Skipped),
        ]);
        let c = classify_reports(Ok(&pre), &post);
        assert_eq!(c.fail_to_pass, set(&["t1"]));
        assert_eq!(c.pass_to_pass, set(&["t3"]));
        assert_eq!(c.fail_to_fail, set(&["t2"]));
        assert!(c.pass_to_fail.is_empty());
        assert!(c.fail_to_fail_details.contains_key("t2"));
    }

    #[test]
    fn baseline_error_treats_everything_as_failing_first() {
        let post = report(&[
            ("a", Outcome::Passed),
            ("b", Outcome::Skipped),
            ("c", Outcome::Failed),
        ]);
        let c = classify_reports(Err("build failed"), &post);
        assert_eq!(c.fail_to_pass, set(&["a", "b"]));
        assert_eq!(c.fail_to_fail, set(&["c"]));
        assert!(c.pass_to_pass.is_empty());
        assert!(c.pass_to_fail.is_empty());
    }

    #[test]
    fn newly_failing_tests_land_in_pass_to_fail() {
        let pre = report(&[("a", Outcome::Passed)]);
        let post = report(&[("a", Outcome::Failed)]);
        let c = classify_reports(Ok(&pre), &post);
        assert_eq!(c.pass_to_fail, set(&["a"]));
        assert_eq!(c.pass_to_fail_details.get("a").map(String::as_str), Some(""));
    }

    #[test]
    fn sets_are_pairwise_disjoint() {
        let pre = report(&[
            ("a", Outcome::Passed),
            ("b", Outcome::Failed),
            ("c", Outcome::Skipped),
            ("d", Outcome::Error),
            ("e", Outcome::Passed),
        ]);
        let post = report(&[
            ("a", Outcome::Failed),
            ("b", Outcome::Passed),
            ("c", Outcome::Passed),
            ("d", Outcome::Error),
            ("f", Outcome::Passed),
        ]);
        let c = classify_reports(Ok(&pre), &post);
        let all = [
            &c.fail_to_pass,
            &c.pass_to_pass,
            &c.fail_to_fail,
            &c.pass_to_fail,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert!(a.is_disjoint(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn rewrites_ids_under_non_default_root() {
        let pre = report(&[("t.py::a", Outcome::Failed)]);
        let mut post = report(&[("t.py::a", Outcome::Passed)]);
        post.root = Some("/workspace/pkg".to_string());
        let c = classify_reports(Ok(&pre), &post);
        assert_eq!(c.fail_to_pass, set(&["/workspace/pkg/t.py::a"]));

        post.root = Some("/workspace".to_string());
        let c = classify_reports(Ok(&pre), &post);
        assert_eq!(c.fail_to_pass, set(&["t.py::a"]));
    }

    #[test]
    fn failed_crash_prefers_call_phase() {
        let mut test = outcome("t", Outcome::Failed);
        test.setup = Some(PhaseReport {
            longrepr: Some("setup text".to_string()),
            ..PhaseReport::default()
        });
        test.call = Some(PhaseReport {
            crash: Some(Crash::Location {
                path: "t.py".to_string(),
                lineno: 3,
                message: "assert 1 == 2".to_string(),
            }),
            ..PhaseReport::default()
        });
        assert_eq!(crash_detail(&test).as_deref(), Some("t.py:3: assert 1 == 2"));

        test.call = None;
        assert_eq!(crash_detail(&test).as_deref(), Some("setup text"));
    }

    #[test]
    fn error_crash_concatenates_phases() {
        let mut test = outcome("t", Outcome::Error);
        test.setup = Some(PhaseReport {
            longrepr: Some("fixture broke".to_string()),
            ..PhaseReport::default()
        });
        test.teardown = Some(PhaseReport {
            longrepr: Some("cleanup broke".to_string()),
            ..PhaseReport::default()
        });
        assert_eq!(
            crash_detail(&test).as_deref(),
            Some("fixture broke\ncleanup broke")
        );
    }

    #[test]
    fn post_round_error_short_circuits() {
        let pre = BTreeMap::from([(
            "i1".to_string(),
            InstanceResult::Completed {
                output: RunOutput::Full(report(&[("a", Outcome::Passed)])),
                time: 1.0,
            },
        )]);
        let post = BTreeMap::from([
            (
                "i1".to_string(),
                InstanceResult::Failed {
                    error: "Container timed out after 5 seconds.".to_string(),
                    kind: ErrorKind::Timeout,
                },
            ),
            (
                "only-post".to_string(),
                InstanceResult::Completed {
                    output: RunOutput::Full(TestReport::default()),
                    time: 1.0,
                },
            ),
        ]);
        let out = classify(&pre, &post);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out["i1"],
            ClassificationOutcome::Error {
                error: "Container timed out after 5 seconds.".to_string()
            }
        );
    }
}
