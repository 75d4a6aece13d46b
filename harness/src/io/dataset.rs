//! Dataset loading and result persistence.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::spec::EnvironmentSpec;
use crate::core::types::Instance;

/// One task record. Unknown keys are kept so records can be written back out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetRecord {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    /// Reference (gold) patch.
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(rename = "FAIL_TO_PASS", default)]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", default)]
    pub pass_to_pass: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_dict: Option<EnvironmentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetRecord {
    /// Version key used to look up a versioned spec override.
    pub fn version_key(&self) -> String {
        match &self.version {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "default".to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// `PASS_TO_PASS` followed by `FAIL_TO_PASS`.
    pub fn target_tests(&self) -> Vec<String> {
        self.pass_to_pass
            .iter()
            .chain(&self.fail_to_pass)
            .cloned()
            .collect()
    }

    /// Build an instance with the given patches and target tests.
    pub fn to_instance(&self, patches: Vec<String>, tests: Vec<String>) -> Result<Instance> {
        let spec = self
            .spec_dict
            .clone()
            .ok_or_else(|| anyhow!("instance {} has no spec_dict", self.instance_id))?;
        Ok(Instance {
            repo: self.repo.clone(),
            instance_id: self.instance_id.clone(),
            base_commit: self.base_commit.clone(),
            patches,
            tests,
            spec,
            timeout: None,
        })
    }
}

/// Load a `.json` array or a `.jsonl` file.
pub fn load_records(path: &Path) -> Result<Vec<DatasetRecord>> {
    load_json_values(path)?
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            serde_json::from_value(value)
                .with_context(|| format!("parse record {} of {}", i + 1, path.display()))
        })
        .collect()
}

fn load_json_values(path: &Path) -> Result<Vec<Value>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read dataset {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        }
        Some("jsonl") => contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), i + 1))
            })
            .collect(),
        _ => bail!("dataset file format not supported: {}", path.display()),
    }
}

#[derive(Deserialize)]
struct Prediction {
    instance_id: String,
    #[serde(default)]
    model_patch: Option<String>,
}

/// `instance_id -> model_patch` from a predictions file.
pub fn load_predictions(path: &Path) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for value in load_json_values(path)? {
        let prediction: Prediction = serde_json::from_value(value)
            .with_context(|| format!("parse prediction in {}", path.display()))?;
        out.insert(
            prediction.instance_id,
            prediction.model_patch.unwrap_or_default(),
        );
    }
    Ok(out)
}

/// Keep only `ids` (in the given order), failing on unknown ids.
pub fn select_records<'a>(
    records: &'a [DatasetRecord],
    ids: Option<&[String]>,
) -> Result<Vec<&'a DatasetRecord>> {
    let Some(ids) = ids.filter(|ids| !ids.is_empty()) else {
        return Ok(records.iter().collect());
    };
    let by_id: HashMap<&str, &DatasetRecord> = records
        .iter()
        .map(|r| (r.instance_id.as_str(), r))
        .collect();
    let missing: Vec<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| !by_id.contains_key(id))
        .collect();
    if !missing.is_empty() {
        bail!("instance ids not found in the dataset: {}", missing.join(", "));
    }
    Ok(ids.iter().map(|id| by_id[id.as_str()]).collect())
}

/// Replacement environment specs for a whole dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecOverride {
    /// One spec for every record.
    All(EnvironmentSpec),
    /// Specs keyed by record version (`"default"` when a record has none).
    ByVersion(BTreeMap<String, EnvironmentSpec>),
}

impl SpecOverride {
    /// Parse inline JSON, or read it from a file when `arg` names one.
    pub fn parse(arg: &str) -> Result<Self> {
        let text = if Path::new(arg).is_file() {
            fs::read_to_string(arg).with_context(|| format!("read spec override {arg}"))?
        } else {
            arg.to_string()
        };
        let value: Value = serde_json::from_str(&text).context("parse spec override json")?;
        let bare = value
            .as_object()
            .is_some_and(|o| o.contains_key("python") || o.contains_key("test_cmd"));
        if bare {
            Ok(SpecOverride::All(
                serde_json::from_value(value).context("parse spec override")?,
            ))
        } else {
            Ok(SpecOverride::ByVersion(
                serde_json::from_value(value).context("parse versioned spec override")?,
            ))
        }
    }

    pub fn apply(&self, records: &mut [DatasetRecord]) {
        for record in records {
            record.spec_dict = match self {
                SpecOverride::All(spec) => Some(spec.clone()),
                SpecOverride::ByVersion(map) => map.get(&record.version_key()).cloned(),
            };
        }
    }
}

/// Pretty JSON with a trailing newline, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// One compact JSON document per line.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    ensure_parent(path)?;
    let mut buf = String::new();
    for row in rows {
        buf.push_str(&serde_json::to_string(row).context("serialize json line")?);
        buf.push('\n');
    }
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"{"instance_id": "i1", "repo": "o/r", "base_commit": "abc", "patch": "P", "test_patch": "T", "FAIL_TO_PASS": ["t2"], "PASS_TO_PASS": ["t1"], "spec_dict": {"python": "3.11", "test_cmd": "pytest"}, "problem_statement": "fix it"}"#;

    #[test]
    fn loads_jsonl_and_keeps_unknown_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.jsonl");
        fs::write(&path, format!("{RECORD}\n\n")).expect("write");
        let records = load_records(&path).expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_tests(), vec!["t1", "t2"]);
        assert_eq!(records[0].extra["problem_statement"], "fix it");
    }

    #[test]
    fn loads_json_arrays() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.json");
        fs::write(&path, format!("[{RECORD}]")).expect("write");
        assert_eq!(load_records(&path).expect("load").len(), 1);
    }

    #[test]
    fn rejects_unknown_extensions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.csv");
        fs::write(&path, "").expect("write");
        assert!(load_records(&path).is_err());
    }

    #[test]
    fn select_reports_missing_ids() {
        let record: DatasetRecord = serde_json::from_str(RECORD).expect("record");
        let records = vec![record];
        let err = select_records(&records, Some(&["i1".to_string(), "nope".to_string()]))
            .expect_err("missing");
        assert!(err.to_string().contains("nope"));
        assert_eq!(select_records(&records, None).expect("all").len(), 1);
    }

    #[test]
    fn versioned_override_uses_record_version() {
        let mut record: DatasetRecord = serde_json::from_str(RECORD).expect("record");
        record.version = Some(Value::String("1.2".to_string()));
        let mut records = vec![record.clone(), DatasetRecord { version: None, ..record }];
        let ovr = SpecOverride::parse(
            r#"{"1.2": {"python": "3.9", "test_cmd": "pytest"}, "default": {"python": "3.8", "test_cmd": "pytest"}}"#,
        )
        .expect("parse");
        ovr.apply(&mut records);
        assert_eq!(records[0].spec_dict.as_ref().map(|s| s.python.as_str()), Some("3.9"));
        assert_eq!(records[1].spec_dict.as_ref().map(|s| s.python.as_str()), Some("3.8"));
    }

    #[test]
    fn bare_override_applies_to_all() {
        let record: DatasetRecord = serde_json::from_str(RECORD).expect("record");
        let mut records = vec![record];
        SpecOverride::parse(r#"{"python": "3.12", "test_cmd": "pytest -q"}"#)
            .expect("parse")
            .apply(&mut records);
        assert_eq!(
            records[0].spec_dict.as_ref().map(|s| s.test_cmd.as_str()),
            Some("pytest -q")
        );
    }

    #[test]
    fn record_without_spec_cannot_become_instance() {
        let mut record: DatasetRecord = serde_json::from_str(RECORD).expect("record");
        record.spec_dict = None;
        assert!(record.to_instance(vec![], vec![]).is_err());
    }
}
