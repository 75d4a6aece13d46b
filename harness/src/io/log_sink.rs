//! Product log artifacts written under a run's log directory.
//!
//! Records are JSON Lines `{ts, level, target, message}` and are always
//! written, independent of `RUST_LOG`. Each record is mirrored to `tracing`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Layout of a run's log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    root: PathBuf,
}

impl LogPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build_logs")
    }

    /// Orchestrator decisions: cache hits, pulls, builds, pushes.
    pub fn build_or_fetch_log(&self) -> PathBuf {
        self.build_dir().join("build-or-fetch.log")
    }

    /// Per-image directory holding `Dockerfile` and `build.log`.
    pub fn image_dir(&self, image_name: &str) -> PathBuf {
        self.build_dir().join(image_name)
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join("evaluate_logs").join(instance_id)
    }

    pub fn evaluation_log(&self) -> PathBuf {
        self.root.join("evaluation.log")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    level: Level,
    target: &'a str,
    message: &'a str,
}

/// Append-only JSON Lines log file.
#[derive(Debug)]
pub struct LogSink {
    target: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl LogSink {
    /// Open (creating parents) `path` for appending.
    pub fn open(path: &Path, target: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log {}", path.display()))?;
        Ok(Self {
            target: target.into(),
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.record(Level::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.record(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.record(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.record(Level::Error, message.as_ref());
    }

    fn record(&self, level: Level, message: &str) {
        match level {
            Level::Debug => debug!(target_name = %self.target, "{message}"),
            Level::Info => info!(target_name = %self.target, "{message}"),
            Level::Warn => warn!(target_name = %self.target, "{message}"),
            Level::Error => error!(target_name = %self.target, "{message}"),
        }
        let record = Record {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            target: &self.target,
            message,
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(err = %e, path = %self.path.display(), "failed to write log record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_are_stable() {
        let paths = LogPaths::new("logs/run-1");
        assert!(paths.build_or_fetch_log().ends_with("build_logs/build-or-fetch.log"));
        assert!(paths.image_dir("eval-o-r-1234abcd").ends_with("build_logs/eval-o-r-1234abcd"));
        assert!(paths.instance_dir("i-1").ends_with("evaluate_logs/i-1"));
        assert!(paths.evaluation_log().ends_with("evaluation.log"));
    }

    #[test]
    fn writes_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a").join("run.log");
        let sink = LogSink::open(&path, "run-i1").expect("open");
        sink.info("started");
        sink.error("boom");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["target"], "run-i1");
        assert_eq!(lines[1]["message"], "boom");
        assert!(lines[1]["ts"].as_str().is_some_and(|ts| ts.ends_with('Z')));
    }

    #[test]
    fn reopening_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.log");
        LogSink::open(&path, "t").expect("open").info("one");
        LogSink::open(&path, "t").expect("open").info("two");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
    }
}
