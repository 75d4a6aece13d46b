//! Environment specification for a task instance.

use serde::{Deserialize, Serialize};

/// Fields that only affect execution inside a container, never the image.
pub const IDENTITY_EXCLUDED_FIELDS: [&str; 3] = ["install", "test_cmd", "eval_commands"];

/// Immutable description of a runnable environment.
///
/// Unknown fields are rejected when a dataset record is parsed, so a typo in a
/// spec fails at load time instead of silently producing a different image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSpec {
    /// Runtime version, e.g. `3.11` (a leading `python` is tolerated).
    pub python: String,

    /// Free-form package string passed to a single install command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<String>,

    /// Individually quoted package requirements.
    #[serde(default)]
    pub pip_packages: Vec<String>,

    /// Shell steps run before package installation, in order.
    #[serde(default)]
    pub pre_install: Vec<String>,

    /// Install command run inside the container before the tests.
    #[serde(default)]
    pub install: String,

    /// Test command; target node ids are appended to it.
    pub test_cmd: String,

    /// Auxiliary shell steps run after install and before the tests.
    #[serde(default)]
    pub eval_commands: Vec<String>,
}

impl EnvironmentSpec {
    /// Runtime version with any `python` prefix removed (`python3.9` -> `3.9`).
    pub fn runtime_version(&self) -> &str {
        let trimmed = self.python.trim();
        trimmed.strip_prefix("python").unwrap_or(trimmed).trim()
    }
}
