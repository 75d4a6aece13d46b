//! Harness configuration stored in `harness.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Harness configuration (TOML).
///
/// Every section defaults independently, so a file may set only the keys it
/// cares about. Environment overrides are applied by [`load_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub docker: DockerConfig,
    pub registry: RegistryConfig,
    pub build: BuildConfig,
    pub run: RunConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Runtime endpoint; unset uses the local socket defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Endpoint-level request timeout, distinct from instance timeouts.
    pub request_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub push: bool,
    pub pull: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl RegistryConfig {
    /// The registry path is only used when a user is configured.
    pub fn enabled(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    pub fn pull_enabled(&self) -> bool {
        self.pull && self.enabled()
    }

    pub fn push_enabled(&self) -> bool {
        self.push && self.enabled()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            proxy: None,
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Proxy and CA certificates for builds behind a corporate network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    /// Certificate files copied into the build context and trusted in the image.
    pub certificates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Instance wall-clock budget.
    pub timeout_secs: u64,
    /// Cap on the per-test budget, which is `min(timeout / 2, cap)`.
    pub max_test_timeout_secs: u64,
    pub network_isolation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nano_cpus: Option<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_test_timeout_secs: 180,
            network_isolation: true,
            memory_bytes: None,
            nano_cpus: None,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Per-test budget for an instance timeout.
    pub fn per_test_timeout(&self, instance_timeout: Duration) -> Duration {
        (instance_timeout / 2).min(Duration::from_secs(self.max_test_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub cache_dir: PathBuf,
    pub clone_timeout_secs: u64,
    pub base_url: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("git_repo_caches"),
            clone_timeout_secs: 30 * 60,
            base_url: "https://github.com".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.docker.request_timeout_secs == 0 {
            return Err(anyhow!("docker.request_timeout_secs must be > 0"));
        }
        if self.build.timeout_secs == 0 {
            return Err(anyhow!("build.timeout_secs must be > 0"));
        }
        if self.run.timeout_secs == 0 {
            return Err(anyhow!("run.timeout_secs must be > 0"));
        }
        if self.run.max_test_timeout_secs == 0 {
            return Err(anyhow!("run.max_test_timeout_secs must be > 0"));
        }
        if self.git.clone_timeout_secs == 0 {
            return Err(anyhow!("git.clone_timeout_secs must be > 0"));
        }
        if self.git.base_url.trim().is_empty() {
            return Err(anyhow!("git.base_url must be non-empty"));
        }
        if (self.registry.push || self.registry.pull) && !self.registry.enabled() {
            return Err(anyhow!("registry.push/pull require registry.user"));
        }
        Ok(())
    }

    /// Apply `HARNESS_*` and `GIT_REPO_CACHE_DIR` overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HARNESS_PUSH_TO_REGISTRY") {
            self.registry.push = parse_flag(&v);
        }
        if let Some(v) = lookup("HARNESS_PULL_FROM_REGISTRY") {
            self.registry.pull = parse_flag(&v);
        }
        if let Some(v) = lookup("HARNESS_REGISTRY_URL") {
            self.registry.url = Some(v);
        }
        if let Some(v) = lookup("HARNESS_REGISTRY_USER") {
            self.registry.user = Some(v);
        }
        if let Some(v) = lookup("HARNESS_REGISTRY_PASS") {
            self.registry.password = Some(v);
        }
        if let Some(v) = lookup("GIT_REPO_CACHE_DIR") {
            self.git.cache_dir = PathBuf::from(v);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Load config from a TOML file and apply environment overrides.
///
/// If the file is missing, defaults are used.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    load_config_with(path, |_| {})
}

/// Like [`load_config`], with `overrides` applied after the environment and
/// before validation.
pub fn load_config_with<F>(path: &Path, overrides: F) -> Result<HarnessConfig>
where
    F: FnOnce(&mut HarnessConfig),
{
    let mut cfg = read_config_file(path)?;
    cfg.apply_env(|key| std::env::var(key).ok());
    overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(HarnessConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = read_config_file(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("harness.toml");
        let mut cfg = HarnessConfig::default();
        cfg.run.memory_bytes = Some(1 << 30);
        cfg.build.proxy = Some(ProxyConfig {
            http_proxy: "http://p:1".to_string(),
            https_proxy: "http://p:1".to_string(),
            certificates: vec![PathBuf::from("certs/corp.crt")],
        });
        write_config(&path, &cfg).expect("write");
        assert_eq!(read_config_file(&path).expect("read"), cfg);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: HarnessConfig = toml::from_str("[run]\ntimeout_secs = 60\n").expect("parse");
        assert_eq!(cfg.run.timeout_secs, 60);
        assert_eq!(cfg.run.max_test_timeout_secs, 180);
        assert_eq!(cfg.build.timeout_secs, 1800);
    }

    #[test]
    fn env_overrides_registry_and_cache_dir() {
        let vars = HashMap::from([
            ("HARNESS_PULL_FROM_REGISTRY", "true"),
            ("HARNESS_REGISTRY_USER", "bot"),
            ("GIT_REPO_CACHE_DIR", "/tmp/cache"),
        ]);
        let mut cfg = HarnessConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| (*v).to_string()));
        assert!(cfg.registry.pull_enabled());
        assert!(!cfg.registry.push_enabled());
        assert_eq!(cfg.git.cache_dir, PathBuf::from("/tmp/cache"));
        cfg.validate().expect("valid");
    }

    #[test]
    fn overrides_apply_before_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "[registry]\npush = true\n").expect("write");
        assert!(load_config(&path).is_err());
        let cfg = load_config_with(&path, |cfg| cfg.registry.user = Some("bot".to_string()))
            .expect("load");
        assert!(cfg.registry.push_enabled());
    }

    #[test]
    fn registry_flags_without_user_are_rejected() {
        let mut cfg = HarnessConfig::default();
        cfg.registry.push = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_test_timeout_is_capped() {
        let cfg = RunConfig::default();
        assert_eq!(
            cfg.per_test_timeout(Duration::from_secs(100)),
            Duration::from_secs(50)
        );
        assert_eq!(
            cfg.per_test_timeout(Duration::from_secs(3000)),
            Duration::from_secs(180)
        );
    }
}
