//! Source repository acquisition with an on-disk clone cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::io::config::GitConfig;
use crate::io::process::run_command_with_timeout;

const GIT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Provides a local checkout of a repository.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Local path of `repo` (`owner/name`). With `refresh`, any cached copy is
    /// discarded and fetched again.
    async fn acquire(&self, repo: &str, refresh: bool) -> Result<PathBuf>;
}

/// Clones from a git host into `<cache_dir>/<owner>__<name>`.
#[derive(Debug)]
pub struct GitSourceProvider {
    cfg: GitConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitSourceProvider {
    pub fn new(cfg: GitConfig) -> Self {
        Self {
            cfg,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cache directory for `repo`.
    pub fn cache_path(&self, repo: &str) -> PathBuf {
        self.cfg.cache_dir.join(repo.replace('/', "__"))
    }

    fn lock_for(&self, repo: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(repo.to_string()).or_default().clone()
    }
}

#[async_trait]
impl SourceProvider for GitSourceProvider {
    #[instrument(skip(self))]
    async fn acquire(&self, repo: &str, refresh: bool) -> Result<PathBuf> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        let path = absolute(&self.cache_path(repo))?;
        let url = format!("{}/{repo}", self.cfg.base_url.trim_end_matches('/'));
        let timeout = Duration::from_secs(self.cfg.clone_timeout_secs);
        let target = path.clone();
        tokio::task::spawn_blocking(move || ensure_clone(&url, &target, refresh, timeout))
            .await
            .context("join clone task")??;
        Ok(path)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("resolve current directory")?
        .join(path))
}

fn is_valid_checkout(path: &Path) -> bool {
    let non_empty = fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if !non_empty {
        return false;
    }
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(path).args(["rev-parse", "--git-dir"]);
    run_command_with_timeout(cmd, Duration::from_secs(30), GIT_OUTPUT_LIMIT_BYTES)
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Reuse a valid cached clone unless `refresh`; otherwise clone afresh.
fn ensure_clone(url: &str, path: &Path, refresh: bool, timeout: Duration) -> Result<()> {
    if path.exists() {
        if !refresh && path.is_dir() && is_valid_checkout(path) {
            debug!(path = %path.display(), "using cached clone");
            return Ok(());
        }
        warn!(path = %path.display(), refresh, "removing cached clone");
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    info!(url, path = %path.display(), "cloning repository");
    let mut cmd = Command::new("git");
    cmd.args(["clone", "--recursive", url]).arg(path);
    let outcome = run_command_with_timeout(cmd, timeout, GIT_OUTPUT_LIMIT_BYTES);
    let failure = match outcome {
        Ok(out) if out.success() => return Ok(()),
        Ok(out) if out.timed_out => anyhow!("git clone {url} timed out after {}s", timeout.as_secs()),
        Ok(out) => anyhow!("git clone {url} failed: {}", out.stderr_text()),
        Err(e) => e.context(format!("git clone {url}")),
    };
    if path.exists()
        && let Err(e) = fs::remove_dir_all(path)
    {
        warn!(err = %e, path = %path.display(), "failed to remove partial clone");
    }
    Err(failure)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn git(args: &[&str], dir: &Path) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn origin(root: &Path) -> PathBuf {
        let origin = root.join("origin").join("owner").join("proj");
        fs::create_dir_all(&origin).expect("mkdir");
        git(&["init", "-q"], &origin);
        fs::write(origin.join("README"), "hi\n").expect("write");
        git(&["add", "README"], &origin);
        git(
            &[
                "-c",
                "user.name=t",
                "-c",
                "user.email=t@t",
                "commit",
                "-q",
                "-m",
                "init",
            ],
            &origin,
        );
        root.join("origin")
    }

    fn provider(root: &Path, base: &Path) -> GitSourceProvider {
        GitSourceProvider::new(GitConfig {
            cache_dir: root.join("cache"),
            clone_timeout_secs: 60,
            base_url: base.display().to_string(),
        })
    }

    #[test]
    fn cache_path_flattens_owner() {
        let p = GitSourceProvider::new(GitConfig::default());
        assert!(p.cache_path("owner/proj").ends_with("git_repo_caches/owner__proj"));
    }

    #[tokio::test]
    async fn clones_then_reuses_cache() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = origin(temp.path());
        let provider = provider(temp.path(), &base);

        let path = provider.acquire("owner/proj", false).await.expect("clone");
        assert!(path.join("README").exists());

        fs::write(path.join("marker"), "").expect("marker");
        let again = provider.acquire("owner/proj", false).await.expect("reuse");
        assert_eq!(again, path);
        assert!(again.join("marker").exists());

        let refreshed = provider.acquire("owner/proj", true).await.expect("refresh");
        assert!(!refreshed.join("marker").exists());
    }

    #[tokio::test]
    async fn invalid_cache_is_recloned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = origin(temp.path());
        let provider = provider(temp.path(), &base);
        let cached = provider.cache_path("owner/proj");
        fs::create_dir_all(&cached).expect("mkdir");
        fs::write(cached.join("junk"), "").expect("junk");

        let path = provider.acquire("owner/proj", false).await.expect("clone");
        assert!(path.join("README").exists());
        assert!(!path.join("junk").exists());
    }

    #[tokio::test]
    async fn failed_clone_leaves_no_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = provider(temp.path(), &temp.path().join("nowhere"));
        let err = provider.acquire("owner/missing", false).await;
        assert!(err.is_err());
        assert!(!provider.cache_path("owner/missing").exists());
    }
}
