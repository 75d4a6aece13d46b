//! Single-instance execution inside an isolated container.
//!
//! The runner resolves the image, writes the patches and entrypoint script to
//! the instance's log directory, binds them into a fresh container, waits for
//! it under a wall-clock budget, and reads the structured report back from the
//! bound results directory. The container is always removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::report::{CollectOptions, collect_report};
use crate::core::script::{EvalScriptInputs, PATCH_FAILURE_EXIT_CODE, render_eval_script};
use crate::core::types::{Instance, RunOptions, RunOutput};
use crate::error::{HarnessError, HarnessResult};
use crate::image::ImageOrchestrator;
use crate::io::config::RunConfig;
use crate::io::log_sink::{LogPaths, LogSink};
use crate::io::runtime::{ContainerRuntime, ContainerSpec, Mount};

const REPORT_MOUNT: &str = "/pass_report.json";
const RESULTS_MOUNT: &str = "/results";
const SCRIPT_MOUNT: &str = "/eval.sh";
const REPORT_FILE: &str = "pytest_report.json";
const STDERR_FILE: &str = "test_err.txt";
const PATCH_LOG_FILE: &str = "patch_apply.log";

/// Host-side files bound into one container.
#[derive(Debug, Clone)]
struct Materialized {
    patches: Vec<PathBuf>,
    results_dir: PathBuf,
    report: PathBuf,
    script: PathBuf,
}

impl Materialized {
    fn mounts(&self) -> Vec<Mount> {
        let mut mounts: Vec<Mount> = self
            .patches
            .iter()
            .enumerate()
            .map(|(i, p)| Mount::read_only(p, format!("/patches/patch_{i}.patch")))
            .collect();
        mounts.push(Mount::read_write(&self.results_dir, RESULTS_MOUNT));
        mounts.push(Mount::read_write(&self.report, REPORT_MOUNT));
        mounts.push(Mount::read_write(&self.script, SCRIPT_MOUNT));
        mounts
    }
}

/// Removes the container if the run is abandoned before explicit cleanup.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn disarm(&mut self) -> Option<String> {
        self.id.take()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(id, "no runtime to remove abandoned container");
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        handle.spawn(async move {
            if let Err(e) = runtime.remove_container(&id).await {
                warn!(id, err = %e, "failed to remove abandoned container");
            }
        });
    }
}

/// Runs instances against images from a shared orchestrator.
pub struct InstanceRunner {
    images: Arc<ImageOrchestrator>,
    runtime: Arc<dyn ContainerRuntime>,
    run: RunConfig,
    paths: LogPaths,
    cancel: CancelToken,
}

impl InstanceRunner {
    /// Instance artifacts are written under `paths.instance_dir(id)`.
    pub fn new(images: Arc<ImageOrchestrator>, run: RunConfig, paths: LogPaths) -> Self {
        let runtime = images.runtime();
        Self {
            images,
            runtime,
            run,
            paths,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    /// Evaluate `instance` with a container budget of `timeout`.
    #[instrument(skip_all, fields(instance = %instance.instance_id))]
    pub async fn run(
        &self,
        instance: &Instance,
        timeout: Duration,
        opts: RunOptions,
    ) -> HarnessResult<RunOutput> {
        if self.cancel.is_cancelled() {
            return Err(HarnessError::Cancelled);
        }
        let image = tokio::select! {
            image = self.images.ensure_image(&instance.repo, &instance.spec, false) => image?,
            () = self.cancel.cancelled() => return Err(HarnessError::Cancelled),
        };

        let instance_dir = absolute(&self.paths.instance_dir(&instance.instance_id))?;
        let log = LogSink::open(&instance_dir.join("run_instance.log"), &instance.instance_id)?;
        log.info(format!("Running {} on image {image}", instance.instance_id));

        let files = self.materialize(instance, &instance_dir, timeout, opts).await?;
        let spec = ContainerSpec {
            name: container_name(&image),
            image,
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("chmod +x {SCRIPT_MOUNT} && {SCRIPT_MOUNT}"),
            ],
            env: vec![
                format!("GIT_COMMIT={}", instance.base_commit),
                format!("REPO={}", instance.repo),
                format!("INSTANCE_ID={}", instance.instance_id),
            ],
            mounts: files.mounts(),
            network_disabled: opts.network_isolation,
            tty: true,
            memory_bytes: self.run.memory_bytes,
            nano_cpus: self.run.nano_cpus,
        };

        let id = self.runtime.create_container(&spec).await?;
        log.info(format!("Created container {} ({id})", spec.name));
        let mut guard = ContainerGuard {
            runtime: Arc::clone(&self.runtime),
            id: Some(id.clone()),
        };
        let outcome = self.execute(&id, timeout, &log).await;
        if let Some(id) = guard.disarm() {
            match self.runtime.remove_container(&id).await {
                Ok(()) => log.debug(format!("Removed container {}", spec.name)),
                Err(e) => log.warn(format!("Failed to remove container {}: {e}", spec.name)),
            }
        }
        let code = outcome?;
        log.info(format!("Container exited with code {code}"));

        if code == PATCH_FAILURE_EXIT_CODE {
            let detail = read_or_empty(&files.results_dir.join(PATCH_LOG_FILE)).await;
            log.error(format!("Patch application failed:\n{detail}"));
            return Err(HarnessError::PatchApply { detail });
        }

        let report_text = read_or_empty(&files.report).await;
        let stderr = read_or_empty(&files.results_dir.join(STDERR_FILE)).await;
        let collected = collect_report(
            &report_text,
            &stderr,
            &instance.tests,
            CollectOptions {
                short: opts.short,
                skipped_ok: opts.skipped_ok,
                ignore_collector_errors: opts.ignore_collector_errors,
            },
        )
        .inspect_err(|e| log.error(e.to_string()))?;

        for (nodeid, longrepr) in &collected.tolerated_collectors {
            log.warn(format!("Ignoring collector error in {nodeid}:\n{longrepr}"));
        }
        if !collected.missing.is_empty() {
            log.warn(format!(
                "{} requested tests missing from the report: {}",
                collected.missing.len(),
                collected.missing.join(", ")
            ));
        }

        Ok(if opts.short {
            RunOutput::Short(collected.short)
        } else {
            RunOutput::Full(collected.report)
        })
    }

    async fn materialize(
        &self,
        instance: &Instance,
        instance_dir: &Path,
        timeout: Duration,
        opts: RunOptions,
    ) -> HarnessResult<Materialized> {
        let patch_dir = instance_dir.join("patches");
        let results_dir = instance_dir.join("results");
        for dir in [&patch_dir, &results_dir] {
            if dir.exists() {
                tokio::fs::remove_dir_all(dir).await?;
            }
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut patches = Vec::with_capacity(instance.patches.len());
        for (i, patch) in instance.patches.iter().enumerate() {
            let path = patch_dir.join(format!("patch_{i}.patch"));
            tokio::fs::write(&path, patch).await?;
            patches.push(path);
        }

        let report = results_dir.join(REPORT_FILE);
        tokio::fs::write(&report, "").await?;

        let script = render_eval_script(&EvalScriptInputs {
            tests: &instance.tests,
            test_cmd: &instance.spec.test_cmd,
            install: &instance.spec.install,
            eval_commands: &instance.spec.eval_commands,
            per_test_timeout_secs: self.run.per_test_timeout(timeout).as_secs(),
            failfast: opts.failfast,
        })?;
        let script_path = instance_dir.join("eval.sh");
        tokio::fs::write(&script_path, script).await?;

        Ok(Materialized {
            patches,
            results_dir,
            report,
            script: script_path,
        })
    }

    /// Start the container and wait for it. Kills it on timeout or cancel.
    async fn execute(&self, id: &str, timeout: Duration, log: &LogSink) -> HarnessResult<i64> {
        self.runtime.start_container(id).await?;
        tokio::select! {
            waited = tokio::time::timeout(timeout, self.runtime.wait_container(id)) => match waited {
                Ok(code) => {
                    let code = code?;
                    self.capture_logs(id, log).await;
                    Ok(code)
                }
                Err(_) => {
                    self.kill(id, log).await;
                    self.capture_logs(id, log).await;
                    let err = HarnessError::container_timeout(timeout);
                    log.error(err.to_string());
                    Err(err)
                }
            },
            () = self.cancel.cancelled() => {
                self.kill(id, log).await;
                log.warn("Interrupted; container killed");
                Err(HarnessError::Cancelled)
            }
        }
    }

    async fn kill(&self, id: &str, log: &LogSink) {
        if let Err(e) = self.runtime.kill_container(id).await {
            log.warn(format!("Failed to kill container {id}: {e}"));
        }
    }

    async fn capture_logs(&self, id: &str, log: &LogSink) {
        match self.runtime.container_logs(id).await {
            Ok(logs) => log.debug(format!("Container logs:\n{logs}")),
            Err(e) => debug!(id, err = %e, "failed to capture container logs"),
        }
    }
}

/// `<image with '/' and ':' replaced>-<random suffix>`.
fn container_name(image: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!(
        "{}-{}",
        image.replace(['/', ':'], "-"),
        suffix.to_lowercase()
    )
}

fn absolute(path: &Path) -> HarnessResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

async fn read_or_empty(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}
