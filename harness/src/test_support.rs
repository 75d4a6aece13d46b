//! Test-only helpers: a scripted container runtime, a static source provider,
//! and structured-report builders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::script::PATCH_FAILURE_EXIT_CODE;
use crate::core::spec::EnvironmentSpec;
use crate::core::types::Instance;
use crate::error::RuntimeError;
use crate::image::ImageOrchestrator;
use crate::io::config::BuildConfig;
use crate::io::log_sink::LogPaths;
use crate::io::repo::SourceProvider;
use crate::io::runtime::{
    BuildEvent, BuildStream, ContainerRuntime, ContainerSpec, RegistryAuth, same_image,
};

/// Scripted behaviour of one evaluation container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerScript {
    /// Exit with `code`, writing `report` to the bound report file and
    /// `stderr` to `results/test_err.txt`.
    Exit {
        code: i64,
        report: Option<String>,
        stderr: Option<String>,
    },
    /// Exit as if a patch failed to apply, writing `log` to `results/patch_apply.log`.
    PatchFailure { log: String },
    /// Never exit on its own.
    Hang,
}

impl ContainerScript {
    pub fn report(report: impl Into<String>) -> Self {
        ContainerScript::Exit {
            code: 0,
            report: Some(report.into()),
            stderr: None,
        }
    }

    pub fn stderr_only(stderr: impl Into<String>) -> Self {
        ContainerScript::Exit {
            code: 1,
            report: None,
            stderr: Some(stderr.into()),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    images: BTreeSet<String>,
    remote_images: BTreeSet<String>,
    build_scripts: HashMap<String, Vec<BuildEvent>>,
    builds: Vec<String>,
    contexts: HashMap<String, Vec<u8>>,
    pulls: Vec<String>,
    pushes: Vec<String>,
    removed_images: Vec<String>,
    containers: BTreeMap<String, ContainerSpec>,
    created: Vec<ContainerSpec>,
    killed: Vec<String>,
    removed_containers: Vec<String>,
    exit_codes: HashMap<String, i64>,
    next_id: u64,
}

/// In-memory [`ContainerRuntime`] with scripted builds and containers.
///
/// Containers are matched to scripts by their `INSTANCE_ID` environment
/// variable; unscripted containers exit 0 with an empty test list.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    scripts: Mutex<HashMap<String, ContainerScript>>,
    round_scripts: Mutex<HashMap<(String, usize), ContainerScript>>,
    build_delay: Duration,
    run_delay: Duration,
    push_fails: bool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before a build stream yields anything.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Delay before a scripted container exits.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn with_push_failure(mut self) -> Self {
        self.push_fails = true;
        self
    }

    pub fn script_build(&self, image: &str, events: Vec<BuildEvent>) {
        guard(&self.state)
            .build_scripts
            .insert(image.to_string(), events);
    }

    pub fn script_container(&self, instance_id: &str, script: ContainerScript) {
        guard(&self.scripts).insert(instance_id.to_string(), script);
    }

    /// Script used only when the container mounts exactly `patches` patch files.
    pub fn script_container_for_patches(
        &self,
        instance_id: &str,
        patches: usize,
        script: ContainerScript,
    ) {
        guard(&self.round_scripts).insert((instance_id.to_string(), patches), script);
    }

    pub fn add_local_image(&self, image: &str) {
        guard(&self.state).images.insert(image.to_string());
    }

    pub fn add_remote_image(&self, image: &str) {
        guard(&self.state).remote_images.insert(image.to_string());
    }

    pub fn build_count(&self) -> usize {
        guard(&self.state).builds.len()
    }

    pub fn builds(&self) -> Vec<String> {
        guard(&self.state).builds.clone()
    }

    /// Tar bytes submitted for the most recent build of `image`.
    pub fn build_context(&self, image: &str) -> Option<Vec<u8>> {
        guard(&self.state).contexts.get(image).cloned()
    }

    pub fn pulls(&self) -> Vec<String> {
        guard(&self.state).pulls.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        guard(&self.state).pushes.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        guard(&self.state).removed_images.clone()
    }

    /// Every container created so far, in creation order.
    pub fn created_containers(&self) -> Vec<ContainerSpec> {
        guard(&self.state).created.clone()
    }

    /// Names of containers that were killed.
    pub fn killed_containers(&self) -> Vec<String> {
        guard(&self.state).killed.clone()
    }

    /// Names of containers that were removed.
    pub fn removed_containers(&self) -> Vec<String> {
        guard(&self.state).removed_containers.clone()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> usize {
        guard(&self.state).containers.len()
    }

    fn container(&self, id: &str) -> Result<ContainerSpec, RuntimeError> {
        guard(&self.state)
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))
    }

    fn script_for(&self, spec: &ContainerSpec) -> ContainerScript {
        let instance_id = spec
            .env
            .iter()
            .find_map(|e| e.strip_prefix("INSTANCE_ID="))
            .unwrap_or_default();
        let patches = spec
            .mounts
            .iter()
            .filter(|m| m.container.starts_with("/patches/"))
            .count();
        if let Some(script) = guard(&self.round_scripts).get(&(instance_id.to_string(), patches)) {
            return script.clone();
        }
        guard(&self.scripts)
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| ContainerScript::report(report(&[])))
    }
}

fn host_path(spec: &ContainerSpec, container_path: &str) -> Option<PathBuf> {
    spec.mounts
        .iter()
        .find(|m| m.container == container_path)
        .map(|m| m.host.clone())
}

fn write_results_file(spec: &ContainerSpec, name: &str, contents: &str) {
    if let Some(results) = host_path(spec, "/results") {
        let _ = fs::write(results.join(name), contents);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn find_image(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        Ok(guard(&self.state)
            .images
            .iter()
            .find(|tag| same_image(tag, name))
            .cloned())
    }

    fn build_image(&self, image: &str, context: Vec<u8>) -> BuildStream {
        let events = {
            let mut state = guard(&self.state);
            state.builds.push(image.to_string());
            state.contexts.insert(image.to_string(), context);
            state
                .build_scripts
                .get(image)
                .cloned()
                .unwrap_or_else(|| vec![BuildEvent::Output("Successfully built".to_string())])
        };
        let state = Arc::clone(&self.state);
        let image = image.to_string();
        let delay = self.build_delay;
        stream::once(async move {
            tokio::time::sleep(delay).await;
            if !events.iter().any(|e| matches!(e, BuildEvent::Error(_))) {
                guard(&state).images.insert(image);
            }
            stream::iter(events.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }

    async fn pull_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let mut state = guard(&self.state);
        state.pulls.push(image.to_string());
        if !state.remote_images.contains(image) {
            return Err(RuntimeError::NotFound(format!("pull image: {image}")));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        let mut state = guard(&self.state);
        if !state.images.contains(source) {
            return Err(RuntimeError::NotFound(format!("tag image: {source}")));
        }
        let target = if tag == "latest" {
            repo.to_string()
        } else {
            format!("{repo}:{tag}")
        };
        state.images.insert(target);
        Ok(())
    }

    async fn push_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        if self.push_fails {
            return Err(RuntimeError::Api(format!("push image: {image} denied")));
        }
        guard(&self.state).pushes.push(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = guard(&self.state);
        state.images.remove(image);
        state.removed_images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = guard(&self.state);
        if !state.images.iter().any(|tag| same_image(tag, &spec.image)) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(id.clone(), spec.clone());
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let spec = self.container(id)?;
        let code = match self.script_for(&spec) {
            ContainerScript::Exit {
                code,
                report,
                stderr,
            } => {
                if let (Some(report), Some(path)) = (report, host_path(&spec, "/pass_report.json"))
                {
                    let _ = fs::write(path, report);
                }
                if let Some(stderr) = stderr {
                    write_results_file(&spec, "test_err.txt", &stderr);
                }
                code
            }
            ContainerScript::PatchFailure { log } => {
                write_results_file(&spec, "patch_apply.log", &log);
                PATCH_FAILURE_EXIT_CODE
            }
            ContainerScript::Hang => return Ok(()),
        };
        guard(&self.state).exit_codes.insert(id.to_string(), code);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let code = guard(&self.state).exit_codes.get(id).copied();
        match code {
            Some(code) => {
                tokio::time::sleep(self.run_delay).await;
                Ok(code)
            }
            None => std::future::pending().await,
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let spec = self.container(id)?;
        let mut state = guard(&self.state);
        state.killed.push(spec.name);
        state.exit_codes.insert(id.to_string(), 137);
        Ok(())
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        let spec = self.container(id)?;
        Ok(format!("logs of {}\n", spec.name))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = guard(&self.state);
        let spec = state
            .containers
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
        state.removed_containers.push(spec.name);
        Ok(())
    }
}

/// Serves one local directory for every repository.
#[derive(Debug)]
pub struct StaticSourceProvider {
    path: PathBuf,
    acquisitions: AtomicUsize,
    failing: BTreeSet<String>,
}

impl StaticSourceProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquisitions: AtomicUsize::new(0),
            failing: BTreeSet::new(),
        }
    }

    /// Make acquisitions of `repo` fail.
    pub fn failing_for(mut self, repo: &str) -> Self {
        self.failing.insert(repo.to_string());
        self
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn acquire(&self, repo: &str, _refresh: bool) -> Result<PathBuf> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(repo) {
            bail!("repository {repo} not found");
        }
        Ok(self.path.clone())
    }
}

/// Temporary log root plus a small source tree.
#[derive(Debug)]
pub struct TestWorkspace {
    dir: TempDir,
    paths: LogPaths,
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("tests")).expect("create source tree");
        fs::write(source.join("tests").join("test_mod.py"), "def test_ok():\n    pass\n")
            .expect("write source file");
        let paths = LogPaths::new(dir.path().join("logs"));
        Self { dir, paths }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    pub fn orchestrator(&self, runtime: Arc<FakeRuntime>) -> ImageOrchestrator {
        self.orchestrator_with(runtime, BuildConfig::default())
    }

    pub fn orchestrator_with(&self, runtime: Arc<FakeRuntime>, build: BuildConfig) -> ImageOrchestrator {
        ImageOrchestrator::new(
            runtime,
            Arc::new(StaticSourceProvider::new(self.source_dir())),
            build,
            self.paths.clone(),
        )
    }
}

/// Minimal spec with the given test command.
pub fn python_spec(test_cmd: &str) -> EnvironmentSpec {
    EnvironmentSpec {
        python: "3.11".to_string(),
        packages: None,
        pip_packages: vec!["pytest".to_string()],
        pre_install: Vec::new(),
        install: "pip install -e .".to_string(),
        test_cmd: test_cmd.to_string(),
        eval_commands: Vec::new(),
    }
}

/// Instance of `owner/proj` with one test patch and the given targets.
pub fn instance(instance_id: &str, tests: &[&str]) -> Instance {
    Instance {
        repo: "owner/proj".to_string(),
        instance_id: instance_id.to_string(),
        base_commit: "abc123".to_string(),
        patches: vec!["--- a/x\n+++ b/x\n".to_string()],
        tests: tests.iter().map(|t| (*t).to_string()).collect(),
        spec: python_spec("pytest -rA"),
        timeout: None,
    }
}

/// Structured report JSON for `(nodeid, outcome)` pairs.
pub fn report(entries: &[(&str, &str)]) -> String {
    report_value(entries, &[]).to_string()
}

/// Report JSON with failed collectors `(nodeid, longrepr)`.
pub fn report_with_collectors(entries: &[(&str, &str)], collectors: &[(&str, &str)]) -> String {
    report_value(entries, collectors).to_string()
}

fn report_value(entries: &[(&str, &str)], collectors: &[(&str, &str)]) -> Value {
    let tests: Vec<Value> = entries
        .iter()
        .map(|(nodeid, outcome)| {
            let mut test = json!({ "nodeid": nodeid, "outcome": outcome });
            if matches!(*outcome, "failed" | "error") {
                test["call"] = json!({
                    "outcome": outcome,
                    "crash": { "path": "/workspace/tests/test_mod.py", "lineno": 3, "message": "AssertionError" },
                    "longrepr": format!("{nodeid} failed"),
                });
            }
            test
        })
        .collect();
    let collectors: Vec<Value> = collectors
        .iter()
        .map(|(nodeid, longrepr)| json!({ "nodeid": nodeid, "outcome": "failed", "longrepr": longrepr }))
        .collect();
    json!({
        "root": "/workspace",
        "tests": tests,
        "collectors": collectors,
    })
}
