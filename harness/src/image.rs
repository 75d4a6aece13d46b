//! Image build orchestration.
//!
//! [`ImageOrchestrator::ensure_image`] turns a `(repo, spec)` pair into a
//! ready-to-run local image. Requests for the same image serialize on a
//! per-image lock, so concurrent callers cost one build; requests for
//! different images proceed in parallel. A failed build is remembered for the
//! lifetime of the orchestrator and never retried.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tracing::{debug, instrument};

use crate::core::identity::image_identity;
use crate::core::script::{ProxySettings, render_dockerfile};
use crate::core::spec::EnvironmentSpec;
use crate::error::{HarnessError, HarnessResult};
use crate::io::config::BuildConfig;
use crate::io::context::{BuildContext, bundle};
use crate::io::log_sink::{LogPaths, LogSink};
use crate::io::registry::Registry;
use crate::io::repo::SourceProvider;
use crate::io::runtime::{BuildEvent, ContainerRuntime};

/// Lifecycle of one image identity within an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Absent,
    Building,
    Ready,
    /// Sticky: the identity is not built again.
    Failed,
}

/// Per-image locks and build states. Both maps only grow.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<BTreeMap<String, BuildState>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BuildRegistry {
    fn lock_for(&self, image: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_ignoring_poison(&self.locks)
            .entry(image.to_string())
            .or_default()
            .clone()
    }

    pub fn state(&self, image: &str) -> BuildState {
        lock_ignoring_poison(&self.states)
            .get(image)
            .copied()
            .unwrap_or(BuildState::Absent)
    }

    fn set(&self, image: &str, state: BuildState) {
        lock_ignoring_poison(&self.states).insert(image.to_string(), state);
    }

    /// Images currently in `state`, sorted by name.
    pub fn images_in(&self, state: BuildState) -> Vec<String> {
        lock_ignoring_poison(&self.states)
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Builds, fetches, and caches evaluation images.
pub struct ImageOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    sources: Arc<dyn SourceProvider>,
    registry: Option<Registry>,
    build: BuildConfig,
    paths: LogPaths,
    state: BuildRegistry,
}

impl ImageOrchestrator {
    /// Build logs are written under `paths.build_dir()`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sources: Arc<dyn SourceProvider>,
        build: BuildConfig,
        paths: LogPaths,
    ) -> Self {
        Self {
            runtime,
            sources,
            registry: None,
            build,
            paths,
            state: BuildRegistry::default(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn build_state(&self, image: &str) -> BuildState {
        self.state.state(image)
    }

    /// Return the local image name for `repo` and `spec`, building it if needed.
    #[instrument(skip_all, fields(repo = %repo, force_rebuild))]
    pub async fn ensure_image(
        &self,
        repo: &str,
        spec: &EnvironmentSpec,
        force_rebuild: bool,
    ) -> HarnessResult<String> {
        let image = image_identity(repo, spec).image_name;
        let lock = self.state.lock_for(&image);
        let _guard = lock.lock().await;

        let log = LogSink::open(&self.paths.build_or_fetch_log(), "build-or-fetch")?;

        if self.state.state(&image) == BuildState::Failed {
            let message = format!("Failed to build image {image} before. Skipping the build.");
            log.error(&message);
            return Err(HarnessError::Build { image, message });
        }

        if !force_rebuild {
            if let Some(tag) = self.runtime.find_image(&image).await? {
                log.info(format!("Image {image} found locally as {tag}"));
                self.state.set(&image, BuildState::Ready);
                return Ok(image);
            }
            if let Some(registry) = self.registry.as_ref().filter(|r| r.pull_enabled()) {
                match registry.pull(self.runtime.as_ref(), &image, &log).await {
                    Ok(()) => {
                        self.state.set(&image, BuildState::Ready);
                        return Ok(image);
                    }
                    Err(e) => log.warn(format!("{e}. Falling back to a local build.")),
                }
            }
        }

        log.info(format!("Building image {image}"));
        self.state.set(&image, BuildState::Building);
        if let Err(e) = self.build_image(repo, spec, &image, force_rebuild).await {
            if !matches!(e, HarnessError::Cancelled) {
                self.state.set(&image, BuildState::Failed);
            }
            log.error(format!("Build of {image} failed: {e}"));
            return Err(e);
        }
        self.state.set(&image, BuildState::Ready);
        log.info(format!("Built image {image}"));

        if let Some(registry) = self.registry.as_ref().filter(|r| r.push_enabled())
            && let Err(e) = registry.push(self.runtime.as_ref(), &image, &log).await
        {
            log.error(format!("{e}. Keeping the local image."));
        }
        Ok(image)
    }

    fn proxy_settings(&self) -> (Option<ProxySettings>, Vec<PathBuf>) {
        let Some(proxy) = &self.build.proxy else {
            return (None, Vec::new());
        };
        let names = proxy
            .certificates
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        let settings = ProxySettings {
            http_proxy: proxy.http_proxy.clone(),
            https_proxy: proxy.https_proxy.clone(),
            certificates: names,
        };
        (Some(settings), proxy.certificates.clone())
    }

    async fn build_image(
        &self,
        repo: &str,
        spec: &EnvironmentSpec,
        image: &str,
        refresh: bool,
    ) -> HarnessResult<()> {
        let build_err = |message: String| HarnessError::Build {
            image: image.to_string(),
            message,
        };
        let image_dir = self.paths.image_dir(image);
        let build_log = LogSink::open(&image_dir.join("build.log"), image)?;

        let source = self
            .sources
            .acquire(repo, refresh)
            .await
            .map_err(|e| build_err(format!("Failed to acquire {repo}: {e:#}")))?;

        let repo_dir = repo.replace('/', "__");
        let (proxy, aux_files) = self.proxy_settings();
        let dockerfile = render_dockerfile(spec, &repo_dir, proxy.as_ref())
            .map_err(|e| build_err(format!("Failed to render Dockerfile: {e:#}")))?;
        tokio::fs::write(image_dir.join("Dockerfile"), &dockerfile).await?;

        let context = tokio::task::spawn_blocking(move || {
            bundle(&BuildContext {
                dockerfile: &dockerfile,
                source: &source,
                repo_dir: &repo_dir,
                aux_files: &aux_files,
            })
        })
        .await
        .map_err(|e| build_err(format!("build context task failed: {e}")))?
        .map_err(|e| build_err(format!("Failed to bundle build context: {e:#}")))?;
        debug!(image, bytes = context.len(), "submitting build");

        let budget = self.build.timeout();
        let mut stream = self.runtime.build_image(image, context);
        let streamed = tokio::time::timeout(budget, async {
            while let Some(event) = stream.next().await {
                match event? {
                    BuildEvent::Output(line) => {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            build_log.info(line);
                        }
                    }
                    BuildEvent::Error(message) => {
                        build_log.error(&message);
                        return Err(build_err(format!(
                            "Failed to build image {image}: {message}"
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

        match streamed {
            Ok(result) => result,
            Err(_) => {
                build_log.error(format!("Build exceeded {}s", budget.as_secs()));
                Err(HarnessError::build_timeout(budget))
            }
        }
    }

    /// Delete every image this orchestrator built or resolved. Failed
    /// identities are skipped. Returns the names that were removed.
    #[instrument(skip_all)]
    pub async fn remove_images(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for image in self.state.images_in(BuildState::Ready) {
            match self.runtime.remove_image(&image).await {
                Ok(()) => {
                    self.state.set(&image, BuildState::Absent);
                    removed.push(image);
                }
                Err(e) => debug!(image, err = %e, "failed to remove image"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::io::config::RegistryConfig;
    use crate::test_support::{FakeRuntime, TestWorkspace, python_spec};

    const REPO: &str = "owner/proj";

    fn registry(pull: bool, push: bool) -> Registry {
        Registry::new(RegistryConfig {
            push,
            pull,
            url: None,
            user: Some("bot".to_string()),
            password: None,
        })
    }

    #[tokio::test]
    async fn builds_once_then_hits_local_cache() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new());
        let images = ws.orchestrator(runtime.clone());

        let spec = python_spec("pytest");
        let first = images.ensure_image(REPO, &spec, false).await.expect("build");
        let second = images.ensure_image(REPO, &spec, false).await.expect("cached");

        assert_eq!(first, second);
        assert_eq!(runtime.build_count(), 1);
        assert_eq!(images.build_state(&first), BuildState::Ready);
        let dockerfile = ws.paths().image_dir(&first).join("Dockerfile");
        assert!(dockerfile.exists());
    }

    #[tokio::test]
    async fn force_rebuild_skips_the_cache() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new());
        let images = ws.orchestrator(runtime.clone());
        let spec = python_spec("pytest");

        images.ensure_image(REPO, &spec, false).await.expect("build");
        images.ensure_image(REPO, &spec, true).await.expect("rebuild");
        assert_eq!(runtime.build_count(), 2);
    }

    #[tokio::test]
    async fn failed_builds_are_sticky() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new());
        let spec = python_spec("pytest");
        let image = image_identity(REPO, &spec).image_name;
        runtime.script_build(
            &image,
            vec![
                BuildEvent::Output("Step 1/9".to_string()),
                BuildEvent::Error("pip failed".to_string()),
            ],
        );
        let images = ws.orchestrator(runtime.clone());

        let err = images.ensure_image(REPO, &spec, false).await.expect_err("fails");
        assert!(err.to_string().contains("pip failed"));
        let err = images.ensure_image(REPO, &spec, false).await.expect_err("sticky");
        assert!(err.to_string().contains("before. Skipping the build."));
        assert_eq!(runtime.build_count(), 1);
        assert_eq!(images.build_state(&image), BuildState::Failed);
    }

    #[tokio::test]
    async fn build_timeout_is_reported() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new().with_build_delay(Duration::from_secs(5)));
        let build = BuildConfig {
            timeout_secs: 1,
            ..BuildConfig::default()
        };
        let images = ws.orchestrator_with(runtime, build);

        let err = images
            .ensure_image(REPO, &python_spec("pytest"), false)
            .await
            .expect_err("timeout");
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Build timeout after 1 seconds.");
    }

    #[tokio::test]
    async fn pull_success_skips_build() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new());
        let spec = python_spec("pytest");
        let image = image_identity(REPO, &spec).image_name;
        runtime.add_remote_image(&format!("bot/{image}"));
        let images = ws.orchestrator(runtime.clone()).with_registry(registry(true, false));

        images.ensure_image(REPO, &spec, false).await.expect("pulled");
        assert_eq!(runtime.build_count(), 0);
        assert_eq!(runtime.pulls(), vec![format!("bot/{image}")]);
    }

    #[tokio::test]
    async fn pull_failure_falls_back_to_build_and_push_failure_is_tolerated() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new().with_push_failure());
        let images = ws.orchestrator(runtime.clone()).with_registry(registry(true, true));

        let image = images
            .ensure_image(REPO, &python_spec("pytest"), false)
            .await
            .expect("built despite registry failures");
        assert_eq!(runtime.build_count(), 1);
        assert!(runtime.removed_images().contains(&format!("bot/{image}")));
    }

    #[tokio::test]
    async fn remove_images_deletes_ready_images() {
        let ws = TestWorkspace::new();
        let runtime = Arc::new(FakeRuntime::new());
        let images = ws.orchestrator(runtime.clone());
        let image = images
            .ensure_image(REPO, &python_spec("pytest"), false)
            .await
            .expect("build");

        assert_eq!(images.remove_images().await, vec![image.clone()]);
        assert!(runtime.removed_images().contains(&image));
        assert_eq!(images.build_state(&image), BuildState::Absent);
    }
}
