//! Container runtime seam.
//!
//! [`ContainerRuntime`] is the narrow set of image and container operations
//! the orchestrator needs. [`DockerRuntime`] implements it over the Docker
//! Engine API via `bollard`; tests use the scripted runtime in
//! `test_support`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, ListImagesOptions, PushImageOptions,
    RemoveImageOptions, TagImageOptions,
};
use bollard::models::HostConfig;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, instrument};

use crate::error::RuntimeError;
use crate::io::config::DockerConfig;

/// A host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// `host:container:ro|rw` bind string.
    pub fn bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{mode}", self.host.display(), self.container)
    }
}

/// Everything needed to create one evaluation container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub network_disabled: bool,
    pub tty: bool,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// One entry of an image-build log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Output(String),
    /// The build reported an internal error; the build has failed.
    Error(String),
}

/// Registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: Option<String>,
    pub server: Option<String>,
}

pub type BuildStream = BoxStream<'static, Result<BuildEvent, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// First local tag containing `name`, if any.
    async fn find_image(&self, name: &str) -> Result<Option<String>, RuntimeError>;

    /// Submit a build; the stream yields log entries until the build ends.
    fn build_image(&self, image: &str, context: Vec<u8>) -> BuildStream;

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>)
    -> Result<(), RuntimeError>;

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), RuntimeError>;

    async fn push_image(&self, image: &str, auth: Option<&RegistryAuth>)
    -> Result<(), RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container stops; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Combined stdout/stderr captured so far.
    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

fn map_err(context: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::RequestTimeoutError => RuntimeError::EndpointTimeout(context.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{context}: {message}")),
        other => RuntimeError::Api(format!("{context}: {other}")),
    }
}

fn credentials(auth: Option<&RegistryAuth>) -> Option<DockerCredentials> {
    auth.map(|a| DockerCredentials {
        username: Some(a.username.clone()),
        password: a.password.clone(),
        serveraddress: a.server.clone(),
        ..Default::default()
    })
}

/// Split `repo[:tag]` (a registry host may itself contain a port colon).
fn split_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// True when `tag` is an image of repository `name`. A `name` carrying its
/// own tag must match that tag too.
pub fn same_image(tag: &str, name: &str) -> bool {
    let (repo, version) = split_tag(tag);
    match split_tag(name) {
        (wanted, _) if wanted == name => repo == wanted,
        (wanted, wanted_version) => repo == wanted && version == wanted_version,
    }
}

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the configured endpoint, or the local socket defaults.
    pub fn connect(cfg: &DockerConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.request_timeout_secs);
        let docker = match cfg.endpoint.as_deref() {
            Some(endpoint) if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") => {
                let addr = endpoint.replacen("tcp://", "http://", 1);
                Docker::connect_with_http(
                    &addr,
                    cfg.request_timeout_secs,
                    bollard::API_DEFAULT_VERSION,
                )
                .with_context(|| format!("connect docker endpoint {endpoint}"))?
            }
            Some(endpoint) => Docker::connect_with_socket(
                endpoint,
                cfg.request_timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )
            .with_context(|| format!("connect docker socket {endpoint}"))?,
            None => Docker::connect_with_local_defaults().context("connect local docker")?,
        };
        Ok(Self {
            docker: docker.with_timeout(timeout),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self))]
    async fn find_image(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_err("list images", e))?;
        Ok(images
            .into_iter()
            .flat_map(|summary| summary.repo_tags)
            .find(|tag| same_image(tag, name)))
    }

    fn build_image(&self, image: &str, context: Vec<u8>) -> BuildStream {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        // bollard's build stream borrows the client, so drive it from a task
        // that owns a clone and forward its items to the returned stream.
        let docker = self.docker.clone();
        futures_util::stream::once(async move {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::spawn(async move {
                let mut stream = docker.build_image(options, None, Some(context.into()));
                while let Some(item) = stream.next().await {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            });
            futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
        })
        .flatten()
        .map(|item| match item {
            Ok(info) => match (info.error, info.stream) {
                (Some(error), _) => Ok(BuildEvent::Error(error)),
                (None, Some(stream)) => Ok(BuildEvent::Output(stream)),
                (None, None) => Ok(BuildEvent::Output(info.status.unwrap_or_default())),
            },
            Err(e) => Err(map_err("build image", e)),
        })
        .boxed()
    }

    #[instrument(skip(self, auth))]
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let (repo, tag) = split_tag(image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: repo,
                tag,
                ..Default::default()
            }),
            None,
            credentials(auth),
        );
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_err("pull image", e))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Api(format!("pull image: {error}")));
            }
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        self.docker
            .tag_image(source, Some(TagImageOptions { repo, tag }))
            .await
            .map_err(|e| map_err("tag image", e))
    }

    #[instrument(skip(self, auth))]
    async fn push_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let (repo, tag) = split_tag(image);
        let mut stream =
            self.docker
                .push_image(repo, Some(PushImageOptions { tag }), credentials(auth));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_err("push image", e))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Api(format!("push image: {error}")));
            }
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(|e| map_err("remove image", e))
    }

    #[instrument(skip_all, fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(Mount::bind).collect()),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            privileged: Some(false),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            tty: Some(spec.tty),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| map_err("create container", e))?;
        debug!(id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err("start container", e))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let mut code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => code = response.status_code,
                // Non-zero exits surface as an error carrying the code.
                Err(BollardError::DockerContainerWaitError { code: exit, .. }) => code = exit,
                Err(e) => return Err(map_err("wait container", e)),
            }
        }
        Ok(code)
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| map_err("kill container", e))
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        let mut logs = String::new();
        while let Some(item) = stream.next().await {
            let output = item.map_err(|e| map_err("container logs", e))?;
            logs.push_str(&String::from_utf8_lossy(&output.into_bytes()));
        }
        Ok(logs)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err("remove container", e))
    }
}
