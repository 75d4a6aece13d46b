//! Remote registry pull/push for pre-built evaluation images.

use tracing::instrument;

use crate::error::{HarnessError, HarnessResult};
use crate::io::config::RegistryConfig;
use crate::io::log_sink::LogSink;
use crate::io::runtime::{ContainerRuntime, RegistryAuth};

const DOCKER_HUB: &str = "docker.io";

/// Registry client bound to one configuration. Absent user disables it.
#[derive(Debug, Clone)]
pub struct Registry {
    cfg: RegistryConfig,
}

impl Registry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self { cfg }
    }

    pub fn pull_enabled(&self) -> bool {
        self.cfg.pull_enabled()
    }

    pub fn push_enabled(&self) -> bool {
        self.cfg.push_enabled()
    }

    /// Fully qualified name of `image` in the registry.
    ///
    /// `<url>/<image>` for a non-Docker-Hub url, otherwise `<user>/<image>`.
    pub fn remote_name(&self, image: &str) -> String {
        match self.cfg.url.as_deref().map(|u| u.trim_end_matches('/')) {
            Some(url) if !url.is_empty() && url != DOCKER_HUB => format!("{url}/{image}"),
            _ => format!("{}/{image}", self.cfg.user.as_deref().unwrap_or_default()),
        }
    }

    fn auth(&self) -> Option<RegistryAuth> {
        let user = self.cfg.user.clone()?;
        Some(RegistryAuth {
            username: user,
            password: self.cfg.password.clone(),
            server: self
                .cfg
                .url
                .clone()
                .filter(|url| !url.is_empty() && url != DOCKER_HUB),
        })
    }

    /// Pull the registry copy of `image`, retag it to the local name, and drop
    /// the registry tag.
    #[instrument(skip(self, runtime, log))]
    pub async fn pull(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &str,
        log: &LogSink,
    ) -> HarnessResult<()> {
        let remote = self.remote_name(image);
        log.info(format!("Pulling {remote} from registry"));
        let registry_err = |message: String| HarnessError::Registry {
            image: image.to_string(),
            message,
        };
        runtime
            .pull_image(&remote, self.auth().as_ref())
            .await
            .map_err(|e| registry_err(e.to_string()))?;
        runtime
            .tag_image(&remote, image, "latest")
            .await
            .map_err(|e| registry_err(e.to_string()))?;
        if let Err(e) = runtime.remove_image(&remote).await {
            log.warn(format!("Failed to remove registry tag {remote}: {e}"));
        }
        log.info(format!("Pulled {remote} as {image}"));
        Ok(())
    }

    /// Tag `image` with its registry name, push it, and always drop the
    /// registry tag afterwards.
    #[instrument(skip(self, runtime, log))]
    pub async fn push(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &str,
        log: &LogSink,
    ) -> HarnessResult<()> {
        let remote = self.remote_name(image);
        log.info(format!("Pushing {image} to {remote}"));
        let registry_err = |message: String| HarnessError::Registry {
            image: image.to_string(),
            message,
        };
        runtime
            .tag_image(image, &remote, "latest")
            .await
            .map_err(|e| registry_err(e.to_string()))?;
        let pushed = runtime.push_image(&remote, self.auth().as_ref()).await;
        if let Err(e) = runtime.remove_image(&remote).await {
            log.warn(format!("Failed to remove registry tag {remote}: {e}"));
        }
        pushed.map_err(|e| registry_err(e.to_string()))?;
        log.info(format!("Pushed {remote}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(url: Option<&str>) -> RegistryConfig {
        RegistryConfig {
            push: true,
            pull: true,
            url: url.map(str::to_string),
            user: Some("bot".to_string()),
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn remote_name_prefers_private_registry_url() {
        let registry = Registry::new(cfg(Some("registry.local:5000")));
        assert_eq!(
            registry.remote_name("eval-o-r-1234abcd"),
            "registry.local:5000/eval-o-r-1234abcd"
        );
    }

    #[test]
    fn remote_name_falls_back_to_user_namespace() {
        assert_eq!(
            Registry::new(cfg(Some("docker.io"))).remote_name("img"),
            "bot/img"
        );
        assert_eq!(Registry::new(cfg(None)).remote_name("img"), "bot/img");
    }

    #[test]
    fn missing_user_disables_registry() {
        let mut c = cfg(None);
        c.user = None;
        let registry = Registry::new(c);
        assert!(!registry.pull_enabled());
        assert!(!registry.push_enabled());
    }
}
