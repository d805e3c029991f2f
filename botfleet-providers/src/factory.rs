use crate::DeploymentTarget;
use anyhow::{bail, Result};
use botfleet_common::{DeploymentTargetConfig, Instance};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds a live adapter from a resolved target config.
pub trait TargetFactory: Send + Sync {
    fn create(
        &self,
        instance: &Instance,
        config: &DeploymentTargetConfig,
    ) -> Result<Arc<dyn DeploymentTarget>>;
}

/// Factory for the adapters compiled into this build (`local` / `docker` features).
/// Cloud substrates are resolved and typed but have no adapter here.
pub struct DefaultTargetFactory {
    data_dir: PathBuf,
    command_timeout: Duration,
}

impl DefaultTargetFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl TargetFactory for DefaultTargetFactory {
    #[allow(unused_variables)]
    fn create(
        &self,
        instance: &Instance,
        config: &DeploymentTargetConfig,
    ) -> Result<Arc<dyn DeploymentTarget>> {
        match config {
            #[cfg(feature = "local")]
            DeploymentTargetConfig::Local(c) => Ok(Arc::new(crate::local::LocalProcessTarget::new(
                c.clone(),
                &self.data_dir,
                self.command_timeout,
            ))),
            #[cfg(feature = "docker")]
            DeploymentTargetConfig::Container(c) => Ok(Arc::new(crate::docker::DockerTarget::new(
                c.clone(),
                &self.data_dir,
                self.command_timeout,
            ))),
            other => bail!(
                "no {} adapter available in this build (instance {})",
                other.deployment_type(),
                instance.id
            ),
        }
    }
}
