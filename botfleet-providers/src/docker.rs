//! Docker adapter: drives the `docker` CLI on the orchestrator host.

use crate::process::{self, CommandOutput};
use crate::{
    ConfigureOptions, DeploymentTarget, Endpoint, InstallOptions, LogFanout, ResourceUpdateResult,
    TargetLogStream, TargetResult, TargetState, TargetStatus,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use botfleet_common::target_config::ContainerTargetConfig;
use botfleet_common::{DeploymentType, ResourceSpec};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONTAINER_CONFIG_DIR: &str = "/config";
const CONFIG_FILE_NAME: &str = "config.json";

pub struct DockerTarget {
    config: ContainerTargetConfig,
    config_dir: PathBuf,
    command_timeout: Duration,
    logs: LogFanout,
}

/// Map `docker inspect --format {{.State.Status}}` output to a target state.
pub fn parse_container_state(raw: &str) -> TargetState {
    match raw.trim() {
        "running" => TargetState::Running,
        "created" | "restarting" => TargetState::Starting,
        "exited" | "paused" | "dead" | "removing" => TargetState::Stopped,
        _ => TargetState::Unknown,
    }
}

impl DockerTarget {
    pub fn new(config: ContainerTargetConfig, data_dir: &Path, command_timeout: Duration) -> Self {
        let config_dir = match config.config_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => data_dir.join("containers").join(&config.container_name),
        };
        Self {
            config,
            config_dir,
            command_timeout,
            logs: LogFanout::default(),
        }
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput> {
        process::run("docker", &args, self.command_timeout, Some(&self.logs)).await
    }

    /// Arguments for `docker run`; the image's entrypoint is expected to start the gateway.
    pub fn run_args(&self) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            c.container_name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-p".to_string(),
            format!("{}:{}:{}", c.host, c.gateway_port, c.gateway_port),
            "-v".to_string(),
            format!("{}:{}", self.config_dir.display(), CONTAINER_CONFIG_DIR),
            "-e".to_string(),
            format!("BOTFLEET_CONFIG_PATH={}/{}", CONTAINER_CONFIG_DIR, CONFIG_FILE_NAME),
            "-e".to_string(),
            format!("BOTFLEET_GATEWAY_PORT={}", c.gateway_port),
        ];
        for (k, v) in &c.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        if let Some(network) = &c.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(cpu) = c.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpu.to_string());
        }
        if let Some(mem) = c.memory_limit_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", mem));
        }
        args.push(c.image.clone());
        args
    }
}

#[async_trait]
impl DeploymentTarget for DockerTarget {
    fn deployment_type(&self) -> DeploymentType {
        DeploymentType::Container
    }

    async fn install(&self, opts: &InstallOptions) -> Result<TargetResult> {
        // A version pin overrides the tag baked into the configured image.
        let image = match &opts.version {
            Some(v) if !v.trim().is_empty() => {
                let repo = match self.config.image.rsplit_once(':') {
                    Some((repo, tag)) if !tag.contains('/') => repo,
                    _ => self.config.image.as_str(),
                };
                format!("{}:{}", repo, v.trim())
            }
            _ => self.config.image.clone(),
        };
        let out = match self.docker(vec!["pull".to_string(), image.clone()]).await {
            Ok(out) => out,
            Err(e) => return Ok(TargetResult::failed(format!("{:#}", e))),
        };
        if !out.success() {
            return Ok(TargetResult::failed(out.failure_message()));
        }
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .with_context(|| format!("failed to create {}", self.config_dir.display()))?;
        Ok(TargetResult::ok(format!("pulled {}", image)))
    }

    async fn configure(&self, opts: &ConfigureOptions) -> Result<TargetResult> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_dir.join(CONFIG_FILE_NAME);
        if let Err(e) = tokio::fs::write(&path, opts.raw_config.as_bytes()).await {
            return Ok(TargetResult::failed(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }
        Ok(TargetResult::ok(format!("wrote {}", path.display())))
    }

    async fn start(&self) -> Result<()> {
        // Replace any stale container with the same name.
        let _ = self
            .docker(vec!["rm".into(), "-f".into(), self.config.container_name.clone()])
            .await;
        let out = self.docker(self.run_args()).await?;
        if !out.success() {
            bail!("docker run failed: {}", out.failure_message());
        }
        tracing::info!(
            container = %self.config.container_name,
            id = %out.stdout.trim(),
            "[docker] container started"
        );
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let out = self
            .docker(vec!["restart".into(), self.config.container_name.clone()])
            .await?;
        if !out.success() {
            bail!("docker restart failed: {}", out.failure_message());
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let out = self
            .docker(vec!["rm".into(), "-f".into(), self.config.container_name.clone()])
            .await?;
        if !out.success() && !out.stderr.contains("No such container") {
            bail!("docker rm failed: {}", out.failure_message());
        }
        match tokio::fs::remove_dir_all(&self.config_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.config_dir.display())),
        }
    }

    async fn get_status(&self) -> Result<TargetStatus> {
        let out = self
            .docker(vec![
                "inspect".into(),
                "--format".into(),
                "{{.State.Status}}".into(),
                self.config.container_name.clone(),
            ])
            .await?;
        if !out.success() {
            if out.stderr.contains("No such object") || out.stderr.contains("No such container") {
                return Ok(TargetStatus::new(TargetState::NotFound));
            }
            return Ok(TargetStatus::with_detail(TargetState::Error, out.failure_message()));
        }
        let raw = out.stdout.trim();
        Ok(TargetStatus::with_detail(parse_container_state(raw), raw))
    }

    async fn get_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint {
            host: self.config.host.clone(),
            port: self.config.gateway_port,
        })
    }

    fn supports_resource_updates(&self) -> bool {
        true
    }

    async fn update_resources(&self, spec: &ResourceSpec) -> Result<ResourceUpdateResult> {
        if let Err(msg) = spec.validate() {
            bail!(msg);
        }
        if spec.disk_gb.is_some() {
            return Ok(ResourceUpdateResult {
                success: false,
                message: "disk size cannot be changed on a running container".to_string(),
                requires_restart: false,
                estimated_downtime_secs: None,
            });
        }
        let mut args = vec!["update".to_string()];
        if let Some(cpu) = spec.cpu {
            args.push("--cpus".to_string());
            args.push(cpu.to_string());
        }
        if let Some(mem) = spec.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", mem));
            args.push("--memory-swap".to_string());
            args.push(format!("{}m", mem));
        }
        args.push(self.config.container_name.clone());

        let out = self.docker(args).await?;
        if !out.success() {
            return Ok(ResourceUpdateResult {
                success: false,
                message: format!("docker update failed: {}", out.failure_message()),
                requires_restart: false,
                estimated_downtime_secs: None,
            });
        }
        Ok(ResourceUpdateResult {
            success: true,
            message: format!("updated limits on {}", self.config.container_name),
            requires_restart: false,
            estimated_downtime_secs: Some(0),
        })
    }

    fn subscribe_logs(&self) -> Option<TargetLogStream> {
        Some(self.logs.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn target() -> DockerTarget {
        let mut env = BTreeMap::new();
        env.insert("SLACK_TOKEN".to_string(), "xoxb".to_string());
        DockerTarget::new(
            ContainerTargetConfig {
                image: "ghcr.io/acme/bot:1.0".to_string(),
                container_name: "bot-a".to_string(),
                host: "127.0.0.1".to_string(),
                gateway_port: 18800,
                config_dir: None,
                env,
                cpu_limit: Some(1.5),
                memory_limit_mb: Some(512),
                network: Some("bots".to_string()),
            },
            Path::new("/var/lib/botfleet"),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn run_args_carry_limits_ports_and_mount() {
        let args = target().run_args();
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name bot-a"));
        assert!(joined.contains("-p 127.0.0.1:18800:18800"));
        assert!(joined.contains("-v /var/lib/botfleet/containers/bot-a:/config"));
        assert!(joined.contains("-e SLACK_TOKEN=xoxb"));
        assert!(joined.contains("--network bots"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--memory 512m"));
        assert_eq!(args.last().map(String::as_str), Some("ghcr.io/acme/bot:1.0"));
    }

    #[test]
    fn container_states_map() {
        assert_eq!(parse_container_state("running\n"), TargetState::Running);
        assert_eq!(parse_container_state("restarting"), TargetState::Starting);
        assert_eq!(parse_container_state("exited"), TargetState::Stopped);
        assert_eq!(parse_container_state("weird"), TargetState::Unknown);
    }

    #[test]
    fn docker_supports_resize() {
        assert!(target().supports_resource_updates());
    }
}
