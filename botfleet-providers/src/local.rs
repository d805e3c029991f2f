//! Local process adapter: one gateway child process per instance profile on this host.

use crate::process::{self, forward_lines};
use crate::{
    ConfigureOptions, DeploymentTarget, Endpoint, InstallOptions, LogFanout, TargetLogStream,
    TargetResult, TargetState, TargetStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use botfleet_common::progress::LogStream;
use botfleet_common::target_config::LocalTargetConfig;
use botfleet_common::DeploymentType;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub struct LocalProcessTarget {
    config: LocalTargetConfig,
    state_dir: PathBuf,
    command_timeout: Duration,
    child: Mutex<Option<Child>>,
    logs: LogFanout,
}

impl LocalProcessTarget {
    pub fn new(config: LocalTargetConfig, data_dir: &Path, command_timeout: Duration) -> Self {
        let state_dir = match config.state_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => data_dir.join("profiles").join(&config.profile),
        };
        Self {
            config,
            state_dir,
            command_timeout,
            child: Mutex::new(None),
            logs: LogFanout::default(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE_NAME)
    }

    async fn spawn_gateway(&self, slot: &mut Option<Child>) -> Result<()> {
        let config_path = self.config_path();
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("gateway")
            .arg("--port")
            .arg(self.config.gateway_port.to_string())
            .arg("--config")
            .arg(&config_path)
            .current_dir(&self.state_dir)
            .env("BOTFLEET_PROFILE", &self.config.profile)
            .env("BOTFLEET_STATE_DIR", &self.state_dir)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{} gateway`", self.config.binary))?;
        if let Some(out) = child.stdout.take() {
            forward_lines(out, LogStream::Stdout, self.logs.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, LogStream::Stderr, self.logs.clone());
        }
        tracing::info!(
            profile = %self.config.profile,
            port = self.config.gateway_port,
            pid = child.id().unwrap_or_default(),
            "[local] gateway process started"
        );
        *slot = Some(child);
        Ok(())
    }

    async fn kill(slot: &mut Option<Child>) -> Result<()> {
        if let Some(mut child) = slot.take() {
            if child.try_wait()?.is_none() {
                child.kill().await.context("failed to kill gateway process")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentTarget for LocalProcessTarget {
    fn deployment_type(&self) -> DeploymentType {
        DeploymentType::Local
    }

    async fn install(&self, _opts: &InstallOptions) -> Result<TargetResult> {
        let out = match process::run(
            &self.config.binary,
            &["--version".to_string()],
            self.command_timeout,
            Some(&self.logs),
        )
        .await
        {
            Ok(out) => out,
            Err(e) => return Ok(TargetResult::failed(format!("{:#}", e))),
        };
        if !out.success() {
            return Ok(TargetResult::failed(out.failure_message()));
        }
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| format!("failed to create {}", self.state_dir.display()))?;
        Ok(TargetResult::ok(format!(
            "{} {}",
            self.config.binary,
            out.stdout.trim()
        )))
    }

    async fn configure(&self, opts: &ConfigureOptions) -> Result<TargetResult> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let path = self.config_path();
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
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }
        self.spawn_gateway(&mut slot).await
    }

    async fn restart(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        Self::kill(&mut slot).await?;
        self.spawn_gateway(&mut slot).await
    }

    async fn destroy(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        Self::kill(&mut slot).await?;
        match tokio::fs::remove_dir_all(&self.state_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.state_dir.display())),
        }
    }

    async fn get_status(&self) -> Result<TargetStatus> {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return Ok(TargetStatus::new(TargetState::Stopped));
        };
        Ok(match child.try_wait() {
            Ok(None) => TargetStatus::new(TargetState::Running),
            Ok(Some(status)) => TargetStatus::with_detail(TargetState::Stopped, status.to_string()),
            Err(e) => TargetStatus::with_detail(TargetState::Error, e.to_string()),
        })
    }

    async fn get_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint {
            host: "127.0.0.1".to_string(),
            port: self.config.gateway_port,
        })
    }

    fn subscribe_logs(&self) -> Option<TargetLogStream> {
        Some(self.logs.subscribe())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn target(binary: &str, dir: &Path) -> LocalProcessTarget {
        LocalProcessTarget::new(
            LocalTargetConfig {
                binary: binary.to_string(),
                profile: "alpha".to_string(),
                gateway_port: 18789,
                state_dir: Some(dir.to_string_lossy().into_owned()),
                env: BTreeMap::new(),
            },
            Path::new("/unused"),
            Duration::from_secs(10),
        )
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("botfleet-local-{}-{}", tag, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_binary_fails_install_without_error() {
        let dir = temp_dir("missing");
        let t = target("no-such-gateway-binary-xyz", &dir);
        let res = t.install(&InstallOptions::default()).await.unwrap();
        assert!(!res.success);
        assert!(res.message.contains("no-such-gateway-binary-xyz"));
    }

    #[tokio::test]
    async fn configure_writes_config_and_destroy_cleans_up() {
        let dir = temp_dir("cfg");
        let t = target("true", &dir);
        assert_eq!(t.get_status().await.unwrap().state, TargetState::Stopped);

        let res = t
            .configure(&ConfigureOptions {
                raw_config: "{\"a\":1}".to_string(),
                config_hash: "h".to_string(),
                gateway_port: 18789,
            })
            .await
            .unwrap();
        assert!(res.success);
        let written = tokio::fs::read_to_string(dir.join(CONFIG_FILE_NAME)).await.unwrap();
        assert_eq!(written, "{\"a\":1}");

        t.destroy().await.unwrap();
        assert!(!dir.exists());
        t.destroy().await.unwrap();
    }
}
