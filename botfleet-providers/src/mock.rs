//! Scriptable in-memory target for tests and local development.
//!
//! Every call is recorded by name so tests can assert on what the orchestrator actually did.

use crate::factory::TargetFactory;
use crate::{
    ConfigureOptions, DeploymentTarget, Endpoint, InstallOptions, LogFanout, ResourceUpdateResult,
    TargetLogStream, TargetResult, TargetState, TargetStatus,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use botfleet_common::progress::LogStream;
use botfleet_common::{DeploymentTargetConfig, DeploymentType, Instance, ResourceSpec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub install: TargetResult,
    pub configure: TargetResult,
    pub start_error: Option<String>,
    pub restart_error: Option<String>,
    pub destroy_error: Option<String>,
    pub status: TargetState,
    pub endpoint: Endpoint,
    /// `None` means the target does not support resource updates at all.
    pub resource_updates: Option<ResourceUpdateResult>,
    /// Lines emitted to log subscribers during `install`.
    pub install_output: Vec<(LogStream, String)>,
    /// Artificial latency for `install`, to exercise cancellation/timeouts.
    pub install_delay: Option<Duration>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            install: TargetResult::ok("installed"),
            configure: TargetResult::ok("configured"),
            start_error: None,
            restart_error: None,
            destroy_error: None,
            status: TargetState::Running,
            endpoint: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 18789,
            },
            resource_updates: None,
            install_output: Vec::new(),
            install_delay: None,
        }
    }
}

pub struct MockTarget {
    deployment_type: DeploymentType,
    behavior: Mutex<MockBehavior>,
    calls: Mutex<Vec<String>>,
    configured: Mutex<Vec<ConfigureOptions>>,
    logs: LogFanout,
}

impl MockTarget {
    pub fn new(deployment_type: DeploymentType) -> Self {
        Self::with_behavior(deployment_type, MockBehavior::default())
    }

    pub fn with_behavior(deployment_type: DeploymentType, behavior: MockBehavior) -> Self {
        Self {
            deployment_type,
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            configured: Mutex::new(Vec::new()),
            logs: LogFanout::default(),
        }
    }

    pub fn update_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        if let Ok(mut b) = self.behavior.lock() {
            f(&mut b);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    /// Configs pushed through `configure`, oldest first.
    pub fn configured(&self) -> Vec<ConfigureOptions> {
        self.configured.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, name: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name.to_string());
        }
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

fn scripted(err: Option<String>) -> Result<()> {
    match err {
        Some(msg) => Err(anyhow!(msg)),
        None => Ok(()),
    }
}

#[async_trait]
impl DeploymentTarget for MockTarget {
    fn deployment_type(&self) -> DeploymentType {
        self.deployment_type
    }

    async fn install(&self, _opts: &InstallOptions) -> Result<TargetResult> {
        self.record("install");
        let b = self.behavior();
        for (stream, line) in &b.install_output {
            self.logs.publish(*stream, line);
        }
        if let Some(delay) = b.install_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(b.install)
    }

    async fn configure(&self, opts: &ConfigureOptions) -> Result<TargetResult> {
        self.record("configure");
        if let Ok(mut c) = self.configured.lock() {
            c.push(opts.clone());
        }
        Ok(self.behavior().configure)
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        scripted(self.behavior().start_error)
    }

    async fn restart(&self) -> Result<()> {
        self.record("restart");
        scripted(self.behavior().restart_error)
    }

    async fn destroy(&self) -> Result<()> {
        self.record("destroy");
        scripted(self.behavior().destroy_error)
    }

    async fn get_status(&self) -> Result<TargetStatus> {
        self.record("get_status");
        Ok(TargetStatus::new(self.behavior().status))
    }

    async fn get_endpoint(&self) -> Result<Endpoint> {
        self.record("get_endpoint");
        Ok(self.behavior().endpoint)
    }

    fn supports_resource_updates(&self) -> bool {
        self.behavior().resource_updates.is_some()
    }

    async fn update_resources(&self, _spec: &ResourceSpec) -> Result<ResourceUpdateResult> {
        self.record("update_resources");
        self.behavior()
            .resource_updates
            .ok_or_else(|| anyhow!("mock target does not support resource updates"))
    }

    fn subscribe_logs(&self) -> Option<TargetLogStream> {
        Some(self.logs.subscribe())
    }
}

/// Hands out the same shared [`MockTarget`] for every instance.
pub struct MockTargetFactory {
    target: Arc<MockTarget>,
    created: AtomicUsize,
}

impl MockTargetFactory {
    pub fn new(target: Arc<MockTarget>) -> Self {
        Self {
            target,
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TargetFactory for MockTargetFactory {
    fn create(
        &self,
        _instance: &Instance,
        _config: &DeploymentTargetConfig,
    ) -> Result<Arc<dyn DeploymentTarget>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_follows_script() {
        let t = MockTarget::new(DeploymentType::Local);
        assert!(!t.supports_resource_updates());
        t.update_behavior(|b| b.start_error = Some("port in use".to_string()));

        assert!(t.install(&InstallOptions::default()).await.unwrap().success);
        let err = t.start().await.unwrap_err();
        assert_eq!(err.to_string(), "port in use");
        assert_eq!(t.calls(), vec!["install", "start"]);
        assert!(t.update_resources(&ResourceSpec::default()).await.is_err());
    }

    #[tokio::test]
    async fn install_output_reaches_subscribers() {
        let t = MockTarget::new(DeploymentType::Container);
        t.update_behavior(|b| {
            b.install_output = vec![(LogStream::Stderr, "pulling layer".to_string())]
        });
        let mut rx = t.subscribe_logs().unwrap();
        t.install(&InstallOptions::default()).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().line, "pulling layer");
    }
}
