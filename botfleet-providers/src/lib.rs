use anyhow::Result;
use async_trait::async_trait;
use botfleet_common::progress::LogStream;
use botfleet_common::{DeploymentType, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub mod factory;
pub mod process;
pub mod registry;

pub use factory::{DefaultTargetFactory, TargetFactory};
pub use registry::{AdapterRegistry, Operation};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub profile_name: String,
    /// Version pin (image tag / binary version). `None` means whatever the target ships.
    pub version: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ConfigureOptions {
    /// Serialized runtime config document.
    pub raw_config: String,
    pub config_hash: String,
    pub gateway_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub success: bool,
    pub message: String,
}

impl TargetResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Running,
    Stopped,
    Starting,
    NotFound,
    Error,
    Unknown,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Running => "running",
            TargetState::Stopped => "stopped",
            TargetState::Starting => "starting",
            TargetState::NotFound => "not_found",
            TargetState::Error => "error",
            TargetState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub state: TargetState,
    pub detail: Option<String>,
}

impl TargetStatus {
    pub fn new(state: TargetState) -> Self {
        Self { state, detail: None }
    }

    pub fn with_detail(state: TargetState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdateResult {
    pub success: bool,
    pub message: String,
    pub requires_restart: bool,
    pub estimated_downtime_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetLogLine {
    pub line: String,
    pub stream: LogStream,
}

pub type TargetLogStream = mpsc::UnboundedReceiver<TargetLogLine>;

/// Fan-out of target output lines to any number of live subscribers.
/// A subscriber whose receiver was dropped is pruned on the next publish.
#[derive(Clone, Default)]
pub struct LogFanout {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TargetLogLine>>>>,
}

impl LogFanout {
    pub fn subscribe(&self) -> TargetLogStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn publish(&self, stream: LogStream, line: &str) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| {
            tx.send(TargetLogLine {
                line: line.to_string(),
                stream,
            })
            .is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Uniform lifecycle contract every substrate adapter implements.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    fn deployment_type(&self) -> DeploymentType;

    async fn install(&self, opts: &InstallOptions) -> Result<TargetResult>;
    async fn configure(&self, opts: &ConfigureOptions) -> Result<TargetResult>;
    async fn start(&self) -> Result<()>;

    /// Also used as the lightweight reload signal: the gateway rereads its config instead of
    /// respawning when the substrate supports it.
    async fn restart(&self) -> Result<()>;
    async fn destroy(&self) -> Result<()>;
    async fn get_status(&self) -> Result<TargetStatus>;
    async fn get_endpoint(&self) -> Result<Endpoint>;

    // Optional: live resource updates (cpu/memory/disk).
    // Default: not supported. Callers must check this before calling `update_resources`.
    fn supports_resource_updates(&self) -> bool {
        false
    }

    async fn update_resources(&self, _spec: &ResourceSpec) -> Result<ResourceUpdateResult> {
        Err(anyhow::anyhow!(
            "{} target does not support resource updates",
            self.deployment_type()
        ))
    }

    // Optional: subscribe to target output (install/start logs).
    // Default: None (target produces no streamable output). Dropping the receiver unsubscribes.
    fn subscribe_logs(&self) -> Option<TargetLogStream> {
        None
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "local")]
pub mod local;

#[cfg(feature = "docker")]
pub mod docker;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_prunes_dropped_subscribers() {
        let fanout = LogFanout::default();
        let mut keep = fanout.subscribe();
        let dropped = fanout.subscribe();
        drop(dropped);

        fanout.publish(LogStream::Stdout, "hello");
        assert_eq!(fanout.subscriber_count(), 1);
        let line = keep.try_recv().unwrap();
        assert_eq!(line.line, "hello");
        assert_eq!(line.stream, LogStream::Stdout);
    }
}
