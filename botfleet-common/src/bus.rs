use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config_gen::Manifest;
use crate::ResourceSpec;

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "botfleet_commands";
pub const CHANNEL_PROVISIONING_EVENTS: &str = "botfleet_provisioning_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:PROVISION")]
    Provision,
    #[serde(rename = "CMD:UPDATE")]
    Update,
    #[serde(rename = "CMD:RESTART")]
    Restart,
    #[serde(rename = "CMD:RELOAD")]
    Reload,
    #[serde(rename = "CMD:DESTROY")]
    Destroy,
    #[serde(rename = "CMD:RESIZE")]
    Resize,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Provision => "CMD:PROVISION",
            CommandType::Update => "CMD:UPDATE",
            CommandType::Restart => "CMD:RESTART",
            CommandType::Reload => "CMD:RELOAD",
            CommandType::Destroy => "CMD:DESTROY",
            CommandType::Resize => "CMD:RESIZE",
        }
    }
}

/// Lifecycle command published by the request layer.
/// `manifest` is required for provision/update (and lets a failed reload fall back to update),
/// `resources` for resize.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LifecycleCommand {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub instance_id: Uuid,
    #[serde(default)]
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

// -----------------------------------------------------------------------------
// Provisioning events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningEventType {
    #[serde(rename = "EVT:PROVISIONING_PROGRESS")]
    Progress,
    #[serde(rename = "EVT:PROVISIONING_LOG")]
    Log,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisioningEventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: ProvisioningEventType,
    pub instance_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl ProvisioningEventEnvelope {
    pub fn new(
        event_type: ProvisioningEventType,
        instance_id: Uuid,
        payload: serde_json::Value,
        source: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            instance_id,
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_decodes_from_wire() {
        let id = Uuid::new_v4();
        let raw = serde_json::json!({
            "type": "CMD:RESIZE",
            "instance_id": id,
            "resources": {"cpu": 2.0, "memory_mb": 4096}
        });
        let cmd: LifecycleCommand = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.command_type, CommandType::Resize);
        assert_eq!(cmd.instance_id, id);
        assert!(cmd.manifest.is_none());
        assert_eq!(cmd.resources.unwrap().memory_mb, Some(4096));
        assert_eq!(CommandType::Resize.as_str(), "CMD:RESIZE");
    }
}
