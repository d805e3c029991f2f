use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod bus;
pub mod config_gen;
pub mod progress;
pub mod target_config;

pub use target_config::{DeploymentTargetConfig, DeploymentTargetRecord};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "instance_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Pending,  // Created, not yet provisioned (or provisioning in flight)
    Running,  // Gateway reachable, config applied
    Error,    // Last lifecycle operation failed
    Deleting, // Soft-deleted by destroy
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Deleting => "DELETING",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "health_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Substrate an instance runs on. Closed set: adding a substrate means adding a variant
/// here and in [`DeploymentTargetConfig`], and the compiler points at every match to extend.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "deployment_type", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentType {
    Local,
    Container,
    ManagedContainerService,
    GceVm,
    AzureVm,
}

impl DeploymentType {
    pub const ALL: [DeploymentType; 5] = [
        DeploymentType::Local,
        DeploymentType::Container,
        DeploymentType::ManagedContainerService,
        DeploymentType::GceVm,
        DeploymentType::AzureVm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Local => "local",
            DeploymentType::Container => "container",
            DeploymentType::ManagedContainerService => "managed-container-service",
            DeploymentType::GceVm => "gce-vm",
            DeploymentType::AzureVm => "azure-vm",
        }
    }

    /// Case-insensitive parse. Accepts a few legacy spellings (`docker`, `ecs`, `gce`, `azure`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Some(DeploymentType::Local),
            "container" | "docker" => Some(DeploymentType::Container),
            "managed-container-service" | "ecs" | "ecs-ec2" => {
                Some(DeploymentType::ManagedContainerService)
            }
            "gce-vm" | "gce" => Some(DeploymentType::GceVm),
            "azure-vm" | "azure" => Some(DeploymentType::AzureVm),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "gateway_connection_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GatewayConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

// --- Entities ---

/// Per-type metadata attached to an instance. Decoded once when the instance is loaded,
/// so use sites never re-parse an untyped blob.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct InstanceMetadata {
    /// Inline target config, used when no persisted target record is referenced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeploymentTargetConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub container_env: BTreeMap<String, String>,
    /// Secret references (names in the secrets store), never raw secret values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
}

impl InstanceMetadata {
    /// Validate a raw metadata document at the system boundary.
    /// `null` is accepted and yields empty metadata.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub deployment_type: DeploymentType,
    pub deployment_target_id: Option<Uuid>,

    // Hash of the last config confirmed on the gateway. Never a desired-but-unapplied state.
    pub config_hash: Option<String>,
    pub gateway_port: Option<u16>,
    pub profile_name: Option<String>,
    pub version: Option<String>,

    pub restart_count: i32,
    pub error_count: i32,
    pub last_error: Option<String>,

    pub running_since: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,

    pub metadata: InstanceMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(name: &str, deployment_type: DeploymentType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: InstanceStatus::Pending,
            health: HealthStatus::Unknown,
            deployment_type,
            deployment_target_id: None,
            config_hash: None,
            gateway_port: None,
            profile_name: None,
            version: None,
            restart_count: 0,
            error_count: 0,
            last_error: None,
            running_since: None,
            last_reconcile_at: None,
            last_health_check_at: None,
            metadata: InstanceMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Profile name used for process isolation on shared hosts. Defaults to a slug of the id.
    pub fn effective_profile_name(&self) -> String {
        match self.profile_name.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => format!("bot-{}", &self.id.simple().to_string()[..12]),
        }
    }
}

/// Partial update of an instance row. `None` means "leave unchanged".
/// `last_error: Some(None)` clears the stored error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub health: Option<HealthStatus>,
    pub config_hash: Option<String>,
    pub gateway_port: Option<u16>,
    pub restart_count: Option<i32>,
    pub error_count: Option<i32>,
    pub last_error: Option<Option<String>>,
    pub running_since: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl InstancePatch {
    pub fn is_empty(&self) -> bool {
        *self == InstancePatch::default()
    }

    pub fn apply_to(&self, instance: &mut Instance) {
        if let Some(s) = self.status {
            instance.status = s;
        }
        if let Some(h) = self.health {
            instance.health = h;
        }
        if let Some(hash) = &self.config_hash {
            instance.config_hash = Some(hash.clone());
        }
        if let Some(port) = self.gateway_port {
            instance.gateway_port = Some(port);
        }
        if let Some(n) = self.restart_count {
            instance.restart_count = n;
        }
        if let Some(n) = self.error_count {
            instance.error_count = n;
        }
        if let Some(err) = &self.last_error {
            instance.last_error = err.clone();
        }
        if let Some(ts) = self.running_since {
            instance.running_since = Some(ts);
        }
        if let Some(ts) = self.last_reconcile_at {
            instance.last_reconcile_at = Some(ts);
        }
        if let Some(ts) = self.last_health_check_at {
            instance.last_health_check_at = Some(ts);
        }
        instance.updated_at = Utc::now();
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GatewayConnection {
    pub instance_id: Uuid,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub config_hash: Option<String>,
    pub status: GatewayConnectionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProcessProfile {
    pub instance_id: Uuid,
    pub name: String,
    pub port: u16,
    pub updated_at: DateTime<Utc>,
}

/// Requested resource shape for a resize. Unset fields are left as-is by the target.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceSpec {
    pub cpu: Option<f64>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.cpu.is_none() && self.memory_mb.is_none() && self.disk_gb.is_none() {
            return Err("resource spec is empty (set cpu, memory_mb or disk_gb)".to_string());
        }
        if let Some(cpu) = self.cpu {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(format!("cpu must be > 0 (got {})", cpu));
            }
        }
        if self.memory_mb == Some(0) {
            return Err("memory_mb must be > 0".to_string());
        }
        if self.disk_gb == Some(0) {
            return Err("disk_gb must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_type_parse_roundtrip() {
        for t in DeploymentType::ALL {
            assert_eq!(DeploymentType::parse(t.as_str()), Some(t));
            assert_eq!(DeploymentType::parse(&t.as_str().to_uppercase()), Some(t));
        }
        assert_eq!(DeploymentType::parse("docker"), Some(DeploymentType::Container));
        assert_eq!(DeploymentType::parse("kubernetes"), None);
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut inst = Instance::new("bot", DeploymentType::Local);
        inst.config_hash = Some("abc".to_string());
        inst.last_error = Some("boom".to_string());

        let patch = InstancePatch {
            status: Some(InstanceStatus::Running),
            last_error: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut inst);

        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.config_hash.as_deref(), Some("abc"));
        assert_eq!(inst.last_error, None);
        assert!(InstancePatch::default().is_empty());
    }

    #[test]
    fn metadata_null_is_empty() {
        let meta = InstanceMetadata::from_value(serde_json::Value::Null).unwrap();
        assert_eq!(meta, InstanceMetadata::default());
        assert!(InstanceMetadata::from_value(serde_json::json!({"target": 42})).is_err());
    }

    #[test]
    fn resource_spec_validation() {
        assert!(ResourceSpec::default().validate().is_err());
        assert!(ResourceSpec { cpu: Some(0.0), ..Default::default() }.validate().is_err());
        assert!(ResourceSpec { memory_mb: Some(2048), ..Default::default() }.validate().is_ok());
    }
}
