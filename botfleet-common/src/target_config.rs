//! Typed deployment-target configuration.
//!
//! Every substrate gets its own struct; [`DeploymentTargetConfig`] is the closed union over them.
//! Resolution (`resolve`) always yields exactly one concrete variant or an error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{DeploymentType, Instance};

pub const DEFAULT_GATEWAY_PORT: u16 = 18789;
pub const DEFAULT_LOCAL_BINARY: &str = "openclaw";

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_local_binary() -> String {
    DEFAULT_LOCAL_BINARY.to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LocalTargetConfig {
    #[serde(default = "default_local_binary")]
    pub binary: String,
    pub profile: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// State directory; defaults to `<data_dir>/<profile>` when unset.
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerTargetConfig {
    pub image: String,
    pub container_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Host directory bind-mounted as the container's config dir.
    #[serde(default)]
    pub config_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ManagedContainerServiceConfig {
    pub region: String,
    pub cluster_name: String,
    pub service_name: String,
    pub image: String,
    #[serde(default)]
    pub cpu_units: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_id: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GceVmConfig {
    pub project_id: String,
    pub zone: String,
    pub machine_type: String,
    #[serde(default)]
    pub boot_disk_size_gb: Option<u64>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    /// Service-account key JSON.
    pub credentials_json: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AzureVmConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub resource_group: String,
    pub region: String,
    pub vm_size: String,
    #[serde(default)]
    pub os_disk_size_gb: Option<u64>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeploymentTargetConfig {
    Local(LocalTargetConfig),
    Container(ContainerTargetConfig),
    ManagedContainerService(ManagedContainerServiceConfig),
    GceVm(GceVmConfig),
    AzureVm(AzureVmConfig),
}

impl DeploymentTargetConfig {
    pub fn deployment_type(&self) -> DeploymentType {
        match self {
            DeploymentTargetConfig::Local(_) => DeploymentType::Local,
            DeploymentTargetConfig::Container(_) => DeploymentType::Container,
            DeploymentTargetConfig::ManagedContainerService(_) => {
                DeploymentType::ManagedContainerService
            }
            DeploymentTargetConfig::GceVm(_) => DeploymentType::GceVm,
            DeploymentTargetConfig::AzureVm(_) => DeploymentType::AzureVm,
        }
    }
}

/// Persisted target row: a declared type plus the substrate config as JSON.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeploymentTargetRecord {
    pub id: Uuid,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub config: serde_json::Value,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TargetConfigError {
    #[error("deployment target {id} has invalid {deployment_type} config: {message}")]
    InvalidRecord {
        id: Uuid,
        deployment_type: DeploymentType,
        message: String,
    },
    #[error("deployment target {id} declares type {declared} but config is {actual}")]
    TypeMismatch {
        id: Uuid,
        declared: DeploymentType,
        actual: DeploymentType,
    },
    #[error("instance {instance_id} is {declared} but its metadata target is {actual}")]
    MetadataTypeMismatch {
        instance_id: Uuid,
        declared: DeploymentType,
        actual: DeploymentType,
    },
    #[error("no deployment target configured for instance {instance_id} ({deployment_type})")]
    Missing {
        instance_id: Uuid,
        deployment_type: DeploymentType,
    },
}

impl DeploymentTargetRecord {
    /// Map the record into its typed variant. The `type` tag is taken from the record's
    /// declared type when the JSON omits it.
    pub fn to_config(&self) -> Result<DeploymentTargetConfig, TargetConfigError> {
        let mut value = self.config.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.entry("type")
                .or_insert_with(|| serde_json::Value::String(self.deployment_type.as_str().to_string()));
        }
        let config: DeploymentTargetConfig =
            serde_json::from_value(value).map_err(|e| TargetConfigError::InvalidRecord {
                id: self.id,
                deployment_type: self.deployment_type,
                message: e.to_string(),
            })?;
        if config.deployment_type() != self.deployment_type {
            return Err(TargetConfigError::TypeMismatch {
                id: self.id,
                declared: self.deployment_type,
                actual: config.deployment_type(),
            });
        }
        Ok(config)
    }
}

/// Resolve the target config for an instance.
///
/// Precedence: persisted record, then the typed target in instance metadata, then (for
/// `local` instances only) a config synthesized from the instance itself.
pub fn resolve(
    instance: &Instance,
    record: Option<&DeploymentTargetRecord>,
) -> Result<DeploymentTargetConfig, TargetConfigError> {
    if let Some(record) = record {
        return record.to_config();
    }
    if let Some(target) = &instance.metadata.target {
        if target.deployment_type() != instance.deployment_type {
            return Err(TargetConfigError::MetadataTypeMismatch {
                instance_id: instance.id,
                declared: instance.deployment_type,
                actual: target.deployment_type(),
            });
        }
        return Ok(target.clone());
    }
    match instance.deployment_type {
        DeploymentType::Local => Ok(DeploymentTargetConfig::Local(LocalTargetConfig {
            binary: default_local_binary(),
            profile: instance.effective_profile_name(),
            gateway_port: instance.gateway_port.unwrap_or(DEFAULT_GATEWAY_PORT),
            state_dir: None,
            env: instance.metadata.container_env.clone(),
        })),
        other => Err(TargetConfigError::Missing {
            instance_id: instance.id,
            deployment_type: other,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container_record() -> DeploymentTargetRecord {
        DeploymentTargetRecord {
            id: Uuid::new_v4(),
            name: "docker-host-1".to_string(),
            deployment_type: DeploymentType::Container,
            config: json!({
                "image": "ghcr.io/acme/bot:1.2.0",
                "container_name": "bot-a",
                "memory_limit_mb": 1024
            }),
        }
    }

    #[test]
    fn record_wins_over_metadata() {
        let mut inst = Instance::new("a", DeploymentType::Container);
        inst.metadata.target = Some(DeploymentTargetConfig::Local(LocalTargetConfig {
            binary: "x".into(),
            profile: "p".into(),
            gateway_port: 1,
            state_dir: None,
            env: BTreeMap::new(),
        }));
        let record = container_record();

        let cfg = resolve(&inst, Some(&record)).unwrap();
        match cfg {
            DeploymentTargetConfig::Container(c) => {
                assert_eq!(c.image, "ghcr.io/acme/bot:1.2.0");
                assert_eq!(c.gateway_port, DEFAULT_GATEWAY_PORT);
                assert_eq!(c.memory_limit_mb, Some(1024));
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn record_type_mismatch_is_rejected() {
        let mut record = container_record();
        record.config["type"] = json!("local");
        record.config["profile"] = json!("p");
        let err = record.to_config().unwrap_err();
        assert!(matches!(err, TargetConfigError::TypeMismatch { .. }));
    }

    #[test]
    fn metadata_target_must_match_instance_type() {
        let mut inst = Instance::new("a", DeploymentType::Container);
        inst.metadata.target = Some(DeploymentTargetConfig::Local(LocalTargetConfig {
            binary: "x".into(),
            profile: "p".into(),
            gateway_port: 1,
            state_dir: None,
            env: BTreeMap::new(),
        }));
        assert!(matches!(
            resolve(&inst, None),
            Err(TargetConfigError::MetadataTypeMismatch {
                declared: DeploymentType::Container,
                actual: DeploymentType::Local,
                ..
            })
        ));

        inst.deployment_type = DeploymentType::Local;
        assert!(matches!(resolve(&inst, None), Ok(DeploymentTargetConfig::Local(_))));
    }

    #[test]
    fn local_falls_back_to_instance_fields() {
        let mut inst = Instance::new("a", DeploymentType::Local);
        inst.profile_name = Some("alpha".to_string());
        inst.gateway_port = Some(19001);

        match resolve(&inst, None).unwrap() {
            DeploymentTargetConfig::Local(l) => {
                assert_eq!(l.profile, "alpha");
                assert_eq!(l.gateway_port, 19001);
                assert_eq!(l.binary, DEFAULT_LOCAL_BINARY);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn non_local_without_target_is_missing() {
        let inst = Instance::new("a", DeploymentType::GceVm);
        assert!(matches!(
            resolve(&inst, None),
            Err(TargetConfigError::Missing { .. })
        ));
    }
}
