//! Step vocabulary per deployment type.
//!
//! The orchestrator never hardcodes substrate step names: it asks the registry which steps an
//! operation emits and which of them is "the install step" / "the start step".

use botfleet_common::progress::StepDescriptor;
use botfleet_common::DeploymentType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Install,
    Start,
}

pub const STEP_VALIDATE_CONFIG: &str = "validate_config";
pub const STEP_SECURITY_AUDIT: &str = "security_audit";
pub const STEP_WRITE_CONFIG: &str = "write_config";
pub const STEP_WAIT_FOR_GATEWAY: &str = "wait_for_gateway";
pub const STEP_HEALTH_CHECK: &str = "health_check";

pub const STEP_VALIDATE_RESOURCES: &str = "validate_resources";
pub const STEP_APPLY_CHANGES: &str = "apply_changes";
pub const STEP_VERIFY_COMPLETION: &str = "verify_completion";

fn builtin_operation_step(t: DeploymentType, op: Operation) -> StepDescriptor {
    let (id, name) = match (t, op) {
        (DeploymentType::Local, Operation::Install) => ("install_binary", "Install binary"),
        (DeploymentType::Local, Operation::Start) => ("start_process", "Start process"),
        (DeploymentType::Container, Operation::Install) => ("pull_image", "Pull image"),
        (DeploymentType::Container, Operation::Start) => ("start_container", "Start container"),
        (DeploymentType::ManagedContainerService, Operation::Install) => {
            ("create_service", "Create service")
        }
        (DeploymentType::ManagedContainerService, Operation::Start) => {
            ("start_service", "Start service")
        }
        (DeploymentType::GceVm | DeploymentType::AzureVm, Operation::Install) => {
            ("create_vm", "Create VM")
        }
        (DeploymentType::GceVm | DeploymentType::AzureVm, Operation::Start) => {
            ("start_vm", "Start VM")
        }
    };
    StepDescriptor::new(id, name)
}

fn builtin_provisioning_steps(t: DeploymentType) -> Vec<StepDescriptor> {
    vec![
        StepDescriptor::new(STEP_VALIDATE_CONFIG, "Validate configuration"),
        StepDescriptor::new(STEP_SECURITY_AUDIT, "Security audit"),
        builtin_operation_step(t, Operation::Install),
        StepDescriptor::new(STEP_WRITE_CONFIG, "Write configuration"),
        builtin_operation_step(t, Operation::Start),
        StepDescriptor::new(STEP_WAIT_FOR_GATEWAY, "Wait for gateway"),
        StepDescriptor::new(STEP_HEALTH_CHECK, "Health check"),
    ]
}

fn builtin_resource_update_steps(t: DeploymentType) -> Option<Vec<StepDescriptor>> {
    let apply = match t {
        DeploymentType::Local => return None,
        DeploymentType::Container => StepDescriptor::new("update_container", "Update container limits"),
        DeploymentType::ManagedContainerService => {
            StepDescriptor::new("update_task_definition", "Update task definition")
        }
        DeploymentType::GceVm | DeploymentType::AzureVm => {
            StepDescriptor::new("resize_vm", "Resize VM")
        }
    };
    Some(vec![
        StepDescriptor::new(STEP_VALIDATE_RESOURCES, "Validate resources"),
        apply,
        StepDescriptor::new(STEP_VERIFY_COMPLETION, "Verify completion"),
    ])
}

pub fn fallback_resource_update_steps() -> Vec<StepDescriptor> {
    vec![
        StepDescriptor::new(STEP_VALIDATE_RESOURCES, "Validate resources"),
        StepDescriptor::new(STEP_APPLY_CHANGES, "Apply changes"),
        StepDescriptor::new(STEP_VERIFY_COMPLETION, "Verify completion"),
    ]
}

/// Built once at startup and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    provisioning: HashMap<DeploymentType, Vec<StepDescriptor>>,
    resource_updates: HashMap<DeploymentType, Vec<StepDescriptor>>,
    operation_steps: HashMap<(DeploymentType, Operation), String>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry preloaded with the built-in vocabulary for every deployment type.
    pub fn new() -> Self {
        let mut provisioning = HashMap::new();
        let mut resource_updates = HashMap::new();
        let mut operation_steps = HashMap::new();
        for t in DeploymentType::ALL {
            provisioning.insert(t, builtin_provisioning_steps(t));
            if let Some(steps) = builtin_resource_update_steps(t) {
                resource_updates.insert(t, steps);
            }
            for op in [Operation::Install, Operation::Start] {
                operation_steps.insert((t, op), builtin_operation_step(t, op).id);
            }
        }
        Self {
            provisioning,
            resource_updates,
            operation_steps,
        }
    }

    pub fn provisioning_steps(&self, t: DeploymentType) -> Vec<StepDescriptor> {
        self.provisioning
            .get(&t)
            .cloned()
            .unwrap_or_else(|| builtin_provisioning_steps(t))
    }

    /// Registered resize steps, or the universal three-step fallback.
    pub fn resource_update_steps(&self, t: DeploymentType) -> Vec<StepDescriptor> {
        self.resource_updates
            .get(&t)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(fallback_resource_update_steps)
    }

    pub fn operation_step_id(&self, t: DeploymentType, op: Operation) -> &str {
        self.operation_steps
            .get(&(t, op))
            .map(String::as_str)
            .unwrap_or(match op {
                Operation::Install => "install",
                Operation::Start => "start",
            })
    }

    pub fn register_provisioning_steps(
        &mut self,
        t: DeploymentType,
        steps: Vec<StepDescriptor>,
        install_step_id: &str,
        start_step_id: &str,
    ) {
        self.provisioning.insert(t, steps);
        self.operation_steps
            .insert((t, Operation::Install), install_step_id.to_string());
        self.operation_steps
            .insert((t, Operation::Start), start_step_id.to_string());
    }

    pub fn register_resource_update_steps(&mut self, t: DeploymentType, steps: Vec<StepDescriptor>) {
        self.resource_updates.insert(t, steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(steps: &[StepDescriptor]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn provisioning_steps_embed_type_specific_ids() {
        let reg = AdapterRegistry::new();
        assert_eq!(
            ids(&reg.provisioning_steps(DeploymentType::Container)),
            vec![
                "validate_config",
                "security_audit",
                "pull_image",
                "write_config",
                "start_container",
                "wait_for_gateway",
                "health_check"
            ]
        );
        assert_eq!(
            reg.operation_step_id(DeploymentType::Local, Operation::Install),
            "install_binary"
        );
        assert_eq!(reg.operation_step_id(DeploymentType::AzureVm, Operation::Start), "start_vm");

        for t in DeploymentType::ALL {
            let steps = reg.provisioning_steps(t);
            for op in [Operation::Install, Operation::Start] {
                let id = reg.operation_step_id(t, op);
                assert!(steps.iter().any(|s| s.id == id), "{t}: {id} missing");
            }
        }
    }

    #[test]
    fn resource_update_steps_fall_back_for_unregistered_types() {
        let reg = AdapterRegistry::new();
        assert_eq!(
            ids(&reg.resource_update_steps(DeploymentType::Local)),
            vec!["validate_resources", "apply_changes", "verify_completion"]
        );
        assert_eq!(
            ids(&reg.resource_update_steps(DeploymentType::Container))[1],
            "update_container"
        );
    }

    #[test]
    fn registered_vocabulary_overrides_builtin() {
        let mut reg = AdapterRegistry::new();
        reg.register_provisioning_steps(
            DeploymentType::Local,
            vec![
                StepDescriptor::new("fetch", "Fetch"),
                StepDescriptor::new("launch", "Launch"),
            ],
            "fetch",
            "launch",
        );
        reg.register_resource_update_steps(
            DeploymentType::Local,
            vec![StepDescriptor::new("cgroup", "Adjust cgroup")],
        );
        assert_eq!(reg.operation_step_id(DeploymentType::Local, Operation::Start), "launch");
        assert_eq!(ids(&reg.provisioning_steps(DeploymentType::Local)), vec!["fetch", "launch"]);
        assert_eq!(ids(&reg.resource_update_steps(DeploymentType::Local)), vec!["cgroup"]);
    }
}
