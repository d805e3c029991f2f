//! In-memory repository for tests and single-node development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use botfleet_common::{
    DeploymentTargetRecord, GatewayConnection, Instance, InstancePatch, InstanceStatus,
    ProcessProfile,
};

use super::Repository;
use crate::error::RepositoryError;

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub instance_id: Uuid,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, Instance>,
    targets: HashMap<Uuid, DeploymentTargetRecord>,
    gateway_connections: HashMap<Uuid, GatewayConnection>,
    process_profiles: HashMap<Uuid, ProcessProfile>,
    health_snapshots: HashMap<Uuid, u64>,
    transitions: Vec<StateTransition>,
    updates: Vec<(Uuid, InstancePatch)>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.id, instance);
    }

    pub fn insert_deployment_target(&self, record: DeploymentTargetRecord) {
        self.lock().targets.insert(record.id, record);
    }

    pub fn insert_health_snapshot(&self, instance_id: Uuid) {
        *self.lock().health_snapshots.entry(instance_id).or_default() += 1;
    }

    pub fn health_snapshot_count(&self, instance_id: Uuid) -> u64 {
        self.lock()
            .health_snapshots
            .get(&instance_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn process_profile(&self, instance_id: Uuid) -> Option<ProcessProfile> {
        self.lock().process_profiles.get(&instance_id).cloned()
    }

    /// Every `update_instance` call, in order.
    pub fn updates(&self) -> Vec<(Uuid, InstancePatch)> {
        self.lock().updates.clone()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.lock().transitions.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, RepositoryError> {
        let mut all: Vec<Instance> = self.lock().instances.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<Instance, RepositoryError> {
        let mut t = self.lock();
        t.updates.push((id, patch.clone()));
        let inst = t
            .instances
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", id)))?;
        patch.apply_to(inst);
        Ok(inst.clone())
    }

    async fn get_deployment_target(
        &self,
        id: Uuid,
    ) -> Result<Option<DeploymentTargetRecord>, RepositoryError> {
        Ok(self.lock().targets.get(&id).cloned())
    }

    async fn upsert_gateway_connection(&self, conn: &GatewayConnection) -> Result<(), RepositoryError> {
        self.lock()
            .gateway_connections
            .insert(conn.instance_id, conn.clone());
        Ok(())
    }

    async fn get_gateway_connection(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<GatewayConnection>, RepositoryError> {
        Ok(self.lock().gateway_connections.get(&instance_id).cloned())
    }

    async fn delete_gateway_connection(&self, instance_id: Uuid) -> Result<(), RepositoryError> {
        self.lock().gateway_connections.remove(&instance_id);
        Ok(())
    }

    async fn upsert_process_profile(&self, profile: &ProcessProfile) -> Result<(), RepositoryError> {
        self.lock()
            .process_profiles
            .insert(profile.instance_id, profile.clone());
        Ok(())
    }

    async fn delete_process_profile(&self, instance_id: Uuid) -> Result<(), RepositoryError> {
        self.lock().process_profiles.remove(&instance_id);
        Ok(())
    }

    async fn delete_health_snapshots(&self, instance_id: Uuid) -> Result<u64, RepositoryError> {
        Ok(self.lock().health_snapshots.remove(&instance_id).unwrap_or(0))
    }

    async fn record_state_transition(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        self.lock().transitions.push(StateTransition {
            instance_id,
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}
