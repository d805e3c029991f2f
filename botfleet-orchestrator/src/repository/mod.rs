use async_trait::async_trait;
use uuid::Uuid;

use botfleet_common::{
    DeploymentTargetRecord, GatewayConnection, Instance, InstancePatch, InstanceStatus,
    ProcessProfile,
};

use crate::error::RepositoryError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

/// Persistence used by the orchestrator. Everything is keyed by instance id.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError>;
    async fn list_instances(&self) -> Result<Vec<Instance>, RepositoryError>;

    /// Apply a partial update and return the updated row.
    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<Instance, RepositoryError>;

    async fn get_deployment_target(
        &self,
        id: Uuid,
    ) -> Result<Option<DeploymentTargetRecord>, RepositoryError>;

    async fn upsert_gateway_connection(&self, conn: &GatewayConnection) -> Result<(), RepositoryError>;
    async fn get_gateway_connection(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<GatewayConnection>, RepositoryError>;
    async fn delete_gateway_connection(&self, instance_id: Uuid) -> Result<(), RepositoryError>;

    async fn upsert_process_profile(&self, profile: &ProcessProfile) -> Result<(), RepositoryError>;
    async fn delete_process_profile(&self, instance_id: Uuid) -> Result<(), RepositoryError>;

    /// Returns the number of rows removed.
    async fn delete_health_snapshots(&self, instance_id: Uuid) -> Result<u64, RepositoryError>;

    async fn record_state_transition(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: &str,
    ) -> Result<(), RepositoryError>;
}
