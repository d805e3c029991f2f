//! Persisted instance status transitions.
//!
//! Every write of `status` goes through here so transitions are logged and recorded in
//! `instance_state_history` in one place.

use chrono::Utc;
use uuid::Uuid;

use botfleet_common::{HealthStatus, Instance, InstancePatch, InstanceStatus};

use crate::error::RepositoryError;
use crate::repository::Repository;

async fn log_state_transition(
    repo: &dyn Repository,
    instance_id: Uuid,
    from: InstanceStatus,
    to: InstanceStatus,
    reason: &str,
) {
    if from == to {
        return;
    }
    tracing::info!(
        instance_id = %instance_id,
        from = from.as_str(),
        to = to.as_str(),
        reason,
        "[state_machine] transition"
    );
    if let Err(e) = repo.record_state_transition(instance_id, from, to, reason).await {
        tracing::warn!(instance_id = %instance_id, error = %e, "[state_machine] failed to record transition");
    }
}

async fn transition(
    repo: &dyn Repository,
    instance_id: Uuid,
    patch: InstancePatch,
    reason: &str,
) -> Result<Instance, RepositoryError> {
    let from = repo
        .get_instance(instance_id)
        .await?
        .map(|i| i.status)
        .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", instance_id)))?;
    let updated = repo.update_instance(instance_id, &patch).await?;
    log_state_transition(repo, instance_id, from, updated.status, reason).await;
    Ok(updated)
}

#[derive(Debug, Clone)]
pub struct RunningFacts {
    pub healthy: bool,
    pub config_hash: String,
    pub gateway_port: u16,
}

/// Provision succeeded: gateway reachable and config applied.
pub async fn mark_running(
    repo: &dyn Repository,
    instance_id: Uuid,
    facts: RunningFacts,
    reason: &str,
) -> Result<Instance, RepositoryError> {
    let now = Utc::now();
    let patch = InstancePatch {
        status: Some(InstanceStatus::Running),
        health: Some(if facts.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }),
        config_hash: Some(facts.config_hash),
        gateway_port: Some(facts.gateway_port),
        error_count: Some(0),
        last_error: Some(None),
        running_since: Some(now),
        last_reconcile_at: Some(now),
        last_health_check_at: Some(now),
        ..Default::default()
    };
    transition(repo, instance_id, patch, reason).await
}

/// A lifecycle operation failed: store the message and bump the consecutive error count.
pub async fn mark_error(
    repo: &dyn Repository,
    instance_id: Uuid,
    message: &str,
) -> Result<Instance, RepositoryError> {
    let error_count = repo
        .get_instance(instance_id)
        .await?
        .map(|i| i.error_count)
        .unwrap_or(0);
    let patch = InstancePatch {
        status: Some(InstanceStatus::Error),
        error_count: Some(error_count.saturating_add(1)),
        last_error: Some(Some(message.to_string())),
        ..Default::default()
    };
    transition(repo, instance_id, patch, message).await
}

pub async fn mark_restarted(repo: &dyn Repository, instance_id: Uuid) -> Result<Instance, RepositoryError> {
    let restart_count = repo
        .get_instance(instance_id)
        .await?
        .map(|i| i.restart_count)
        .unwrap_or(0);
    let patch = InstancePatch {
        status: Some(InstanceStatus::Running),
        restart_count: Some(restart_count.saturating_add(1)),
        last_reconcile_at: Some(Utc::now()),
        ..Default::default()
    };
    transition(repo, instance_id, patch, "restart").await
}

pub async fn mark_deleting(repo: &dyn Repository, instance_id: Uuid) -> Result<Instance, RepositoryError> {
    let patch = InstancePatch {
        status: Some(InstanceStatus::Deleting),
        ..Default::default()
    };
    transition(repo, instance_id, patch, "destroy").await
}

/// Record a hash confirmed on the gateway (after apply, or a heal of a matching remote).
/// Never used for a desired-but-unconfirmed hash.
pub async fn record_confirmed_hash(
    repo: &dyn Repository,
    instance_id: Uuid,
    config_hash: &str,
) -> Result<Instance, RepositoryError> {
    let patch = InstancePatch {
        config_hash: Some(config_hash.to_string()),
        last_reconcile_at: Some(Utc::now()),
        ..Default::default()
    };
    repo.update_instance(instance_id, &patch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use botfleet_common::DeploymentType;

    #[tokio::test]
    async fn error_then_running_resets_counters_and_records_history() {
        let repo = MemoryRepository::new();
        let inst = Instance::new("a", DeploymentType::Local);
        let id = inst.id;
        repo.insert_instance(inst);

        mark_error(&repo, id, "Install failed: disk full").await.unwrap();
        let e = mark_error(&repo, id, "Start failed: port").await.unwrap();
        assert_eq!(e.status, InstanceStatus::Error);
        assert_eq!(e.error_count, 2);
        assert_eq!(e.last_error.as_deref(), Some("Start failed: port"));

        let r = mark_running(
            &repo,
            id,
            RunningFacts {
                healthy: false,
                config_hash: "h".into(),
                gateway_port: 18789,
            },
            "provision",
        )
        .await
        .unwrap();
        assert_eq!(r.status, InstanceStatus::Running);
        assert_eq!(r.health, HealthStatus::Degraded);
        assert_eq!(r.error_count, 0);
        assert_eq!(r.last_error, None);

        let history = repo.transitions();
        assert_eq!(history.len(), 2, "ERROR -> ERROR is not a transition");
        assert_eq!(history[0].to, InstanceStatus::Error);
        assert_eq!(history[1].from, InstanceStatus::Error);
        assert_eq!(history[1].to, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let repo = MemoryRepository::new();
        let err = mark_deleting(&repo, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
