use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use botfleet_common::{
    DeploymentTargetRecord, DeploymentType, GatewayConnection, GatewayConnectionStatus,
    HealthStatus, Instance, InstanceMetadata, InstancePatch, InstanceStatus, ProcessProfile,
};

use super::Repository;
use crate::error::RepositoryError;

const INSTANCE_COLUMNS: &str = r#"
    id, name, status, health, deployment_type, deployment_target_id,
    config_hash, gateway_port, profile_name, version,
    restart_count, error_count, last_error,
    running_since, last_reconcile_at, last_health_check_at,
    metadata, created_at, updated_at
"#;

pub struct PgRepository {
    db: Pool<Postgres>,
}

impl PgRepository {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }
}

fn port_from_db(port: Option<i32>) -> Option<u16> {
    port.and_then(|p| u16::try_from(p).ok())
}

/// Metadata is validated here, once, when the row is loaded.
fn instance_from_row(row: &PgRow) -> Result<Instance, RepositoryError> {
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let metadata = InstanceMetadata::from_value(metadata.unwrap_or(serde_json::Value::Null))?;
    Ok(Instance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get::<InstanceStatus, _>("status")?,
        health: row.try_get::<HealthStatus, _>("health")?,
        deployment_type: row.try_get::<DeploymentType, _>("deployment_type")?,
        deployment_target_id: row.try_get("deployment_target_id")?,
        config_hash: row.try_get("config_hash")?,
        gateway_port: port_from_db(row.try_get("gateway_port")?),
        profile_name: row.try_get("profile_name")?,
        version: row.try_get("version")?,
        restart_count: row.try_get("restart_count")?,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
        running_since: row.try_get("running_since")?,
        last_reconcile_at: row.try_get("last_reconcile_at")?,
        last_health_check_at: row.try_get("last_health_check_at")?,
        metadata,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError> {
        let sql = format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, RepositoryError> {
        let sql = format!("SELECT {} FROM instances ORDER BY created_at", INSTANCE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.db).await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<Instance, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE instances
            SET status = COALESCE($2, status),
                health = COALESCE($3, health),
                config_hash = COALESCE($4, config_hash),
                gateway_port = COALESCE($5, gateway_port),
                restart_count = COALESCE($6, restart_count),
                error_count = COALESCE($7, error_count),
                last_error = CASE WHEN $8 THEN $9 ELSE last_error END,
                running_since = COALESCE($10, running_since),
                last_reconcile_at = COALESCE($11, last_reconcile_at),
                last_health_check_at = COALESCE($12, last_health_check_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(patch.status)
            .bind(patch.health)
            .bind(patch.config_hash.as_deref())
            .bind(patch.gateway_port.map(i32::from))
            .bind(patch.restart_count)
            .bind(patch.error_count)
            .bind(patch.last_error.is_some())
            .bind(patch.last_error.clone().flatten())
            .bind(patch.running_since)
            .bind(patch.last_reconcile_at)
            .bind(patch.last_health_check_at)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(row) => instance_from_row(&row),
            None => Err(RepositoryError::NotFound(format!("instance {}", id))),
        }
    }

    async fn get_deployment_target(
        &self,
        id: Uuid,
    ) -> Result<Option<DeploymentTargetRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, deployment_type, config FROM deployment_targets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DeploymentTargetRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            deployment_type: row.try_get::<DeploymentType, _>("deployment_type")?,
            config: row.try_get("config")?,
        }))
    }

    async fn upsert_gateway_connection(&self, conn: &GatewayConnection) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO gateway_connections
                (instance_id, host, port, auth_token, config_hash, status, last_heartbeat, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (instance_id) DO UPDATE
            SET host = EXCLUDED.host,
                port = EXCLUDED.port,
                auth_token = COALESCE(EXCLUDED.auth_token, gateway_connections.auth_token),
                config_hash = COALESCE(EXCLUDED.config_hash, gateway_connections.config_hash),
                status = EXCLUDED.status,
                last_heartbeat = COALESCE(EXCLUDED.last_heartbeat, gateway_connections.last_heartbeat),
                updated_at = NOW()
            "#,
        )
        .bind(conn.instance_id)
        .bind(&conn.host)
        .bind(i32::from(conn.port))
        .bind(conn.auth_token.as_deref())
        .bind(conn.config_hash.as_deref())
        .bind(conn.status)
        .bind(conn.last_heartbeat)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_gateway_connection(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<GatewayConnection>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, host, port, auth_token, config_hash, status, last_heartbeat
            FROM gateway_connections
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let port: i32 = row.try_get("port")?;
        Ok(Some(GatewayConnection {
            instance_id: row.try_get("instance_id")?,
            host: row.try_get("host")?,
            port: u16::try_from(port)
                .map_err(|_| RepositoryError::Internal(format!("invalid gateway port {}", port)))?,
            auth_token: row.try_get("auth_token")?,
            config_hash: row.try_get("config_hash")?,
            status: row.try_get::<GatewayConnectionStatus, _>("status")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        }))
    }

    async fn delete_gateway_connection(&self, instance_id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM gateway_connections WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn upsert_process_profile(&self, profile: &ProcessProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO process_profiles (instance_id, name, port, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id) DO UPDATE
            SET name = EXCLUDED.name, port = EXCLUDED.port, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(profile.instance_id)
        .bind(&profile.name)
        .bind(i32::from(profile.port))
        .bind(profile.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_process_profile(&self, instance_id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM process_profiles WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_health_snapshots(&self, instance_id: Uuid) -> Result<u64, RepositoryError> {
        let res = sqlx::query("DELETE FROM health_snapshots WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }

    async fn record_state_transition(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO instance_state_history (instance_id, from_status, to_status, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(instance_id)
        .bind(from)
        .bind(to)
        .bind(reason)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
