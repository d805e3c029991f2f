//! Lifecycle orchestrator: provision / update / restart / reload / destroy / status / resize.
//!
//! Public methods never return `Err`. Every failure is folded into the method's result struct
//! so callers can use them without a generic error handler.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use botfleet_common::config_gen::{self, GenerateOptions, GeneratedConfig, Manifest};
use botfleet_common::target_config;
use botfleet_common::{
    GatewayConnection, GatewayConnectionStatus, Instance, InstanceStatus, ProcessProfile,
    ResourceSpec,
};
use botfleet_providers::registry::{
    fallback_resource_update_steps, STEP_HEALTH_CHECK, STEP_SECURITY_AUDIT, STEP_VALIDATE_CONFIG,
    STEP_WAIT_FOR_GATEWAY, STEP_WRITE_CONFIG,
};
use botfleet_providers::{
    AdapterRegistry, ConfigureOptions, DeploymentTarget, InstallOptions, Operation, TargetFactory,
    TargetLogLine, TargetLogStream, TargetState, TargetStatus,
};

use crate::error::LifecycleError;
use crate::gateway::{ConfigApplyRequest, GatewayPool, GatewayRpc, GatewayTarget};
use crate::locks::InstanceLocks;
use crate::progress::{timeout_message, ProvisioningTracker};
use crate::repository::Repository;
use crate::state_machine::{self, RunningFacts};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMethod {
    /// Nothing pushed: the local or the remote hash already matched.
    None,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub success: bool,
    pub message: String,
    /// `None` when the update failed.
    pub method: Option<UpdateMethod>,
    pub config_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResizeResult {
    pub success: bool,
    pub message: String,
    pub requires_restart: bool,
    pub estimated_downtime_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayProbe {
    pub connected: bool,
    pub health: GatewayHealth,
    pub uptime: Option<f64>,
    pub config_hash: Option<String>,
    pub error: Option<String>,
}

impl GatewayProbe {
    fn unreachable(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            health: GatewayHealth::Unknown,
            uptime: None,
            config_hash: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatusReport {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub infra: TargetStatus,
    pub gateway: GatewayProbe,
}

async fn next_log(logs: &mut Option<TargetLogStream>) -> Option<TargetLogLine> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct LifecycleOrchestrator {
    repo: Arc<dyn Repository>,
    registry: Arc<AdapterRegistry>,
    factory: Arc<dyn TargetFactory>,
    tracker: ProvisioningTracker,
    gateways: Arc<GatewayPool>,
    locks: InstanceLocks,
    // Live adapters by instance, so stateful targets (local child process) survive between calls.
    targets: Mutex<HashMap<Uuid, Arc<dyn DeploymentTarget>>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AdapterRegistry>,
        factory: Arc<dyn TargetFactory>,
        tracker: ProvisioningTracker,
        gateways: Arc<GatewayPool>,
    ) -> Self {
        Self {
            repo,
            registry,
            factory,
            tracker,
            gateways,
            locks: InstanceLocks::new(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &ProvisioningTracker {
        &self.tracker
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    fn cached_target(&self, instance_id: Uuid) -> Option<Arc<dyn DeploymentTarget>> {
        self.targets
            .lock()
            .ok()
            .and_then(|t| t.get(&instance_id).cloned())
    }

    fn forget_target(&self, instance_id: Uuid) {
        if let Ok(mut t) = self.targets.lock() {
            t.remove(&instance_id);
        }
    }

    /// Resolve the instance's target config and build (or reuse) its adapter.
    async fn target_for(&self, instance: &Instance) -> Result<Arc<dyn DeploymentTarget>, LifecycleError> {
        if let Some(t) = self.cached_target(instance.id) {
            return Ok(t);
        }
        let record = match instance.deployment_target_id {
            Some(target_id) => {
                let record = self.repo.get_deployment_target(target_id).await?;
                if record.is_none() {
                    tracing::warn!(
                        instance_id = %instance.id,
                        deployment_target_id = %target_id,
                        "[lifecycle] referenced deployment target not found; falling back to instance metadata"
                    );
                }
                record
            }
            None => None,
        };
        let config = target_config::resolve(instance, record.as_ref())?;
        let target = self
            .factory
            .create(instance, &config)
            .map_err(|e| LifecycleError::Target(format!("{:#}", e)))?;
        if let Ok(mut t) = self.targets.lock() {
            t.insert(instance.id, target.clone());
        }
        Ok(target)
    }

    async fn stored_gateway_connection(&self, instance_id: Uuid) -> Option<GatewayConnection> {
        match self.repo.get_gateway_connection(instance_id).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, error = %e, "[lifecycle] failed to load gateway connection");
                None
            }
        }
    }

    fn generate(&self, manifest: &Manifest, existing_token: Option<String>) -> Result<GeneratedConfig, LifecycleError> {
        Ok(config_gen::generate(
            manifest,
            &GenerateOptions {
                existing_gateway_token: existing_token,
            },
        )?)
    }

    /// Await an adapter call while forwarding its log lines into the tracker.
    async fn drive<T, F>(
        &self,
        instance_id: Uuid,
        logs: &mut Option<TargetLogStream>,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, LifecycleError>>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                Some(line) = next_log(logs) => {
                    self.tracker.append_log(instance_id, None, line.stream, &line.line);
                }
                r = &mut fut => {
                    if let Some(rx) = logs.as_mut() {
                        while let Ok(line) = rx.try_recv() {
                            self.tracker.append_log(instance_id, None, line.stream, &line.line);
                        }
                    }
                    return r;
                }
            }
        }
    }

    /// Bound a tracked operation by the tracker's timeout so the lease is released
    /// once the record has gone to `timeout`.
    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, LifecycleError>>,
    {
        let limit = self.tracker.config().operation_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(LifecycleError::Timeout(timeout_message(limit))),
        }
    }

    /// Failure policy for step-tracked operations.
    async fn fail_tracked(&self, instance_id: Uuid, err: &LifecycleError) -> String {
        let message = err.to_string();
        let timed_out = matches!(err, LifecycleError::Timeout(_));
        if !timed_out {
            self.tracker.fail_current_step(instance_id, &message);
        }
        if let Err(e) = state_machine::mark_error(self.repo.as_ref(), instance_id, &message).await {
            tracing::warn!(instance_id = %instance_id, error = %e, "[lifecycle] failed to persist error state");
        }
        if timed_out {
            // No-op when the tracker's own timer already fired.
            self.tracker.time_out(instance_id);
        } else {
            self.tracker.fail_operation(instance_id, &message);
        }
        tracing::error!(instance_id = %instance_id, "[lifecycle] operation failed: {}", message);
        message
    }

    // -------------------------------------------------------------------------
    // provision
    // -------------------------------------------------------------------------

    pub async fn provision(&self, instance: &Instance, manifest: &Manifest) -> OperationResult {
        let lease = self.locks.acquire(instance.id).await;
        let steps = self.registry.provisioning_steps(instance.deployment_type);
        self.tracker.start_operation(instance.id, &steps);
        tracing::info!(
            instance_id = %instance.id,
            deployment_type = %instance.deployment_type,
            "[lifecycle] provision started"
        );

        let run = self.run_provision(instance, manifest, lease.token());
        match self.with_deadline(run).await {
            Ok(message) => {
                self.tracker.complete_operation(instance.id);
                tracing::info!(instance_id = %instance.id, "[lifecycle] provision completed");
                OperationResult::ok(message)
            }
            Err(e) => OperationResult::failed(self.fail_tracked(instance.id, &e).await),
        }
    }

    async fn run_provision(
        &self,
        instance: &Instance,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<String, LifecycleError> {
        let id = instance.id;
        let deployment_type = instance.deployment_type;

        self.tracker.start_step(id, STEP_VALIDATE_CONFIG, None);
        let existing_token = self
            .stored_gateway_connection(id)
            .await
            .and_then(|c| c.auth_token);
        let generated = self.generate(manifest, existing_token)?;
        self.tracker.complete_step(
            id,
            STEP_VALIDATE_CONFIG,
            Some(format!("config hash {}", &generated.hash[..12])),
        );

        // Placeholder stage: the secure-default pass already ran inside generation.
        self.tracker.start_step(id, STEP_SECURITY_AUDIT, None);
        self.tracker.complete_step(
            id,
            STEP_SECURITY_AUDIT,
            Some(format!("{} secure default(s) applied", generated.applied_defaults.len())),
        );

        let target = self.target_for(instance).await?;
        let mut logs = target.subscribe_logs();

        let install_step = self
            .registry
            .operation_step_id(deployment_type, Operation::Install)
            .to_string();
        self.tracker.start_step(id, &install_step, None);
        let install_opts = InstallOptions {
            profile_name: instance.effective_profile_name(),
            version: instance.version.clone(),
            env: instance.metadata.container_env.clone(),
        };
        let installed = self
            .drive(id, &mut logs, cancel, async {
                target
                    .install(&install_opts)
                    .await
                    .map_err(|e| LifecycleError::Install(format!("{:#}", e)))
            })
            .await?;
        if !installed.success {
            return Err(LifecycleError::Install(installed.message));
        }
        self.tracker.complete_step(id, &install_step, Some(installed.message));

        self.tracker.start_step(id, STEP_WRITE_CONFIG, None);
        let endpoint = target
            .get_endpoint()
            .await
            .map_err(|e| LifecycleError::Target(format!("{:#}", e)))?;
        let configure_opts = ConfigureOptions {
            raw_config: generated.raw(),
            config_hash: generated.hash.clone(),
            gateway_port: endpoint.port,
        };
        let configured = self
            .drive(id, &mut logs, cancel, async {
                target
                    .configure(&configure_opts)
                    .await
                    .map_err(|e| LifecycleError::Configure(format!("{:#}", e)))
            })
            .await?;
        if !configured.success {
            return Err(LifecycleError::Configure(configured.message));
        }
        self.tracker.complete_step(id, STEP_WRITE_CONFIG, Some(configured.message));

        let start_step = self
            .registry
            .operation_step_id(deployment_type, Operation::Start)
            .to_string();
        self.tracker.start_step(id, &start_step, None);
        self.drive(id, &mut logs, cancel, async {
            target
                .start()
                .await
                .map_err(|e| LifecycleError::Start(format!("{:#}", e)))
        })
        .await?;
        self.tracker.complete_step(id, &start_step, None);

        self.tracker.start_step(id, STEP_WAIT_FOR_GATEWAY, None);
        let token = generated.gateway_token().map(str::to_string);
        let gw_target = GatewayTarget {
            host: endpoint.host.clone(),
            port: endpoint.port,
            token: token.clone(),
        };
        // A pooled client from an earlier run may carry a stale token.
        self.gateways.remove(id);
        let client = self
            .drive(id, &mut logs, cancel, self.gateways.get_or_connect(id, &gw_target, cancel))
            .await?;
        self.tracker.complete_step(
            id,
            STEP_WAIT_FOR_GATEWAY,
            Some(format!("connected to {}:{}", endpoint.host, endpoint.port)),
        );

        self.tracker.start_step(id, STEP_HEALTH_CHECK, None);
        let healthy = match client.health().await {
            Ok(h) => h.ok,
            Err(e) => {
                tracing::warn!(instance_id = %id, error = %e, "[lifecycle] health check failed after connect");
                false
            }
        };
        self.tracker.complete_step(
            id,
            STEP_HEALTH_CHECK,
            Some(if healthy { "healthy" } else { "degraded" }.to_string()),
        );

        state_machine::mark_running(
            self.repo.as_ref(),
            id,
            RunningFacts {
                healthy,
                config_hash: generated.hash.clone(),
                gateway_port: endpoint.port,
            },
            "provision",
        )
        .await?;

        let now = Utc::now();
        self.repo
            .upsert_gateway_connection(&GatewayConnection {
                instance_id: id,
                host: endpoint.host.clone(),
                port: endpoint.port,
                auth_token: token,
                config_hash: Some(generated.hash.clone()),
                status: GatewayConnectionStatus::Connected,
                last_heartbeat: Some(now),
            })
            .await?;
        self.repo
            .upsert_process_profile(&ProcessProfile {
                instance_id: id,
                name: instance.effective_profile_name(),
                port: endpoint.port,
                updated_at: now,
            })
            .await?;

        Ok(format!("Instance {} provisioned", instance.name))
    }

    // -------------------------------------------------------------------------
    // update
    // -------------------------------------------------------------------------

    pub async fn update(&self, instance: &Instance, manifest: &Manifest) -> UpdateResult {
        let lease = self.locks.acquire(instance.id).await;
        match self.run_update(instance, manifest, lease.token()).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(instance_id = %instance.id, "[lifecycle] update failed: {}", message);
                UpdateResult {
                    success: false,
                    message,
                    method: None,
                    config_hash: None,
                }
            }
        }
    }

    async fn run_update(
        &self,
        instance: &Instance,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<UpdateResult, LifecycleError> {
        let id = instance.id;
        let current = self
            .repo
            .get_instance(id)
            .await?
            .ok_or_else(|| LifecycleError::instance_not_found(id))?;
        let stored = self.stored_gateway_connection(id).await;
        let generated = self.generate(manifest, stored.as_ref().and_then(|c| c.auth_token.clone()))?;

        // Drift check: identical hash means nothing to do, and no network traffic.
        if current.config_hash.as_deref() == Some(generated.hash.as_str()) {
            tracing::debug!(instance_id = %id, "[lifecycle] config unchanged; skipping update");
            return Ok(UpdateResult {
                success: true,
                message: "Config unchanged".to_string(),
                method: Some(UpdateMethod::None),
                config_hash: Some(generated.hash),
            });
        }

        let target = self.target_for(&current).await?;
        let gw_target = match &stored {
            Some(c) => GatewayTarget {
                host: c.host.clone(),
                port: c.port,
                token: c.auth_token.clone().or_else(|| generated.gateway_token().map(str::to_string)),
            },
            None => {
                let endpoint = target
                    .get_endpoint()
                    .await
                    .map_err(|e| LifecycleError::Target(format!("{:#}", e)))?;
                GatewayTarget {
                    host: endpoint.host,
                    port: endpoint.port,
                    token: generated.gateway_token().map(str::to_string),
                }
            }
        };
        let client = self.gateways.get_or_connect(id, &gw_target, cancel).await?;

        let remote = client
            .config_get()
            .await
            .map_err(|e| LifecycleError::Gateway(e.to_string()))?;
        if remote.hash.as_deref() == Some(generated.hash.as_str()) {
            // Remote already runs the desired config: heal the local record, push nothing.
            state_machine::record_confirmed_hash(self.repo.as_ref(), id, &generated.hash).await?;
            self.refresh_connection(stored, &gw_target, id, &generated).await;
            tracing::info!(instance_id = %id, "[lifecycle] remote config already current; local hash healed");
            return Ok(UpdateResult {
                success: true,
                message: "Remote config already current".to_string(),
                method: Some(UpdateMethod::None),
                config_hash: Some(generated.hash),
            });
        }

        let response = client
            .config_apply(&ConfigApplyRequest {
                raw: generated.raw(),
                base_hash: remote.hash.clone(),
            })
            .await
            .map_err(|e| LifecycleError::Gateway(e.to_string()))?;
        if !response.applied() {
            return Err(LifecycleError::ConfigApplyRejected(response.rejection_message()));
        }

        // The gateway holds the new config in memory; the durable copy is best-effort.
        let configure_opts = ConfigureOptions {
            raw_config: generated.raw(),
            config_hash: generated.hash.clone(),
            gateway_port: gw_target.port,
        };
        match target.configure(&configure_opts).await {
            Ok(r) if r.success => {}
            Ok(r) => tracing::warn!(instance_id = %id, "[lifecycle] durable config write failed: {}", r.message),
            Err(e) => tracing::warn!(instance_id = %id, "[lifecycle] durable config write failed: {:#}", e),
        }

        if let Err(e) = state_machine::record_confirmed_hash(self.repo.as_ref(), id, &generated.hash).await {
            tracing::warn!(instance_id = %id, error = %e, "[lifecycle] failed to persist applied hash");
        }
        self.refresh_connection(stored, &gw_target, id, &generated).await;

        tracing::info!(instance_id = %id, hash = %generated.hash, "[lifecycle] config applied");
        Ok(UpdateResult {
            success: true,
            message: "Config applied".to_string(),
            method: Some(UpdateMethod::Apply),
            config_hash: Some(generated.hash),
        })
    }

    /// Record the config now running on the gateway. The token it carries becomes the
    /// stored credential; a pooled client still holding the old token is dropped.
    async fn refresh_connection(
        &self,
        stored: Option<GatewayConnection>,
        gw_target: &GatewayTarget,
        instance_id: Uuid,
        generated: &GeneratedConfig,
    ) {
        let mut conn = stored.unwrap_or_else(|| GatewayConnection {
            instance_id,
            host: gw_target.host.clone(),
            port: gw_target.port,
            auth_token: gw_target.token.clone(),
            config_hash: None,
            status: GatewayConnectionStatus::Connected,
            last_heartbeat: None,
        });
        let running_token = generated.gateway_token().map(str::to_string);
        if running_token != gw_target.token {
            tracing::info!(instance_id = %instance_id, "[lifecycle] gateway token changed; reconnecting on next call");
            self.gateways.remove(instance_id);
        }
        conn.auth_token = running_token;
        conn.config_hash = Some(generated.hash.clone());
        conn.status = GatewayConnectionStatus::Connected;
        conn.last_heartbeat = Some(Utc::now());
        if let Err(e) = self.repo.upsert_gateway_connection(&conn).await {
            tracing::warn!(instance_id = %instance_id, error = %e, "[lifecycle] failed to refresh gateway connection");
        }
    }

    // -------------------------------------------------------------------------
    // restart / hybrid reload
    // -------------------------------------------------------------------------

    pub async fn restart(&self, instance: &Instance) -> OperationResult {
        let lease = self.locks.acquire(instance.id).await;
        let result: Result<(), LifecycleError> = async {
            let target = self.target_for(instance).await?;
            self.drive(instance.id, &mut None, lease.token(), async {
                target
                    .restart()
                    .await
                    .map_err(|e| LifecycleError::Target(format!("Restart failed: {:#}", e)))
            })
            .await?;
            state_machine::mark_restarted(self.repo.as_ref(), instance.id).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(instance_id = %instance.id, "[lifecycle] restarted");
                OperationResult::ok(format!("Instance {} restarted", instance.name))
            }
            Err(e) => {
                tracing::warn!(instance_id = %instance.id, "[lifecycle] restart failed: {}", e);
                OperationResult::failed(e.to_string())
            }
        }
    }

    /// Signal the gateway to reread its config without respawning. A failure here is
    /// expected to be followed by a full `update` from the caller.
    pub async fn hybrid_reload(&self, instance: &Instance) -> OperationResult {
        let lease = self.locks.acquire(instance.id).await;
        let result: Result<(), LifecycleError> = async {
            let target = self.target_for(instance).await?;
            self.drive(instance.id, &mut None, lease.token(), async {
                target
                    .restart()
                    .await
                    .map_err(|e| LifecycleError::Target(format!("{:#}", e)))
            })
            .await
        }
        .await;

        match result {
            Ok(()) => OperationResult::ok("Reload signal sent"),
            Err(e) => {
                tracing::warn!(instance_id = %instance.id, "[lifecycle] hybrid reload failed: {}", e);
                OperationResult::failed(format!("Reload failed: {}", e))
            }
        }
    }

    // -------------------------------------------------------------------------
    // destroy
    // -------------------------------------------------------------------------

    pub async fn destroy(&self, instance: &Instance) -> OperationResult {
        let id = instance.id;
        if self.locks.cancel_active(id) {
            tracing::info!(instance_id = %id, "[lifecycle] cancelling in-flight operation before destroy");
        }
        let _lease = self.locks.acquire(id).await;

        self.gateways.remove(id);
        match self.target_for(instance).await {
            Ok(target) => {
                if let Err(e) = target.destroy().await {
                    tracing::warn!(instance_id = %id, "[lifecycle] target destroy failed (continuing): {:#}", e);
                }
            }
            Err(e) => {
                tracing::warn!(instance_id = %id, "[lifecycle] no target to tear down (continuing): {}", e);
            }
        }
        if let Err(e) = self.repo.delete_gateway_connection(id).await {
            tracing::warn!(instance_id = %id, error = %e, "[lifecycle] failed to delete gateway connection");
        }
        if let Err(e) = self.repo.delete_process_profile(id).await {
            tracing::warn!(instance_id = %id, error = %e, "[lifecycle] failed to delete process profile");
        }
        match self.repo.delete_health_snapshots(id).await {
            Ok(n) => tracing::debug!(instance_id = %id, rows = n, "[lifecycle] health snapshots deleted"),
            Err(e) => tracing::warn!(instance_id = %id, error = %e, "[lifecycle] failed to delete health snapshots"),
        }
        self.forget_target(id);

        match state_machine::mark_deleting(self.repo.as_ref(), id).await {
            Ok(_) => OperationResult::ok(format!("Instance {} destroyed", instance.name)),
            Err(e) => OperationResult::failed(LifecycleError::from(e).to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // status
    // -------------------------------------------------------------------------

    /// Two independent probes; each one degrades on its own. Takes no lease.
    pub async fn get_status(&self, instance: &Instance) -> InstanceStatusReport {
        let id = instance.id;
        let target = self.target_for(instance).await;

        let infra = match &target {
            Ok(t) => match t.get_status().await {
                Ok(s) => s,
                Err(e) => TargetStatus::with_detail(TargetState::Error, format!("{:#}", e)),
            },
            Err(e) => TargetStatus::with_detail(TargetState::Error, e.to_string()),
        };

        let gateway = match self.probe_client(instance, target.as_ref().ok()).await {
            Ok(client) => self.probe_gateway(client.as_ref()).await,
            Err(e) => GatewayProbe::unreachable(e),
        };

        InstanceStatusReport {
            instance_id: id,
            status: instance.status,
            infra,
            gateway,
        }
    }

    async fn probe_client(
        &self,
        instance: &Instance,
        target: Option<&Arc<dyn DeploymentTarget>>,
    ) -> Result<Arc<dyn GatewayRpc>, String> {
        if let Some(client) = self.gateways.get(instance.id) {
            return Ok(client);
        }
        let gw_target = match self.stored_gateway_connection(instance.id).await {
            Some(c) => GatewayTarget {
                host: c.host,
                port: c.port,
                token: c.auth_token,
            },
            None => {
                let Some(target) = target else {
                    return Err("no gateway endpoint known".to_string());
                };
                let endpoint = target.get_endpoint().await.map_err(|e| format!("{:#}", e))?;
                GatewayTarget {
                    host: endpoint.host,
                    port: endpoint.port,
                    token: None,
                }
            }
        };
        self.gateways
            .connect_once(&gw_target)
            .await
            .map_err(|e| e.to_string())
    }

    async fn probe_gateway(&self, client: &dyn GatewayRpc) -> GatewayProbe {
        let health = match client.health().await {
            Ok(h) => h,
            Err(e) => return GatewayProbe::unreachable(e.to_string()),
        };
        let (config_hash, error) = match client.status().await {
            Ok(s) => (s.config_hash, None),
            Err(e) => (None, Some(e.to_string())),
        };
        GatewayProbe {
            connected: true,
            health: if health.ok {
                GatewayHealth::Healthy
            } else {
                GatewayHealth::Unhealthy
            },
            uptime: health.uptime,
            config_hash,
            error,
        }
    }

    // -------------------------------------------------------------------------
    // resize
    // -------------------------------------------------------------------------

    pub async fn update_resources(&self, instance: &Instance, spec: &ResourceSpec) -> ResizeResult {
        let id = instance.id;
        let lease = self.locks.acquire(id).await;

        let target = match self.target_for(instance).await {
            Ok(t) => t,
            Err(e) => {
                return ResizeResult {
                    success: false,
                    message: e.to_string(),
                    requires_restart: false,
                    estimated_downtime_secs: None,
                }
            }
        };
        if !target.supports_resource_updates() {
            let message = LifecycleError::UnsupportedOperation(format!(
                "{} target does not support resource updates",
                instance.deployment_type
            ))
            .to_string();
            tracing::info!(instance_id = %id, "[lifecycle] {}", message);
            return ResizeResult {
                success: false,
                message,
                requires_restart: false,
                estimated_downtime_secs: None,
            };
        }

        let mut steps = self.registry.resource_update_steps(instance.deployment_type);
        if steps.len() < 3 {
            steps = fallback_resource_update_steps();
        }
        self.tracker.start_operation(id, &steps);
        tracing::info!(instance_id = %id, ?spec, "[lifecycle] resize started");

        let run = self.run_resize(id, target, spec, &steps, lease.token());
        match self.with_deadline(run).await {
            Ok(result) => {
                self.tracker.complete_operation(id);
                result
            }
            Err(e) => ResizeResult {
                success: false,
                message: self.fail_tracked(id, &e).await,
                requires_restart: false,
                estimated_downtime_secs: None,
            },
        }
    }

    async fn run_resize(
        &self,
        id: Uuid,
        target: Arc<dyn DeploymentTarget>,
        spec: &ResourceSpec,
        steps: &[botfleet_common::progress::StepDescriptor],
        cancel: &CancellationToken,
    ) -> Result<ResizeResult, LifecycleError> {
        // First step validates, last verifies, everything between is the apply phase.
        let validate = &steps[0].id;
        let verify = &steps[steps.len() - 1].id;
        let apply = &steps[1..steps.len() - 1];

        self.tracker.start_step(id, validate, None);
        spec.validate().map_err(LifecycleError::InvalidConfig)?;
        self.tracker.complete_step(id, validate, None);

        let mut logs = target.subscribe_logs();
        self.tracker.start_step(id, &apply[0].id, None);
        let result = self
            .drive(id, &mut logs, cancel, async {
                target
                    .update_resources(spec)
                    .await
                    .map_err(|e| LifecycleError::Target(format!("{:#}", e)))
            })
            .await?;
        if !result.success {
            return Err(LifecycleError::Target(result.message));
        }
        for step in apply {
            self.tracker.complete_step(id, &step.id, Some(result.message.clone()));
        }

        self.tracker.start_step(id, verify, None);
        let status = self
            .drive(id, &mut logs, cancel, async {
                target
                    .get_status()
                    .await
                    .map_err(|e| LifecycleError::Target(format!("{:#}", e)))
            })
            .await?;
        if matches!(status.state, TargetState::Error | TargetState::NotFound) {
            return Err(LifecycleError::Target(format!(
                "target reported {} after resize",
                status.state.as_str()
            )));
        }
        self.tracker
            .complete_step(id, verify, Some(status.state.as_str().to_string()));

        Ok(ResizeResult {
            success: true,
            message: result.message,
            requires_restart: result.requires_restart,
            estimated_downtime_secs: result.estimated_downtime_secs,
        })
    }
}
