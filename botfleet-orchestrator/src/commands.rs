//! Redis command listener (`botfleet_commands`) and dispatch onto the orchestrator.

use anyhow::{anyhow, Context};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;

use botfleet_common::bus::{CommandType, LifecycleCommand, CHANNEL_ORCHESTRATOR_COMMANDS};
use botfleet_common::config_gen::Manifest;

use crate::lifecycle::{LifecycleOrchestrator, OperationResult, ResizeResult, UpdateResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutcome {
    Operation(OperationResult),
    Update(UpdateResult),
    Resize(ResizeResult),
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        match self {
            CommandOutcome::Operation(r) => r.success,
            CommandOutcome::Update(r) => r.success,
            CommandOutcome::Resize(r) => r.success,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CommandOutcome::Operation(r) => &r.message,
            CommandOutcome::Update(r) => &r.message,
            CommandOutcome::Resize(r) => &r.message,
        }
    }
}

fn require_manifest(cmd: &LifecycleCommand) -> anyhow::Result<&Manifest> {
    cmd.manifest
        .as_ref()
        .ok_or_else(|| anyhow!("{} requires a manifest", cmd.command_type.as_str()))
}

/// Run one command to completion. `Err` only for malformed commands or unknown instances.
pub async fn dispatch(
    orchestrator: &LifecycleOrchestrator,
    cmd: &LifecycleCommand,
) -> anyhow::Result<CommandOutcome> {
    let instance = orchestrator
        .repository()
        .get_instance(cmd.instance_id)
        .await
        .context("failed to load instance")?
        .ok_or_else(|| anyhow!("instance {} not found", cmd.instance_id))?;

    let outcome = match cmd.command_type {
        CommandType::Provision => {
            let manifest = require_manifest(cmd)?;
            CommandOutcome::Operation(orchestrator.provision(&instance, manifest).await)
        }
        CommandType::Update => {
            let manifest = require_manifest(cmd)?;
            CommandOutcome::Update(orchestrator.update(&instance, manifest).await)
        }
        CommandType::Restart => CommandOutcome::Operation(orchestrator.restart(&instance).await),
        CommandType::Reload => {
            let reloaded = orchestrator.hybrid_reload(&instance).await;
            match cmd.manifest.as_ref() {
                Some(manifest) if !reloaded.success => {
                    tracing::info!(
                        instance_id = %instance.id,
                        "[commands] reload failed, falling back to update: {}",
                        reloaded.message
                    );
                    CommandOutcome::Update(orchestrator.update(&instance, manifest).await)
                }
                _ => CommandOutcome::Operation(reloaded),
            }
        }
        CommandType::Destroy => CommandOutcome::Operation(orchestrator.destroy(&instance).await),
        CommandType::Resize => {
            let spec = cmd
                .resources
                .as_ref()
                .ok_or_else(|| anyhow!("CMD:RESIZE requires resources"))?;
            CommandOutcome::Resize(orchestrator.update_resources(&instance, spec).await)
        }
    };
    Ok(outcome)
}

/// Subscribe to the command channel and spawn one task per command.
/// Returns when the subscription stream ends.
pub async fn run_listener(
    redis_client: redis::Client,
    orchestrator: Arc<LifecycleOrchestrator>,
) -> anyhow::Result<()> {
    let mut pubsub = redis_client
        .get_async_pubsub()
        .await
        .context("Failed to open Redis pubsub connection")?;
    pubsub
        .subscribe(CHANNEL_ORCHESTRATOR_COMMANDS)
        .await
        .context("Failed to subscribe to command channel")?;
    tracing::info!(
        channel = CHANNEL_ORCHESTRATOR_COMMANDS,
        "[commands] listening for lifecycle commands"
    );

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "[commands] unreadable payload");
                continue;
            }
        };
        let cmd: LifecycleCommand = match serde_json::from_str(&payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "[commands] ignoring malformed command: {}", payload);
                continue;
            }
        };

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            tracing::info!(
                instance_id = %cmd.instance_id,
                command = cmd.command_type.as_str(),
                correlation_id = cmd.correlation_id.as_deref().unwrap_or(""),
                "[commands] received"
            );
            match dispatch(&orchestrator, &cmd).await {
                Ok(outcome) if outcome.success() => tracing::info!(
                    instance_id = %cmd.instance_id,
                    command = cmd.command_type.as_str(),
                    "[commands] done: {}",
                    outcome.message()
                ),
                Ok(outcome) => tracing::warn!(
                    instance_id = %cmd.instance_id,
                    command = cmd.command_type.as_str(),
                    "[commands] failed: {}",
                    outcome.message()
                ),
                Err(e) => tracing::error!(
                    instance_id = %cmd.instance_id,
                    command = cmd.command_type.as_str(),
                    "[commands] rejected: {:#}",
                    e
                ),
            }
        });
    }

    tracing::warn!("[commands] command stream ended");
    Ok(())
}
