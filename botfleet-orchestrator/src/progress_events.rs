use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use botfleet_common::bus::{
    ProvisioningEventEnvelope, ProvisioningEventType, CHANNEL_PROVISIONING_EVENTS,
};
use botfleet_common::progress::{ProvisioningLogEntry, ProvisioningProgress};

const EVENT_SOURCE: &str = "orchestrator";

/// Push side of provisioning progress. Called synchronously from the tracker, so
/// implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit_progress(&self, progress: &ProvisioningProgress);
    fn emit_log(&self, entry: &ProvisioningLogEntry);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit_progress(&self, _progress: &ProvisioningProgress) {}
    fn emit_log(&self, _entry: &ProvisioningLogEntry) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningEvent {
    Progress(ProvisioningProgress),
    Log(ProvisioningLogEntry),
}

impl ProvisioningEvent {
    pub fn instance_id(&self) -> uuid::Uuid {
        match self {
            ProvisioningEvent::Progress(p) => p.instance_id,
            ProvisioningEvent::Log(l) => l.instance_id,
        }
    }
}

/// In-process fan-out for any number of listeners (admin surface, tests).
pub struct BroadcastProgressSink {
    tx: broadcast::Sender<ProvisioningEvent>,
}

impl BroadcastProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn emit_progress(&self, progress: &ProvisioningProgress) {
        let _ = self.tx.send(ProvisioningEvent::Progress(progress.clone()));
    }

    fn emit_log(&self, entry: &ProvisioningLogEntry) {
        let _ = self.tx.send(ProvisioningEvent::Log(entry.clone()));
    }
}

/// Publishes progress/log events on the Redis provisioning channel.
/// Events are queued and published in order by one background task.
pub struct RedisProgressSink {
    queue: mpsc::UnboundedSender<ProvisioningEventEnvelope>,
}

impl RedisProgressSink {
    pub fn spawn(redis_client: redis::Client) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<ProvisioningEventEnvelope>();
        tokio::spawn(async move {
            let mut conn: Option<redis::aio::MultiplexedConnection> = None;
            while let Some(evt) = rx.recv().await {
                if conn.is_none() {
                    match redis_client.get_multiplexed_async_connection().await {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            tracing::warn!(error = %e, "[progress_events] redis unavailable; event dropped");
                            continue;
                        }
                    }
                }
                let Some(c) = conn.as_mut() else { continue };
                let payload = match serde_json::to_string(&evt) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "[progress_events] failed to encode event");
                        continue;
                    }
                };
                let res: redis::RedisResult<()> = c.publish(CHANNEL_PROVISIONING_EVENTS, payload).await;
                if let Err(e) = res {
                    tracing::warn!(error = %e, "[progress_events] publish failed; reconnecting");
                    conn = None;
                }
            }
        });
        Self { queue }
    }

    fn enqueue(&self, evt: ProvisioningEventEnvelope) {
        let _ = self.queue.send(evt);
    }
}

impl ProgressSink for RedisProgressSink {
    fn emit_progress(&self, progress: &ProvisioningProgress) {
        match serde_json::to_value(progress) {
            Ok(payload) => self.enqueue(ProvisioningEventEnvelope::new(
                ProvisioningEventType::Progress,
                progress.instance_id,
                payload,
                EVENT_SOURCE,
            )),
            Err(e) => tracing::warn!(error = %e, "[progress_events] failed to encode progress"),
        }
    }

    fn emit_log(&self, entry: &ProvisioningLogEntry) {
        match serde_json::to_value(entry) {
            Ok(payload) => self.enqueue(ProvisioningEventEnvelope::new(
                ProvisioningEventType::Log,
                entry.instance_id,
                payload,
                EVENT_SOURCE,
            )),
            Err(e) => tracing::warn!(error = %e, "[progress_events] failed to encode log entry"),
        }
    }
}

/// Forwards every event to each inner sink.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for CompositeSink {
    fn emit_progress(&self, progress: &ProvisioningProgress) {
        for s in &self.sinks {
            s.emit_progress(progress);
        }
    }

    fn emit_log(&self, entry: &ProvisioningLogEntry) {
        for s in &self.sinks {
            s.emit_log(entry);
        }
    }
}
