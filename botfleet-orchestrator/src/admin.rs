//! Internal admin surface: liveness, fleet summary, per-instance status/progress/logs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use botfleet_common::progress::ProvisioningLogEntry;

use crate::lifecycle::LifecycleOrchestrator;
use crate::progress_events::{BroadcastProgressSink, ProvisioningEvent};

pub struct AdminState {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub events: Arc<BroadcastProgressSink>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(admin_status))
        .route("/instances/:id/status", get(instance_status))
        .route("/instances/:id/progress", get(instance_progress))
        .route("/instances/:id/logs", get(instance_logs))
        .route("/instances/:id/logs/tail", get(instance_log_tail))
        .route("/instances/:id/events", get(instance_events))
        .with_state(state)
}

fn not_found(what: &str) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": what }))).into_response()
}

pub async fn root() -> &'static str {
    "botfleet orchestrator online"
}

pub async fn admin_status(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let instances = match state.orchestrator.repository().list_instances().await {
        Ok(i) => i,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "db_error", "message": e.to_string() })),
            )
                .into_response()
        }
    };
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for i in &instances {
        *by_status.entry(i.status.as_str()).or_default() += 1;
    }
    let active = state.orchestrator.tracker().active_operations();

    Json(json!({
        "instances_count": instances.len(),
        "instances_by_status": by_status,
        "active_operations": active.len(),
        "locked_instances": state.orchestrator.locks().tracked(),
    }))
    .into_response()
}

pub async fn instance_status(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let instance = match state.orchestrator.repository().get_instance(id).await {
        Ok(Some(i)) => i,
        Ok(None) => return not_found("instance_not_found"),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "db_error", "message": e.to_string() })),
            )
                .into_response()
        }
    };
    Json(state.orchestrator.get_status(&instance).await).into_response()
}

pub async fn instance_progress(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.orchestrator.tracker().get_progress(id) {
        Some(p) => Json(p).into_response(),
        None => not_found("no_operation_tracked"),
    }
}

pub async fn instance_logs(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    Json(state.orchestrator.tracker().get_recent_logs(id))
}

/// Buffered log lines followed by the live feed (SSE). The tracker keeps a single live
/// subscriber, so opening a tail closes any tail opened before it.
pub async fn instance_log_tail(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let tracker = state.orchestrator.tracker();
    let backlog = tracker.get_recent_logs(id);
    let mut live = tracker.subscribe_logs(id);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);

    tokio::spawn(async move {
        for entry in backlog {
            if tx.send(Ok(log_event(&entry))).await.is_err() {
                return;
            }
        }
        while let Some(entry) = live.recv().await {
            if tx.send(Ok(log_event(&entry))).await.is_err() {
                return;
            }
        }
        tracing::debug!(instance_id = %id, "[admin] log tail replaced by a newer subscriber");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

fn log_event(entry: &ProvisioningLogEntry) -> Event {
    Event::default()
        .event("log")
        .data(serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string()))
}

/// Live progress/log events for one instance (SSE).
pub async fn instance_events(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let mut events = state.events.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);

    tokio::spawn(async move {
        loop {
            let evt = match events.recv().await {
                Ok(evt) => evt,
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(instance_id = %id, skipped = n, "[admin] event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if evt.instance_id() != id {
                continue;
            }
            let (name, data) = match &evt {
                ProvisioningEvent::Progress(p) => ("progress", serde_json::to_string(p)),
                ProvisioningEvent::Log(l) => ("log", serde_json::to_string(l)),
            };
            let ev = Event::default()
                .event(name)
                .data(data.unwrap_or_else(|_| "{}".to_string()));
            if tx.send(Ok(ev)).await.is_err() {
                return;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayConnector, GatewayError, GatewayPool, GatewayRpc, GatewayTarget, RetryConfig};
    use crate::progress::{ProvisioningTracker, TrackerConfig};
    use crate::repository::MemoryRepository;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use botfleet_common::progress::{LogStream, StepDescriptor};
    use botfleet_common::{DeploymentType, Instance};
    use botfleet_providers::mock::{MockTarget, MockTargetFactory};
    use botfleet_providers::AdapterRegistry;

    struct Offline;

    #[async_trait]
    impl GatewayConnector for Offline {
        async fn connect(&self, _target: &GatewayTarget) -> Result<Arc<dyn GatewayRpc>, GatewayError> {
            Err(GatewayError::Transport("connection refused".into()))
        }
    }

    fn state() -> (Arc<AdminState>, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let events = Arc::new(BroadcastProgressSink::new(16));
        let tracker = ProvisioningTracker::new(events.clone(), TrackerConfig::default());
        let orchestrator = LifecycleOrchestrator::new(
            repo.clone(),
            Arc::new(AdapterRegistry::new()),
            Arc::new(MockTargetFactory::new(Arc::new(MockTarget::new(DeploymentType::Local)))),
            tracker,
            Arc::new(GatewayPool::new(Arc::new(Offline), RetryConfig::default())),
        );
        (
            Arc::new(AdminState {
                orchestrator: Arc::new(orchestrator),
                events,
            }),
            repo,
        )
    }

    #[tokio::test]
    async fn progress_is_404_until_an_operation_is_tracked() {
        let (state, _) = state();
        let id = Uuid::new_v4();
        let resp = instance_progress(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        state
            .orchestrator
            .tracker()
            .start_operation(id, &[StepDescriptor::new("install_binary", "Install")]);
        state
            .orchestrator
            .tracker()
            .append_log(id, None, LogStream::Stdout, "hello");
        let resp = instance_progress(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.orchestrator.tracker().get_recent_logs(id).len(), 1);
    }

    async fn read_until(body: &mut axum::body::BodyDataStream, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
                .await
                .expect("tail stalled")
                .expect("tail ended")
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    #[tokio::test]
    async fn log_tail_replays_backlog_then_follows_live_lines() {
        let (state, _) = state();
        let id = Uuid::new_v4();
        let tracker = state.orchestrator.tracker().clone();
        tracker.append_log(id, None, LogStream::Stdout, "buffered line");

        let resp = instance_log_tail(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();
        let first = read_until(&mut body, "buffered line").await;
        assert!(first.contains("event: log"));

        tracker.append_log(id, None, LogStream::Stderr, "live line");
        read_until(&mut body, "live line").await;

        // A second tail takes over the live feed and the first one ends.
        let _second = instance_log_tail(State(state), Path(id)).await.into_response();
        let ended = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .expect("first tail should close");
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn status_of_unknown_instance_is_404() {
        let (state, _) = state();
        let resp = instance_status(State(state), Path(Uuid::new_v4()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_gateway_unreachable_without_failing() {
        let (state, repo) = state();
        let inst = Instance::new("bot", DeploymentType::Local);
        let id = inst.id;
        repo.insert_instance(inst);
        let resp = instance_status(State(state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
