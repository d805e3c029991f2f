//! Gateway RPC client and per-instance connection pool.
//!
//! Each running instance exposes a JSON-RPC gateway. The orchestrator keeps one client per
//! instance id and reuses it across operations.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::LifecycleError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// Seconds since the gateway process started.
    #[serde(default)]
    pub uptime: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "configHash", default)]
    pub config_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigGetResponse {
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigApplyRequest {
    pub raw: String,
    /// Remote hash the change was computed against; the gateway refuses the apply if its
    /// current config no longer matches.
    #[serde(rename = "baseHash", skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigApplyResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(rename = "validationErrors", default)]
    pub validation_errors: Vec<String>,
}

impl ConfigApplyResponse {
    /// Gateways report acceptance as either `ok` or `success`.
    pub fn applied(&self) -> bool {
        self.ok == Some(true) || self.success == Some(true)
    }

    pub fn rejection_message(&self) -> String {
        if self.validation_errors.is_empty() {
            "no validation errors reported".to_string()
        } else {
            self.validation_errors.join("; ")
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait GatewayRpc: Send + Sync {
    async fn health(&self) -> Result<HealthResponse, GatewayError>;
    async fn status(&self) -> Result<StatusResponse, GatewayError>;
    async fn config_get(&self) -> Result<ConfigGetResponse, GatewayError>;
    async fn config_apply(&self, req: &ConfigApplyRequest) -> Result<ConfigApplyResponse, GatewayError>;
}

/// Opens (and handshakes) a client for one gateway.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, target: &GatewayTarget) -> Result<Arc<dyn GatewayRpc>, GatewayError>;
}

// -----------------------------------------------------------------------------
// JSON-RPC over HTTP
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

pub struct HttpGatewayClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: AtomicU64,
}

impl HttpGatewayClient {
    pub fn new(http: reqwest::Client, target: &GatewayTarget) -> Self {
        Self {
            http,
            url: format!("http://{}:{}/rpc", target.host, target.port),
            token: target.token.clone(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut req = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("{} {}: {}", method, status, text)));
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        if let Some(err) = envelope.error {
            return Err(GatewayError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = envelope
            .result
            .ok_or_else(|| GatewayError::Protocol(format!("{}: response has no result", method)))?;
        serde_json::from_value(result).map_err(|e| GatewayError::Protocol(format!("{}: {}", method, e)))
    }
}

#[async_trait]
impl GatewayRpc for HttpGatewayClient {
    async fn health(&self) -> Result<HealthResponse, GatewayError> {
        self.call("health", json!({})).await
    }

    async fn status(&self) -> Result<StatusResponse, GatewayError> {
        self.call("status", json!({})).await
    }

    async fn config_get(&self) -> Result<ConfigGetResponse, GatewayError> {
        self.call("config.get", json!({})).await
    }

    async fn config_apply(&self, req: &ConfigApplyRequest) -> Result<ConfigApplyResponse, GatewayError> {
        let params = serde_json::to_value(req).map_err(|e| GatewayError::Protocol(e.to_string()))?;
        self.call("config.apply", params).await
    }
}

/// Connector backed by one shared keep-alive HTTP client.
pub struct HttpGatewayConnector {
    http: reqwest::Client,
}

impl HttpGatewayConnector {
    pub fn new(rpc_timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .connect_timeout(rpc_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl GatewayConnector for HttpGatewayConnector {
    async fn connect(&self, target: &GatewayTarget) -> Result<Arc<dyn GatewayRpc>, GatewayError> {
        let client = HttpGatewayClient::new(self.http.clone(), target);
        // Handshake: a gateway that answers `health` is considered connected.
        client.health().await?;
        Ok(Arc::new(client))
    }
}

// -----------------------------------------------------------------------------
// Retry
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_millis(15000),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based): `min(initial * 2^(attempt-1), max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub async fn connect_with_retry(
    connector: &dyn GatewayConnector,
    target: &GatewayTarget,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn GatewayRpc>, LifecycleError> {
    let attempts = retry.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
            r = connector.connect(target) => r,
        };
        match result {
            Ok(client) => {
                if attempt > 1 {
                    tracing::info!(
                        host = %target.host,
                        port = target.port,
                        attempt,
                        "[gateway] connected after retries"
                    );
                }
                return Ok(client);
            }
            Err(e) => {
                tracing::debug!(
                    host = %target.host,
                    port = target.port,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "[gateway] connect attempt failed"
                );
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                _ = tokio::time::sleep(retry.delay_after(attempt)) => {}
            }
        }
    }

    Err(LifecycleError::GatewayConnectExhausted {
        attempts,
        last_error,
    })
}

// -----------------------------------------------------------------------------
// Pool
// -----------------------------------------------------------------------------

pub struct GatewayPool {
    connector: Arc<dyn GatewayConnector>,
    retry: RetryConfig,
    clients: RwLock<HashMap<Uuid, Arc<dyn GatewayRpc>>>,
}

impl GatewayPool {
    pub fn new(connector: Arc<dyn GatewayConnector>, retry: RetryConfig) -> Self {
        Self {
            connector,
            retry,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, instance_id: Uuid) -> Option<Arc<dyn GatewayRpc>> {
        self.clients
            .read()
            .ok()
            .and_then(|c| c.get(&instance_id).cloned())
    }

    /// Reuse the pooled client or connect with retry and pool the result.
    pub async fn get_or_connect(
        &self,
        instance_id: Uuid,
        target: &GatewayTarget,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn GatewayRpc>, LifecycleError> {
        if let Some(client) = self.get(instance_id) {
            return Ok(client);
        }
        let client = connect_with_retry(self.connector.as_ref(), target, &self.retry, cancel).await?;
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(instance_id, client.clone());
        }
        Ok(client)
    }

    /// Single attempt, not pooled. Used by status probes that must not block on retries.
    pub async fn connect_once(&self, target: &GatewayTarget) -> Result<Arc<dyn GatewayRpc>, GatewayError> {
        self.connector.connect(target).await
    }

    pub fn remove(&self, instance_id: Uuid) -> bool {
        self.clients
            .write()
            .map(|mut c| c.remove(&instance_id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
