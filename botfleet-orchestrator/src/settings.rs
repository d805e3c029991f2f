use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::RetryConfig;

pub const DEFAULT_ORCHESTRATOR_PORT: u16 = 8002;

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub port: u16,
    pub gateway_retry: RetryConfig,
    pub gateway_rpc_timeout: Duration,
    pub provisioning_timeout: Duration,
    pub data_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://127.0.0.1/".to_string(),
            port: DEFAULT_ORCHESTRATOR_PORT,
            gateway_retry: RetryConfig::default(),
            gateway_rpc_timeout: Duration::from_secs(10),
            provisioning_timeout: Duration::from_secs(15 * 60),
            data_dir: PathBuf::from("/var/lib/botfleet"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl OrchestratorSettings {
    /// Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            redis_url: env_string("REDIS_URL").unwrap_or(d.redis_url),
            port: env_parse("ORCHESTRATOR_PORT").unwrap_or(d.port),
            gateway_retry: RetryConfig {
                max_attempts: env_parse("GATEWAY_CONNECT_MAX_ATTEMPTS")
                    .unwrap_or(d.gateway_retry.max_attempts),
                initial_delay: env_parse("GATEWAY_CONNECT_INITIAL_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.gateway_retry.initial_delay),
                max_delay: env_parse("GATEWAY_CONNECT_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.gateway_retry.max_delay),
            },
            gateway_rpc_timeout: env_parse("GATEWAY_RPC_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.gateway_rpc_timeout),
            provisioning_timeout: env_parse("PROVISIONING_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.provisioning_timeout),
            data_dir: env_string("BOTFLEET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_contract() {
        let s = OrchestratorSettings::default();
        assert_eq!(s.gateway_retry.max_attempts, 30);
        assert_eq!(s.gateway_retry.initial_delay, Duration::from_millis(5000));
        assert_eq!(s.gateway_retry.max_delay, Duration::from_millis(15000));
        assert_eq!(s.provisioning_timeout, Duration::from_secs(900));
        assert_eq!(s.port, 8002);
    }
}
