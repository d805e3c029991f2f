use botfleet_common::target_config::TargetConfigError;
use botfleet_common::config_gen::ConfigError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

/// Failure taxonomy of lifecycle operations. Public orchestrator methods fold these into
/// their result structs; they never surface as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Install failed: {0}")]
    Install(String),
    #[error("Configure failed: {0}")]
    Configure(String),
    #[error("Start failed: {0}")]
    Start(String),
    #[error("gateway unreachable after {attempts} attempts: {last_error}")]
    GatewayConnectExhausted { attempts: u32, last_error: String },
    #[error("config.apply rejected: {0}")]
    ConfigApplyRejected(String),
    #[error("{0}")]
    UnsupportedOperation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Target(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("operation cancelled")]
    Cancelled,
    /// The operation outlived the tracker's operation timeout.
    #[error("{0}")]
    Timeout(String),
}

impl LifecycleError {
    pub fn instance_not_found(id: Uuid) -> Self {
        LifecycleError::NotFound(format!("instance {}", id))
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(e: ConfigError) -> Self {
        LifecycleError::InvalidConfig(e.to_string())
    }
}

impl From<TargetConfigError> for LifecycleError {
    fn from(e: TargetConfigError) -> Self {
        match e {
            TargetConfigError::Missing { .. } => LifecycleError::NotFound(e.to_string()),
            other => LifecycleError::InvalidConfig(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_stage_prefix() {
        assert_eq!(
            LifecycleError::Install("disk full".into()).to_string(),
            "Install failed: disk full"
        );
        assert_eq!(
            LifecycleError::ConfigApplyRejected("a; b".into()).to_string(),
            "config.apply rejected: a; b"
        );
    }
}
