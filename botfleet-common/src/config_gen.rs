//! Manifest -> runtime config transform.
//!
//! Pure apart from token generation and logging: environment defaults are merged into unset
//! fields, channel `enabled` flags are dropped, and the secure-default pass runs last.
//! The resulting document is hashed with [`config_hash`], which is the only drift signal the
//! orchestrator uses.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::target_config::DEFAULT_GATEWAY_PORT;

pub const DEFAULT_GATEWAY_HOST: &str = "0.0.0.0";
pub const DEFAULT_REDACT_SENSITIVE: &str = "tools";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Dev,
    Local,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    pub fn default_log_level(&self) -> &'static str {
        match self {
            Environment::Prod => "warn",
            Environment::Staging => "info",
            Environment::Dev | Environment::Local => "debug",
        }
    }

    /// Environments where an open sandbox is not acceptable without an explicit override.
    pub fn is_hardened(&self) -> bool {
        matches!(self, Environment::Prod | Environment::Staging)
    }
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Environment::Prod,
            "staging" | "stage" => Environment::Staging,
            "local" => Environment::Local,
            _ => Environment::Dev,
        }
    }
}

impl From<Environment> for String {
    fn from(e: Environment) -> Self {
        e.as_str().to_string()
    }
}

impl Serialize for Environment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Environment::from)
    }
}

/// Explicit opt-outs from the secure-default pass.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SecurityOverrides {
    pub allow_open_gateway: bool,
    pub allow_sandbox_off: bool,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    /// Desired runtime config document (the bot's native config shape).
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub overrides: SecurityOverrides,
}

impl Manifest {
    pub fn new(name: &str, environment: Environment, config: Value) -> Self {
        Self {
            name: name.to_string(),
            environment,
            config,
            overrides: SecurityOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Token already issued to this instance's gateway. Reused instead of minting a new one,
    /// so regenerating the same manifest stays hash-stable.
    pub existing_gateway_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureDefault {
    GatewayTokenGenerated,
    GatewayTokenReused,
    SandboxForced,
    ElevatedToolsDisabled,
    RedactionDefaulted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedConfig {
    pub config: Value,
    pub hash: String,
    pub applied_defaults: Vec<SecureDefault>,
}

impl GeneratedConfig {
    pub fn gateway_token(&self) -> Option<&str> {
        gateway_token(&self.config)
    }

    pub fn gateway_port(&self) -> Option<u16> {
        gateway_port(&self.config)
    }

    /// Raw document pushed over `config.apply` / written to the target's store.
    pub fn raw(&self) -> String {
        serde_json::to_string_pretty(&self.config).unwrap_or_else(|_| self.config.to_string())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("manifest name is empty")]
    EmptyName,
    #[error("manifest config must be a JSON object")]
    NotAnObject,
    #[error("invalid config field `{path}`: {message}")]
    InvalidField { path: String, message: String },
}

impl ConfigError {
    fn invalid(path: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Generate the full runtime config and its hash from a manifest.
pub fn generate(manifest: &Manifest, options: &GenerateOptions) -> Result<GeneratedConfig, ConfigError> {
    if manifest.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    let mut cfg = match &manifest.config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(ConfigError::NotAnObject),
    };

    apply_environment_defaults(&mut cfg, manifest.environment)?;
    validate_gateway_port(&cfg)?;
    strip_channel_enabled_flags(&mut cfg)?;

    let mut applied = Vec::new();
    enforce_secure_defaults(
        &mut cfg,
        manifest.environment,
        &manifest.overrides,
        options,
        &mut applied,
    )?;

    let config = Value::Object(cfg);
    let hash = config_hash(&config);
    Ok(GeneratedConfig {
        config,
        hash,
        applied_defaults: applied,
    })
}

fn section_mut<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a mut Map<String, Value>, ConfigError> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    entry
        .as_object_mut()
        .ok_or_else(|| ConfigError::invalid(path, "expected an object"))
}

fn is_unset(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).map_or(true, Value::is_null)
}

fn set_if_unset(map: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    if is_unset(map, key) {
        map.insert(key.to_string(), value);
        return true;
    }
    false
}

fn apply_environment_defaults(
    cfg: &mut Map<String, Value>,
    env: Environment,
) -> Result<(), ConfigError> {
    let logging = section_mut(cfg, "logging", "logging")?;
    set_if_unset(logging, "level", Value::from(env.default_log_level()));

    let gateway = section_mut(cfg, "gateway", "gateway")?;
    set_if_unset(gateway, "host", Value::from(DEFAULT_GATEWAY_HOST));
    set_if_unset(gateway, "port", Value::from(DEFAULT_GATEWAY_PORT));
    Ok(())
}

fn validate_gateway_port(cfg: &Map<String, Value>) -> Result<(), ConfigError> {
    let port = cfg.get("gateway").and_then(|g| g.get("port"));
    match port.and_then(Value::as_u64) {
        Some(p) if (1..=u16::MAX as u64).contains(&p) => Ok(()),
        _ => Err(ConfigError::invalid(
            "gateway.port",
            format!("expected a port number, got {}", port.cloned().unwrap_or(Value::Null)),
        )),
    }
}

/// A channel entry's presence is its enablement; the flag itself is dropped.
fn strip_channel_enabled_flags(cfg: &mut Map<String, Value>) -> Result<(), ConfigError> {
    let Some(channels) = cfg.get_mut("channels") else {
        return Ok(());
    };
    if channels.is_null() {
        return Ok(());
    }
    let channels = channels
        .as_object_mut()
        .ok_or_else(|| ConfigError::invalid("channels", "expected an object"))?;
    for channel in channels.values_mut() {
        if let Some(obj) = channel.as_object_mut() {
            obj.remove("enabled");
        }
    }
    Ok(())
}

fn has_gateway_credential(gateway: &Map<String, Value>) -> bool {
    let Some(auth) = gateway.get("auth").and_then(Value::as_object) else {
        return false;
    };
    ["token", "password"].iter().any(|k| {
        auth.get(*k)
            .and_then(Value::as_str)
            .map_or(false, |s| !s.trim().is_empty())
    })
}

fn allow_list_is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.values().all(|v| allow_list_is_empty(Some(v))),
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn enforce_secure_defaults(
    cfg: &mut Map<String, Value>,
    env: Environment,
    overrides: &SecurityOverrides,
    options: &GenerateOptions,
    applied: &mut Vec<SecureDefault>,
) -> Result<(), ConfigError> {
    // Gateway credential
    let gateway = section_mut(cfg, "gateway", "gateway")?;
    if !has_gateway_credential(gateway) && !overrides.allow_open_gateway {
        let existing = options
            .existing_gateway_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let (token, kind) = match existing {
            Some(t) => (t.to_string(), SecureDefault::GatewayTokenReused),
            None => (generate_gateway_token(), SecureDefault::GatewayTokenGenerated),
        };
        let auth = section_mut(gateway, "auth", "gateway.auth")?;
        auth.insert("token".to_string(), Value::String(token));
        tracing::warn!(
            "[config_gen] gateway has no auth credential; {}",
            if kind == SecureDefault::GatewayTokenReused {
                "reusing previously issued token"
            } else {
                "generated a new token"
            }
        );
        applied.push(kind);
    }

    // Sandbox isolation
    if env.is_hardened() && !overrides.allow_sandbox_off {
        if let Some(sandbox) = cfg.get_mut("sandbox").and_then(Value::as_object_mut) {
            if sandbox.get("mode").and_then(Value::as_str) == Some("off") {
                sandbox.insert("mode".to_string(), Value::from("all"));
                tracing::warn!(
                    environment = env.as_str(),
                    "[config_gen] sandbox.mode=off is not allowed here; forced to \"all\""
                );
                applied.push(SecureDefault::SandboxForced);
            }
        }
    }

    // Elevated tools need an explicit allow-list
    if let Some(elevated) = cfg
        .get_mut("tools")
        .and_then(|t| t.get_mut("elevated"))
        .and_then(Value::as_object_mut)
    {
        let enabled = elevated.get("enabled").and_then(Value::as_bool) == Some(true);
        if enabled && allow_list_is_empty(elevated.get("allowFrom")) {
            elevated.insert("enabled".to_string(), Value::Bool(false));
            tracing::warn!("[config_gen] tools.elevated enabled with empty allowFrom; disabled");
            applied.push(SecureDefault::ElevatedToolsDisabled);
        }
    }

    // Log redaction
    let logging = section_mut(cfg, "logging", "logging")?;
    if set_if_unset(logging, "redactSensitive", Value::from(DEFAULT_REDACT_SENSITIVE)) {
        applied.push(SecureDefault::RedactionDefaulted);
    }

    Ok(())
}

fn generate_gateway_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn gateway_token(config: &Value) -> Option<&str> {
    config
        .get("gateway")?
        .get("auth")?
        .get("token")?
        .as_str()
        .filter(|t| !t.trim().is_empty())
}

pub fn gateway_port(config: &Value) -> Option<u16> {
    config
        .get("gateway")?
        .get("port")?
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
}

/// Deterministic digest of a config document: keys sorted at every depth, arrays kept in
/// order, SHA-256 over the canonical JSON, lowercase hex.
pub fn config_hash(config: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(config, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(env: Environment, config: Value) -> Manifest {
        Manifest::new("bot-a", env, config)
    }

    #[test]
    fn hash_ignores_key_order() {
        let a: Value = serde_json::from_str(
            r#"{"gateway":{"port":1,"host":"h"},"channels":{"slack":{"x":[1,2]},"tg":{}}}"#,
        )
        .unwrap();
        let b: Value = serde_json::from_str(
            r#"{"channels":{"tg":{},"slack":{"x":[1,2]}},"gateway":{"host":"h","port":1}}"#,
        )
        .unwrap();
        assert_eq!(config_hash(&a), config_hash(&b));

        let c = json!({"channels": {"slack": {"x": [2, 1]}, "tg": {}}, "gateway": {"host": "h", "port": 1}});
        assert_ne!(config_hash(&a), config_hash(&c), "array order is significant");
        assert_eq!(config_hash(&a).len(), 64);
    }

    #[test]
    fn environment_defaults_fill_only_unset_fields() {
        let out = generate(
            &manifest(Environment::Prod, json!({"gateway": {"port": 20000}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["logging"]["level"], "warn");
        assert_eq!(out.config["gateway"]["host"], DEFAULT_GATEWAY_HOST);
        assert_eq!(out.config["gateway"]["port"], 20000);

        let out = generate(
            &manifest(Environment::Staging, json!({"logging": {"level": "trace"}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["logging"]["level"], "trace");
        assert_eq!(out.gateway_port(), Some(DEFAULT_GATEWAY_PORT));

        let out = generate(&manifest(Environment::Dev, Value::Null), &GenerateOptions::default()).unwrap();
        assert_eq!(out.config["logging"]["level"], "debug");
    }

    #[test]
    fn channel_enabled_flags_are_stripped() {
        let out = generate(
            &manifest(
                Environment::Dev,
                json!({"channels": {"slack": {"enabled": true, "botToken": "x"}, "discord": {"enabled": false}}}),
            ),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["channels"]["slack"], json!({"botToken": "x"}));
        assert_eq!(out.config["channels"]["discord"], json!({}));
    }

    #[test]
    fn missing_gateway_auth_gets_generated_token() {
        let out = generate(&manifest(Environment::Prod, json!({})), &GenerateOptions::default()).unwrap();
        let token = out.gateway_token().unwrap();
        assert!(token.len() >= 43);
        assert!(out.applied_defaults.contains(&SecureDefault::GatewayTokenGenerated));

        let other = generate(&manifest(Environment::Prod, json!({})), &GenerateOptions::default()).unwrap();
        assert_ne!(other.gateway_token(), Some(token));
    }

    #[test]
    fn issued_token_is_reused_and_hash_is_stable() {
        let opts = GenerateOptions {
            existing_gateway_token: Some("tok-123".to_string()),
        };
        let m = manifest(Environment::Prod, json!({"channels": {"slack": {}}}));
        let a = generate(&m, &opts).unwrap();
        let b = generate(&m, &opts).unwrap();
        assert_eq!(a.gateway_token(), Some("tok-123"));
        assert_eq!(a.hash, b.hash);
        assert!(a.applied_defaults.contains(&SecureDefault::GatewayTokenReused));
    }

    #[test]
    fn explicit_token_and_open_gateway_override_are_respected() {
        let out = generate(
            &manifest(Environment::Prod, json!({"gateway": {"auth": {"token": "mine"}}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.gateway_token(), Some("mine"));

        let mut m = manifest(Environment::Prod, json!({}));
        m.overrides.allow_open_gateway = true;
        let out = generate(&m, &GenerateOptions::default()).unwrap();
        assert_eq!(out.gateway_token(), None);
    }

    #[test]
    fn prod_sandbox_off_is_forced_to_all() {
        let out = generate(
            &manifest(Environment::Prod, json!({"sandbox": {"mode": "off"}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["sandbox"]["mode"], "all");

        let out = generate(
            &manifest(Environment::Dev, json!({"sandbox": {"mode": "off"}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["sandbox"]["mode"], "off");

        let mut m = manifest(Environment::Staging, json!({"sandbox": {"mode": "off"}}));
        m.overrides.allow_sandbox_off = true;
        let out = generate(&m, &GenerateOptions::default()).unwrap();
        assert_eq!(out.config["sandbox"]["mode"], "off");
    }

    #[test]
    fn elevated_tools_without_allow_list_are_disabled() {
        let out = generate(
            &manifest(
                Environment::Dev,
                json!({"tools": {"elevated": {"enabled": true, "allowFrom": []}}}),
            ),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["tools"]["elevated"]["enabled"], false);

        let out = generate(
            &manifest(
                Environment::Dev,
                json!({"tools": {"elevated": {"enabled": true, "allowFrom": {"slack": ["U123"]}}}}),
            ),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["tools"]["elevated"]["enabled"], true);
    }

    #[test]
    fn redaction_defaults_to_tools() {
        let out = generate(&manifest(Environment::Dev, json!({})), &GenerateOptions::default()).unwrap();
        assert_eq!(out.config["logging"]["redactSensitive"], DEFAULT_REDACT_SENSITIVE);

        let out = generate(
            &manifest(Environment::Dev, json!({"logging": {"redactSensitive": "off"}})),
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(out.config["logging"]["redactSensitive"], "off");
    }

    #[test]
    fn invalid_manifests_are_rejected() {
        let opts = GenerateOptions::default();
        assert_eq!(
            generate(&Manifest::new(" ", Environment::Dev, json!({})), &opts),
            Err(ConfigError::EmptyName)
        );
        assert_eq!(
            generate(&manifest(Environment::Dev, json!([1, 2])), &opts),
            Err(ConfigError::NotAnObject)
        );
        assert!(matches!(
            generate(&manifest(Environment::Dev, json!({"gateway": {"port": 70000}})), &opts),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn environment_parses_leniently() {
        assert_eq!(Environment::from("Production".to_string()), Environment::Prod);
        assert_eq!(Environment::from("qa".to_string()), Environment::Dev);
        let m: Manifest = serde_json::from_value(json!({"name": "x", "environment": "staging"})).unwrap();
        assert_eq!(m.environment, Environment::Staging);
        assert_eq!(m.config, json!({}));
    }
}
