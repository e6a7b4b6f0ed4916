use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable selecting the configuration profile.
pub const ENV_VAR: &str = "SWITCHBOARD_ENV";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub admission: AdmissionConfig,
    pub policy: PolicyConfig,
    pub auth: AuthConfig,
    pub observability: ObservabilityConfig,
    /// Deployment profile name ("development", "production", ...).
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            enable_cors: true,
            enable_tracing: true,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Provider base URL; `/chat/completions` is appended.
    pub base_url: String,
    /// Provider credential. When unset the caller's `Authorization` header is forwarded.
    pub api_key: Option<Secret<String>>,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Retries for connection-level failures only. Never applied to HTTP responses.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            max_retries: 0,
            retry_backoff_ms: 200,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// How a request behaves when its agent key is already admitted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Reject at once with `RESOURCE_LOCKED`.
    #[default]
    Immediate,
    /// Queue for up to `wait_timeout_ms`, then reject.
    BoundedWait,
}

/// What identifies an agent for admission purposes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionKeyScope {
    /// Agent id alone; the same agent id contends across organizations.
    Agent,
    /// Organization plus agent id.
    #[default]
    OrgAgent,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdmissionConfig {
    pub mode: AdmissionMode,
    pub wait_timeout_ms: u64,
    pub key_scope: AdmissionKeyScope,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: AdmissionMode::Immediate,
            wait_timeout_ms: 5_000,
            key_scope: AdmissionKeyScope::OrgAgent,
        }
    }
}

impl AdmissionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Treat every rule as shadow-only.
    pub shadow_mode: bool,
    /// Rule ids demoted to shadow logging.
    pub shadow_rules: Vec<String>,
    /// Rule ids removed from the rule set.
    pub disabled_rules: Vec<String>,
    /// Optional YAML file with additional rules.
    pub rules_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Only tokens listed in `auth.tokens` are accepted.
    Static,
    /// Any non-empty token is accepted. Development only.
    #[default]
    Permissive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenEntry {
    pub token: Secret<String>,
    pub org_id: String,
    /// When present, only these agent ids may use the token.
    #[serde(default)]
    pub allowed_agents: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub json_logs: bool,
    pub metrics_enabled: bool,
    /// Number of recent events retained for the dashboard feed.
    pub event_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            metrics_enabled: true,
            event_buffer: 1024,
        }
    }
}

impl SwitchboardConfig {
    /// Load layered configuration: `config/default`, `config/{env}`, `config/local`,
    /// then `SWITCHBOARD__*` environment variables.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var(ENV_VAR).unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map SWITCHBOARD__SERVER__PORT=8080 to server.port
            .add_source(Environment::with_prefix("SWITCHBOARD").separator("__"))
            .build()?;

        let mut cfg: Self = s.try_deserialize()?;
        cfg.environment = env;
        Ok(cfg)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Reject combinations the gateway cannot serve safely.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(Error::config("upstream.base_url must not be empty"));
        }
        if self.admission.mode == AdmissionMode::BoundedWait && self.admission.wait_timeout_ms == 0 {
            return Err(Error::config(
                "admission.wait_timeout_ms must be positive in bounded_wait mode",
            ));
        }
        if self.auth.mode == AuthMode::Static && self.auth.tokens.is_empty() {
            return Err(Error::config("auth.mode = static requires at least one token"));
        }
        if self.is_production() && self.auth.mode != AuthMode::Static {
            return Err(Error::config("production requires auth.mode = static"));
        }
        Ok(())
    }
}
