use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Wildcard capability: the node accepts any model name.
pub const ANY_MODEL: &str = "*";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one node must be configured")]
    NoNodes,

    #[error("Empty node id")]
    EmptyNodeId,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node {0} declares no models")]
    NoModels(String),

    #[error("An api key pool must contain at least one key")]
    EmptyKeyPool,

    #[error("Empty key id")]
    EmptyKeyId,

    #[error("Duplicate key id: {0}")]
    DuplicateKey(String),

    #[error("Key {0} has a quota of 0")]
    ZeroQuota(String),

    #[error("Failure threshold must be at least 1")]
    InvalidFailureThreshold,

    #[error("Backoff multiplier must be at least 1.0")]
    InvalidBackoffMultiplier,

    #[error("Maximum cooldown is smaller than the base cooldown")]
    InvalidMaxCooldown,

    #[error("Endpoint path must start with '/': {0}")]
    InvalidEndpointPath(String),

    #[error("Secret for key {0} could not be resolved: environment variable {1} is not set")]
    MissingSecret(String, String),
}

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for dispatch requests
    pub listener: Listener,
    /// Admin listener for health, readiness and cluster status
    pub admin_listener: Listener,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Inference backends, in configured priority order
    pub nodes: Vec<NodeConfig>,
    /// Optional credential pool. Without it, node calls carry no credential.
    pub api_keys: Option<ApiKeyPoolConfig>,
}

impl Config {
    /// Validates the gateway configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.dispatch.validate()?;
        self.circuit_breaker.validate()?;

        if self.nodes.is_empty() {
            return Err(ValidationError::NoNodes);
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(ValidationError::EmptyNodeId);
            }
            if !node_ids.insert(&node.id) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            if node.models.is_empty() {
                return Err(ValidationError::NoModels(node.id.clone()));
            }
        }

        if let Some(api_keys) = &self.api_keys {
            api_keys.validate()?;
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Path appended to a node's base URL for inference calls
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    /// Per-attempt timeout applied when a request does not carry its own
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_endpoint_path() -> String {
    "/v1/chat/completions".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoint_path: default_endpoint_path(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.endpoint_path.starts_with('/') {
            return Err(ValidationError::InvalidEndpointPath(
                self.endpoint_path.clone(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Circuit breaker tuning shared by every node.
///
/// The first trip keeps the circuit open for `cooldown_ms`. Each failed
/// half-open trial call multiplies the cooldown by `backoff_multiplier`, capped at
/// `max_cooldown_ms`. A successful trial call resets it to `cooldown_ms`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 10_000,
            max_cooldown_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::InvalidFailureThreshold);
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ValidationError::InvalidBackoffMultiplier);
        }
        if self.max_cooldown_ms < self.cooldown_ms {
            return Err(ValidationError::InvalidMaxCooldown);
        }
        Ok(())
    }

    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    /// Cooldown to use after a failed trial call, given the cooldown that just elapsed.
    pub fn next_cooldown(&self, current: Duration) -> Duration {
        let grown = current.as_millis() as f64 * self.backoff_multiplier;
        let capped = grown.min(self.max_cooldown_ms as f64) as u64;
        Duration::from_millis(capped.max(current.as_millis() as u64))
    }
}

/// Inference backend configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Unique identity, conventionally `host:port`
    pub id: String,
    /// Base URL of the node's inference server. The endpoint path is
    /// appended to any path it carries.
    pub url: Url,
    /// Model names served by this node. `"*"` accepts any model.
    pub models: Vec<String>,
    /// Lower values are preferred when health is otherwise equal
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiKeyPoolConfig {
    /// Cooldown applied after a rate limit when the provider gives no hint
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// Length of the window a key's `quota` applies to
    #[serde(default = "default_quota_window_secs")]
    pub quota_window_secs: u64,
    pub keys: Vec<ApiKeyConfig>,
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_quota_window_secs() -> u64 {
    60
}

impl ApiKeyPoolConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.keys.is_empty() {
            return Err(ValidationError::EmptyKeyPool);
        }

        let mut key_ids = HashSet::new();
        for key in &self.keys {
            if key.id.is_empty() {
                return Err(ValidationError::EmptyKeyId);
            }
            if !key_ids.insert(&key.id) {
                return Err(ValidationError::DuplicateKey(key.id.clone()));
            }
            if key.quota == Some(0) {
                return Err(ValidationError::ZeroQuota(key.id.clone()));
            }
        }
        Ok(())
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiKeyConfig {
    /// Opaque identifier, safe to log
    pub id: String,
    /// `env:NAME` reads the secret from the environment, anything else is
    /// taken literally
    pub secret_ref: String,
    /// Calls allowed per quota window. Unlimited when absent.
    pub quota: Option<u32>,
}

impl ApiKeyConfig {
    pub fn resolve_secret(&self) -> Result<String, ValidationError> {
        match self.secret_ref.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .map_err(|_| ValidationError::MissingSecret(self.id.clone(), var.to_string())),
            None => Ok(self.secret_ref.clone()),
        }
    }
}
