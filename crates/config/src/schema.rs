use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsyncConfig {
    /// Node identity; must be unique across the fleet. No default.
    pub instance_id: String,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process backend: single-node runs and tests.
    Memory,
    /// Redis pub/sub + lists: the production fleet fabric.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis_url: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret internal publishers present on the ingress API.
    /// When unset, internal endpoints accept unauthenticated calls
    /// (development only).
    pub service_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub rate_max_requests: usize,
    pub rate_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: streamsync_protocol::MAX_CONNECTIONS,
            rate_max_requests: streamsync_protocol::RATE_LIMIT_MAX_REQUESTS,
            rate_window_secs: streamsync_protocol::RATE_LIMIT_WINDOW.as_secs(),
        }
    }
}

impl StreamsyncConfig {
    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_id.is_empty() {
            anyhow::bail!("INSTANCE_ID is required and must be unique per node");
        }
        if self.broker.backend == BrokerBackend::Redis && self.broker.redis_url.is_none() {
            anyhow::bail!("broker.redis_url (or REDIS_URL) is required for the redis backend");
        }
        Ok(())
    }
}
