//! Configuration types for the relay.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen socket configuration.
    pub listen: ListenConfig,
    /// Liveness probe configuration.
    pub heartbeat: HeartbeatConfig,
    /// Request handling configuration.
    pub requests: RequestConfig,
    /// Per-instance command queue configuration.
    pub queue: QueueConfig,
    /// Idempotency cache configuration.
    pub cache: CacheConfig,
}

impl RelayConfig {
    /// Loads configuration from `relay.toml` (or an explicit path) merged
    /// with `RELAY_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let file = path.unwrap_or_else(|| Path::new("relay.toml"));
        Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
    }
}

/// Listen socket configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Host to bind to. Loopback by default; there is no authentication.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
}

impl ListenConfig {
    /// Returns the bind address as `host:port`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: prism_proto::DEFAULT_PORT,
        }
    }
}

/// Liveness probe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Probe cadence. Each probe also waits this long for its reply, so a
    /// lost probe is declared after one interval.
    #[serde(with = "serde_duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Consecutive lost probes before the instance is disconnected.
    pub max_missed: u32,
    /// How long a reloading instance may stay away before its held work
    /// fails.
    #[serde(with = "serde_duration_ms", rename = "reload_grace_ms")]
    pub reload_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_missed: 3,
            reload_grace: Duration::from_secs(30),
        }
    }
}

/// Request handling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline applied when a REQUEST carries no `timeout_ms`.
    #[serde(with = "serde_duration_ms", rename = "default_timeout_ms")]
    pub default_timeout: Duration,
    /// How long a fresh connection may stay silent before its first frame.
    #[serde(with = "serde_duration_ms", rename = "first_frame_timeout_ms")]
    pub first_frame_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            first_frame_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-instance command queue configuration.
///
/// Disabled by default: a BUSY instance rejects further dispatches with
/// `INSTANCE_BUSY` and clients own the retry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Whether BUSY instances buffer commands instead of rejecting them.
    pub enabled: bool,
    /// Maximum buffered commands per instance.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 10,
        }
    }
}

/// Idempotency cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long successful replies are replayed for a repeated request
    /// identifier.
    #[serde(with = "serde_duration_secs", rename = "ttl_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
