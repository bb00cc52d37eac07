// ── Runtime engine configuration ──
//
// These types describe how to reach the hub and how the engine behaves.
// They carry the access token and tuning knobs, but never touch disk.
// The CLI builds a `HubConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use hubwatch_api::{ClientConfig, Credentials, ReconnectConfig};

use crate::error::CoreError;

/// Longest interval or timeout the engine accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What the tracker does when it is full and holds only pending operations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Drop the oldest pending operation, marking it failed first so any
    /// waiter is released.
    #[default]
    EvictOldestPending,
    /// Refuse the new operation with `CapacityExhausted`.
    RejectNew,
}

/// Operation tracker limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Hard cap on tracked operations, terminal ones included.
    pub max_operations: usize,
    /// How long terminal operations stay queryable.
    pub retention: Duration,
    pub eviction: EvictionPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            retention: Duration::from_secs(300),
            eviction: EvictionPolicy::default(),
        }
    }
}

/// Connection supervision cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How often to ping the hub while connected.
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
    /// How often to expire and prune tracked operations.
    pub cleanup_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(10),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

/// Command issuing defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// How long to wait for the hub's synchronous accept/reject.
    pub command_timeout: Duration,
    /// Verification deadline for commands that don't set their own.
    pub default_operation_timeout: Duration,
    /// Commands in flight at once during a bulk run.
    pub bulk_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            default_operation_timeout: Duration::from_secs(30),
            bulk_concurrency: 8,
        }
    }
}

/// Everything needed to run the engine against one hub.
///
/// Built by the CLI, passed to `Hub`. Core never reads config files.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket endpoint (e.g. `ws://homeassistant.local:8123/api/websocket`).
    pub url: Url,
    pub access_token: SecretString,
    pub client: ClientConfig,
    pub tracker: TrackerConfig,
    pub supervisor: SupervisorConfig,
    pub executor: ExecutorConfig,
}

impl HubConfig {
    /// Config with default tuning.
    pub fn new(url: Url, access_token: SecretString) -> Self {
        Self {
            url,
            access_token,
            client: ClientConfig::default(),
            tracker: TrackerConfig::default(),
            supervisor: SupervisorConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            url: self.url.clone(),
            access_token: self.access_token.clone(),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !matches!(self.url.scheme(), "ws" | "wss") {
            return Err(CoreError::config(format!(
                "hub URL must use ws:// or wss://, got {}://",
                self.url.scheme()
            )));
        }
        if self.tracker.max_operations == 0 {
            return Err(CoreError::config("max_operations must be at least 1"));
        }
        if self.executor.bulk_concurrency == 0 {
            return Err(CoreError::config("bulk_concurrency must be at least 1"));
        }

        let intervals = [
            ("health_check_interval", self.supervisor.health_check_interval),
            ("ping_timeout", self.supervisor.ping_timeout),
            ("cleanup_interval", self.supervisor.cleanup_interval),
            ("command_timeout", self.executor.command_timeout),
            ("default_operation_timeout", self.executor.default_operation_timeout),
            ("handshake_timeout", self.client.handshake_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(CoreError::config(format!("{name} must be greater than zero")));
        }

        let mut bounded = intervals.into_iter().chain([
            ("request_timeout", self.client.request_timeout),
            ("retention", self.tracker.retention),
            ("backoff_max", self.supervisor.reconnect.max_delay),
        ]);
        if let Some((name, _)) = bounded.find(|(_, d)| *d > MAX_INTERVAL) {
            return Err(CoreError::config(format!("{name} must not exceed 365 days")));
        }

        if self.supervisor.reconnect.initial_delay > self.supervisor.reconnect.max_delay {
            return Err(CoreError::config(
                "reconnect initial delay must not exceed the maximum delay",
            ));
        }
        Ok(())
    }
}
