//! Configuration
//!
//! Two layers of settings:
//!
//! - [`ReactorConfig`]: per-reactor tuning (pool sizing, worker ticks, token
//!   renewal policy). Loadable from TOML plus `FEEDMUX_` environment variables.
//! - [`ConnectOptions`]: per-channel settings given to `Reactor::connect`.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::setup::SetupPlan;
use crate::stats::StatisticsFlags;
use crate::token::{OAuthCredentials, TokenConfig};
use crate::transport::Endpoint;
use crate::types::serde_millis;

pub use crate::reconnect::ReconnectConfig;

// ----------------------------------------------------------------------------
// Reactor Configuration
// ----------------------------------------------------------------------------

/// Tuning for one reactor and its worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Channel slots allocated up front
    pub channel_pool_size: usize,
    /// Upper bound on the pool; it grows on demand until this limit
    pub max_channels: usize,
    /// Longest the worker sleeps when nothing is scheduled
    #[serde(with = "serde_millis")]
    pub worker_idle_tick: Duration,
    /// Shortest worker sleep, bounding ping-timer resolution from below
    #[serde(with = "serde_millis")]
    pub worker_min_tick: Duration,
    /// Polling cadence for links that are initializing or flushing
    #[serde(with = "serde_millis")]
    pub poll_interval: Duration,
    pub token: TokenConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            channel_pool_size: 10,
            max_channels: 1024,
            worker_idle_tick: Duration::from_secs(1),
            worker_min_tick: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            token: TokenConfig::default(),
        }
    }
}

impl ReactorConfig {
    /// Small pool and short ticks for tests
    pub fn testing() -> Self {
        Self {
            channel_pool_size: 2,
            max_channels: 16,
            worker_idle_tick: Duration::from_millis(100),
            worker_min_tick: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            token: TokenConfig {
                reissue_attempt_limit: Some(3),
                reissue_attempt_interval: Duration::from_secs(1),
                ..TokenConfig::default()
            },
        }
    }

    /// Load with priority: environment (`FEEDMUX_`, `__` separates nesting),
    /// then the TOML file at `path`, then defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FEEDMUX_").split("__"));

        let config: ReactorConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML text layered over defaults
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: ReactorConfig = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_pool_size > self.max_channels {
            return Err(ConfigError::invalid(format!(
                "channel_pool_size ({}) exceeds max_channels ({})",
                self.channel_pool_size, self.max_channels
            )));
        }
        if self.max_channels == 0 {
            return Err(ConfigError::invalid("max_channels must be at least 1"));
        }
        if self.worker_min_tick.is_zero() || self.worker_min_tick > self.worker_idle_tick {
            return Err(ConfigError::invalid(
                "worker_min_tick must be non-zero and not exceed worker_idle_tick",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval must be non-zero"));
        }
        self.token.validate()
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// One candidate server in a channel's connection list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Fixed endpoint; `None` resolves through service discovery
    pub endpoint: Option<Endpoint>,
    /// Location filter used by service discovery
    #[serde(default)]
    pub location: Option<String>,
    /// Deadline for link initialization plus the setup handshake
    #[serde(with = "serde_millis", default = "default_initialization_timeout")]
    pub initialization_timeout: Duration,
    /// Obtain tokens for this connection through the channel's token session
    #[serde(default)]
    pub enable_session_management: bool,
}

fn default_initialization_timeout() -> Duration {
    Duration::from_secs(60)
}

impl ConnectionInfo {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            location: None,
            initialization_timeout: default_initialization_timeout(),
            enable_session_management: false,
        }
    }

    /// Session-managed connection resolved through service discovery
    pub fn discovered(location: Option<String>) -> Self {
        Self {
            endpoint: None,
            location,
            initialization_timeout: default_initialization_timeout(),
            enable_session_management: true,
        }
    }

    pub fn with_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = timeout;
        self
    }

    pub fn with_session_management(mut self, enabled: bool) -> Self {
        self.enable_session_management = enabled;
        self
    }
}

/// Keep-alive settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingConfig {
    /// Inbound silence after which the channel is considered dead; pings are
    /// sent after a third of this without outbound traffic
    #[serde(with = "serde_millis")]
    pub timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl PingConfig {
    /// Outbound silence after which a ping is written
    pub fn send_interval(&self) -> Duration {
        self.timeout / 3
    }
}

/// Settings for one `Reactor::connect` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub connections: Vec<ConnectionInfo>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub statistics: StatisticsFlags,
    #[serde(default)]
    pub setup: SetupPlan,
    #[serde(default)]
    pub credentials: Option<OAuthCredentials>,
}

impl ConnectOptions {
    pub fn new(connections: Vec<ConnectionInfo>) -> Self {
        Self {
            connections,
            reconnect: ReconnectConfig::default(),
            ping: PingConfig::default(),
            statistics: StatisticsFlags::default(),
            setup: SetupPlan::default(),
            credentials: None,
        }
    }

    /// Single fixed endpoint with defaults
    pub fn single(endpoint: Endpoint) -> Self {
        Self::new(vec![ConnectionInfo::new(endpoint)])
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping.timeout = timeout;
        self
    }

    pub fn with_statistics(mut self, statistics: StatisticsFlags) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_setup(mut self, setup: SetupPlan) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_credentials(mut self, credentials: OAuthCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn is_session_managed(&self) -> bool {
        self.connections
            .iter()
            .any(|connection| connection.enable_session_management)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections.is_empty() {
            return Err(ConfigError::invalid("connection list is empty"));
        }
        for (index, connection) in self.connections.iter().enumerate() {
            if connection.endpoint.is_none() && !connection.enable_session_management {
                return Err(ConfigError::invalid(format!(
                    "connection {} has no endpoint and is not session-managed",
                    index
                )));
            }
            if connection.initialization_timeout.is_zero() {
                return Err(ConfigError::invalid(format!(
                    "connection {} has a zero initialization timeout",
                    index
                )));
            }
        }
        if self.is_session_managed() && self.credentials.is_none() {
            return Err(ConfigError::invalid(
                "session-managed connections require credentials",
            ));
        }
        if let Some(credentials) = &self.credentials {
            credentials.validate()?;
        }
        if self.ping.timeout < Duration::from_millis(3) {
            return Err(ConfigError::invalid("ping timeout must be at least 3ms"));
        }
        self.reconnect.validate()?;
        self.setup.validate()
    }
}
