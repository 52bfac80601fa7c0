//! Configuration for the entity sync layer
//!
//! The sync layer accepts already-parsed values: a server address, an
//! access token, request/heartbeat timing, reconnect tuning, and whether
//! the store may write to the remote source. [`SyncConfig::from_env`] is the
//! only loader; there is no config-file format.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::SyncConfig;
//!
//! let config = SyncConfig::from_env()?;
//! config.validate()?;
//! ```

mod error;

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::{ConfigError, ConfigResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: u32 = 2;

/// Exponential backoff tuning for the reconnect loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    #[serde(with = "millis", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts
    #[serde(with = "millis", default = "default_max_backoff")]
    pub max_backoff: Duration,
    /// Factor applied to the delay after each failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Settings for one sync layer instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server address; `http(s)://host:port` or a full `ws(s)://` URL
    pub url: String,
    /// Long-lived access token
    pub token: String,
    /// How long a request waits for its correlated result
    #[serde(with = "millis", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Interval between heartbeat pings on an idle session
    #[serde(with = "millis", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Refuse writes to remote-backed variables (computed outputs excepted)
    #[serde(default)]
    pub read_only: bool,
}

impl SyncConfig {
    /// Create a config with default timing for the given server and token
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectConfig::default(),
            read_only: false,
        }
    }

    /// Load configuration from environment variables
    ///
    /// `HA_URL` and `HA_TOKEN` are required. Optional: `HA_READ_ONLY`,
    /// `HA_REQUEST_TIMEOUT_MS`, `HA_HEARTBEAT_MS`, `HA_RECONNECT_INITIAL_MS`,
    /// `HA_RECONNECT_MAX_MS`.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let required = |var: &str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingVar {
                    var: var.to_string(),
                })
        };
        let millis_or = |var: &str, default: Duration| -> ConfigResult<Duration> {
            match lookup(var) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| ConfigError::InvalidValue {
                        key: var.to_string(),
                        reason: e.to_string(),
                    }),
                None => Ok(default),
            }
        };

        let read_only = match lookup("HA_READ_ONLY").as_deref().map(str::trim) {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "HA_READ_ONLY".to_string(),
                    reason: format!("expected true/false, got '{}'", other),
                })
            }
        };

        let config = Self {
            url: required("HA_URL")?,
            token: required("HA_TOKEN")?,
            request_timeout: millis_or("HA_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT)?,
            heartbeat_interval: millis_or("HA_HEARTBEAT_MS", DEFAULT_HEARTBEAT_INTERVAL)?,
            reconnect: ReconnectConfig {
                initial_backoff: millis_or("HA_RECONNECT_INITIAL_MS", DEFAULT_INITIAL_BACKOFF)?,
                max_backoff: millis_or("HA_RECONNECT_MAX_MS", DEFAULT_MAX_BACKOFF)?,
                multiplier: DEFAULT_MULTIPLIER,
            },
            read_only,
        };
        debug!(url = %config.url, read_only = config.read_only, "Loaded sync configuration");
        Ok(config)
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |key: &str, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.url.trim().is_empty() {
            return Err(invalid("url", "must not be empty"));
        }
        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
        {
            return Err(invalid("url", "expected an http(s):// or ws(s):// address"));
        }
        if self.token.trim().is_empty() {
            return Err(invalid("token", "must not be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout", "must be greater than zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval", "must be greater than zero"));
        }
        if self.reconnect.initial_backoff.is_zero() {
            return Err(invalid("reconnect.initial_backoff", "must be greater than zero"));
        }
        if self.reconnect.max_backoff < self.reconnect.initial_backoff {
            return Err(invalid(
                "reconnect.max_backoff",
                "must not be smaller than initial_backoff",
            ));
        }
        if self.reconnect.multiplier < 1 {
            return Err(invalid("reconnect.multiplier", "must be at least 1"));
        }
        Ok(())
    }

    /// WebSocket URL derived from the configured address
    ///
    /// HTTP base URLs map to the `/api/websocket` endpoint; WebSocket URLs
    /// are used as given.
    pub fn ws_url(&self) -> String {
        let url = self.url.trim_end_matches('/');
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return url.to_string();
        }
        let url = url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{}/api/websocket", url)
    }
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

fn default_multiplier() -> u32 {
    DEFAULT_MULTIPLIER
}

/// Durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
