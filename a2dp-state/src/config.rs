//! Configuration for the A2DP connection manager
//!
//! Capacity and quiet mode are process-wide and fixed once the manager is
//! built. The connect timeout bounds how long an outgoing or incoming
//! connection may stay unconfirmed by the stack.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{A2dpError, Result};

/// Environment variable overriding `max_connections`
pub const ENV_MAX_CONNECTIONS: &str = "A2DP_MAX_CONNECTIONS";
/// Environment variable overriding `quiet_mode` (`1`/`true`/`yes`/`on`)
pub const ENV_QUIET_MODE: &str = "A2DP_QUIET_MODE";
/// Environment variable overriding `connect_timeout`, in milliseconds
pub const ENV_CONNECT_TIMEOUT_MS: &str = "A2DP_CONNECT_TIMEOUT_MS";

/// Configuration for the [`A2dpManager`](crate::A2dpManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of simultaneously connected peers
    /// Default: 1
    pub max_connections: usize,

    /// Refuse connections we did not initiate ourselves
    /// Default: false
    pub quiet_mode: bool,

    /// How long a connect attempt may go unconfirmed before it is failed
    /// Default: 30 seconds
    pub connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            quiet_mode: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Create a ManagerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Two simultaneous sinks, as used for multicast playback
    pub fn multicast() -> Self {
        Self {
            max_connections: 2,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_quiet_mode(mut self, quiet_mode: bool) -> Self {
        self.quiet_mode = quiet_mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Defaults overridden by `A2DP_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment lookup
    pub(crate) fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS) {
            self.max_connections = raw.trim().parse().map_err(|_| {
                A2dpError::Configuration(format!("{ENV_MAX_CONNECTIONS}: not a number: {raw}"))
            })?;
        }

        if let Some(raw) = lookup(ENV_QUIET_MODE) {
            self.quiet_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(A2dpError::Configuration(format!(
                        "{ENV_QUIET_MODE}: expected a boolean: {raw}"
                    )))
                }
            };
        }

        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                A2dpError::Configuration(format!("{ENV_CONNECT_TIMEOUT_MS}: not a number: {raw}"))
            })?;
            self.connect_timeout = Duration::from_millis(millis);
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(A2dpError::Configuration(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(A2dpError::Configuration(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether more than one peer may be connected at once
    pub fn is_multi_device(&self) -> bool {
        self.max_connections > 1
    }
}
