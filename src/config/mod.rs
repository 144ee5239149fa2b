use crate::utils::error::{ConnPoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connection limit for endpoints that don't carry their own
    #[serde(default = "default_max_connections")]
    pub default_max_connections: usize,
    /// Maximum idle connections kept per endpoint
    #[serde(default = "default_max_idle_per_endpoint")]
    pub max_idle_per_endpoint: usize,
    /// How long to keep idle connections alive (seconds, 0 = forever)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Timeout for establishing new connections (milliseconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time (seconds)
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_max_connections() -> usize {
    1
}

fn default_max_idle_per_endpoint() -> usize {
    4
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_tcp_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_max_connections: default_max_connections(),
            max_idle_per_endpoint: default_max_idle_per_endpoint(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a duration, `None` when idle connections never expire.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// How often the background task sweeps expired idle connections.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.idle_timeout().map(|timeout| {
            (timeout / 2)
                .max(Duration::from_secs(1))
                .min(Duration::from_secs(30))
        })
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            tcp_nodelay: default_tcp_nodelay(),
            keepalive_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConnPoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConnPoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.default_max_connections == 0 {
            return Err(ConnPoolError::Config(
                "pool.default_max_connections must be at least 1".to_string(),
            ));
        }

        if self.connector.connect_timeout_ms == 0 {
            return Err(ConnPoolError::Config(
                "connector.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if matches!(self.connector.keepalive_secs, Some(0)) {
            return Err(ConnPoolError::Config(
                "connector.keepalive_secs must be greater than 0 when set".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConnPoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
default_max_connections = 1   # Used when the endpoint carries no limit of its own
max_idle_per_endpoint = 4
idle_timeout_secs = 90        # 0 keeps idle connections forever

[connector]
connect_timeout_ms = 5000
tcp_nodelay = true
# keepalive_secs = 60

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            ConnPoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
