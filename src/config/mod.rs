use crate::utils::error::{Result, RpcPoolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Raw pool settings as written in the config file.
///
/// Durations are milliseconds. `0` means "use the default"; a negative value
/// disables the feature where that makes sense (read/write/idle timeouts and
/// the idle reaper).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub min_idle: usize,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: i64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: i64,
    #[serde(default)]
    pub write_timeout_ms: i64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
    #[serde(default)]
    pub pool_timeout_ms: i64,
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: i64,
    #[serde(default = "default_recovery_backoff_ms")]
    pub recovery_backoff_ms: i64,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
const DEFAULT_ENDPOINT: &str = "localhost:9090";
const DEFAULT_POOL_SIZE: usize = 100;
const DEFAULT_DIAL_TIMEOUT_MS: i64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: i64 = 3_000;
const DEFAULT_IDLE_TIMEOUT_MS: i64 = 10_000;
const DEFAULT_IDLE_CHECK_INTERVAL_MS: i64 = 60_000;
const DEFAULT_RECOVERY_BACKOFF_MS: i64 = 1_000;

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_dial_timeout_ms() -> i64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

fn default_read_timeout_ms() -> i64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> i64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_idle_check_interval_ms() -> i64 {
    DEFAULT_IDLE_CHECK_INTERVAL_MS
}

fn default_recovery_backoff_ms() -> i64 {
    DEFAULT_RECOVERY_BACKOFF_MS
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
            endpoint: default_endpoint(),
            pool_size: default_pool_size(),
            min_idle: 0,
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: 0,
            idle_timeout_ms: default_idle_timeout_ms(),
            pool_timeout_ms: 0,
            idle_check_interval_ms: default_idle_check_interval_ms(),
            recovery_backoff_ms: default_recovery_backoff_ms(),
            max_retries: 0,
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

/// Resolved pool settings. Every field holds a usable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// `host:port` of the remote endpoint.
    pub endpoint: String,
    /// Maximum number of concurrent checkouts.
    pub capacity: usize,
    /// Idle connections the pool keeps warm.
    pub min_idle: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// `None` disables staleness.
    pub idle_timeout: Option<Duration>,
    /// How long `get` waits for an admission slot.
    pub pool_timeout: Duration,
    /// `None` disables the reaper.
    pub idle_check_interval: Option<Duration>,
    /// Sleep between dial probes while the breaker is open.
    pub recovery_backoff: Duration,
    pub max_retries: u32,
}

impl PoolOptions {
    /// Options for `endpoint` with every other setting at its default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        PoolConfig {
            endpoint: endpoint.into(),
            ..PoolConfig::default()
        }
        .resolve()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.idle_check_interval = interval;
        self
    }

    pub fn with_recovery_backoff(mut self, backoff: Duration) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    pub fn with_io_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Replace unusable values (zero capacity, zero timeouts) with defaults
    /// and clamp `min_idle` to `capacity`.
    pub fn normalized(mut self) -> Self {
        if self.endpoint.trim().is_empty() {
            self.endpoint = default_endpoint();
        }
        if self.capacity == 0 {
            self.capacity = DEFAULT_POOL_SIZE;
        }
        self.min_idle = self.min_idle.min(self.capacity);
        if self.dial_timeout.is_zero() {
            self.dial_timeout = millis(DEFAULT_DIAL_TIMEOUT_MS);
        }
        if self.pool_timeout.is_zero() {
            self.pool_timeout = default_pool_timeout(self.read_timeout);
        }
        self.idle_timeout = self.idle_timeout.filter(|t| !t.is_zero());
        self.idle_check_interval = self.idle_check_interval.filter(|t| !t.is_zero());
        self.read_timeout = self.read_timeout.filter(|t| !t.is_zero());
        self.write_timeout = self.write_timeout.filter(|t| !t.is_zero());
        if self.recovery_backoff.is_zero() {
            self.recovery_backoff = millis(DEFAULT_RECOVERY_BACKOFF_MS);
        }
        self
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

// 0 -> default, negative -> disabled
fn optional_millis(ms: i64, default_ms: i64) -> Option<Duration> {
    match ms {
        0 => Some(millis(default_ms)),
        ms if ms < 0 => None,
        ms => Some(millis(ms)),
    }
}

fn default_pool_timeout(read_timeout: Option<Duration>) -> Duration {
    read_timeout.unwrap_or_default() + Duration::from_secs(1)
}

impl PoolConfig {
    /// Apply defaults and produce the options the pool runs with.
    pub fn resolve(&self) -> PoolOptions {
        let read_timeout = optional_millis(self.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS);
        let write_timeout = match self.write_timeout_ms {
            0 => read_timeout,
            ms if ms < 0 => None,
            ms => Some(millis(ms)),
        };
        let dial_timeout = if self.dial_timeout_ms > 0 {
            millis(self.dial_timeout_ms)
        } else {
            millis(DEFAULT_DIAL_TIMEOUT_MS)
        };
        let pool_timeout = if self.pool_timeout_ms > 0 {
            millis(self.pool_timeout_ms)
        } else {
            default_pool_timeout(read_timeout)
        };
        let recovery_backoff = if self.recovery_backoff_ms > 0 {
            millis(self.recovery_backoff_ms)
        } else {
            millis(DEFAULT_RECOVERY_BACKOFF_MS)
        };

        PoolOptions {
            endpoint: self.endpoint.clone(),
            capacity: self.pool_size,
            min_idle: self.min_idle,
            dial_timeout,
            read_timeout,
            write_timeout,
            idle_timeout: optional_millis(self.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS),
            pool_timeout,
            idle_check_interval: optional_millis(
                self.idle_check_interval_ms,
                DEFAULT_IDLE_CHECK_INTERVAL_MS,
            ),
            recovery_backoff,
            max_retries: self.max_retries,
        }
        .normalized()
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RpcPoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| RpcPoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.pool.endpoint.trim();
        if endpoint.is_empty() {
            return Err(RpcPoolError::Config(
                "pool.endpoint cannot be empty".to_string(),
            ));
        }

        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(RpcPoolError::Config(format!(
                    "Invalid pool.endpoint: {}. Expected host:port",
                    endpoint
                )))
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(RpcPoolError::Config(format!(
                "Invalid logging format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
endpoint = "localhost:9090"
pool_size = 100                 # maximum concurrent checkouts
min_idle = 0                    # idle connections kept warm
dial_timeout_ms = 5000
read_timeout_ms = 3000          # -1 disables
write_timeout_ms = 0            # 0 = same as read_timeout_ms, -1 disables
idle_timeout_ms = 10000         # -1 disables staleness checks
pool_timeout_ms = 0             # 0 = read_timeout_ms + 1000
idle_check_interval_ms = 60000  # -1 disables the idle reaper
recovery_backoff_ms = 1000
max_retries = 0

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            RpcPoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
