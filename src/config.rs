//! Engine configuration.
//!
//! A [`Config`] is built once at startup (defaults, then an optional TOML file,
//! then command line overrides), validated, and shared read-only as
//! `Arc<Config>` by every component.
//!
//! # Example
//!
//! ```
//! use refresher_core::Config;
//!
//! let config = Config::from_toml_str(r#"
//!     worker_pool_size = 4
//!     polling_scheduler = "entry_frequency"
//!
//!     [[host_limits]]
//!     host = "example.com"
//!     connections = 2
//!     rate = 0.5
//! "#).unwrap();
//!
//! assert_eq!(config.worker_pool_size, 4);
//! assert_eq!(config.host_connection_limit("feeds.example.com"), 2);
//! assert_eq!(config.host_limits_for("feeds.example.com").rate, 0.5);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Default number of concurrent refresh workers.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

/// Default number of jobs selected per scheduling cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default per-host connection cap.
pub const DEFAULT_HOST_CONNECTIONS: usize = 8;

const MAX_WORKER_POOL_SIZE: usize = 1024;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown fields.
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Next-check policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingScheduler {
    /// Every feed is checked at the configured polling frequency.
    #[default]
    RoundRobin,
    /// The interval follows the number of entries published last week.
    EntryFrequency,
}

/// Per-host override of the connection cap and request rate.
///
/// Unset fields fall back to [`Config::host_connections`] and
/// [`Config::host_rate`].
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostLimitRule {
    /// Hostname or domain suffix, e.g. `example.com`.
    pub host: String,
    /// Maximum concurrent connections, 0 for unlimited.
    #[serde(default)]
    pub connections: Option<usize>,
    /// Requests per second, 0 for unlimited.
    #[serde(default)]
    pub rate: Option<f64>,
}

/// Limits resolved for one hostname.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLimits {
    /// Maximum concurrent connections, 0 for unlimited.
    pub connections: usize,
    /// Requests per second, 0 for unlimited.
    pub rate: f64,
}

/// Immutable configuration shared by the engine components.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub worker_pool_size: usize,
    pub batch_size: usize,
    pub polling_frequency_minutes: i64,
    pub polling_scheduler: PollingScheduler,
    pub scheduler_round_robin_max_interval_minutes: i64,
    pub scheduler_entry_frequency_min_interval_minutes: i64,
    pub scheduler_entry_frequency_max_interval_minutes: i64,
    pub scheduler_entry_frequency_factor: i64,
    /// 0 disables the error-limit batch filter.
    pub polling_parsing_error_limit: i64,

    pub cleanup_frequency_hours: u64,
    pub cleanup_archive_read_days: i64,
    pub cleanup_archive_batch_size: i64,
    pub cleanup_remove_sessions_days: i64,

    pub http_client_timeout_secs: u64,
    pub http_client_max_body_size_mb: u64,
    pub http_client_user_agent: String,
    /// Application proxy used by feeds that opt in with `fetch_via_proxy`.
    pub http_client_proxy: Option<String>,
    /// Proxies rotated across requests that have no explicit proxy.
    pub http_client_proxies: Vec<String>,

    /// Default connection cap for hosts without a rule, 0 for unlimited.
    pub host_connections: usize,
    /// Default request rate per host in requests per second, 0 for unlimited.
    pub host_rate: f64,
    pub host_limits: Vec<HostLimitRule>,

    pub database_url: String,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            polling_frequency_minutes: 60,
            polling_scheduler: PollingScheduler::RoundRobin,
            scheduler_round_robin_max_interval_minutes: 1440,
            scheduler_entry_frequency_min_interval_minutes: 5,
            scheduler_entry_frequency_max_interval_minutes: 1440,
            scheduler_entry_frequency_factor: 1,
            polling_parsing_error_limit: 3,
            cleanup_frequency_hours: 24,
            cleanup_archive_read_days: 60,
            cleanup_archive_batch_size: 10_000,
            cleanup_remove_sessions_days: 30,
            http_client_timeout_secs: 20,
            http_client_max_body_size_mb: 15,
            http_client_user_agent: crate::user_agent::default_user_agent(),
            http_client_proxy: None,
            http_client_proxies: Vec::new(),
            host_connections: DEFAULT_HOST_CONNECTIONS,
            host_rate: 0.0,
            host_limits: Vec::new(),
            database_url: "sqlite:refresher.db?mode=rwc".to_string(),
            log_level: None,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config file");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks value ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WORKER_POOL_SIZE).contains(&self.worker_pool_size) {
            return Err(ConfigError::invalid(
                "worker_pool_size",
                format!(
                    "{} is outside 1..={MAX_WORKER_POOL_SIZE}",
                    self.worker_pool_size
                ),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.polling_frequency_minutes < 1 {
            return Err(ConfigError::invalid(
                "polling_frequency_minutes",
                "must be at least 1",
            ));
        }
        if self.scheduler_round_robin_max_interval_minutes < self.polling_frequency_minutes {
            return Err(ConfigError::invalid(
                "scheduler_round_robin_max_interval_minutes",
                "must not be lower than polling_frequency_minutes",
            ));
        }
        if self.scheduler_entry_frequency_min_interval_minutes < 1 {
            return Err(ConfigError::invalid(
                "scheduler_entry_frequency_min_interval_minutes",
                "must be at least 1",
            ));
        }
        if self.scheduler_entry_frequency_max_interval_minutes
            < self.scheduler_entry_frequency_min_interval_minutes
        {
            return Err(ConfigError::invalid(
                "scheduler_entry_frequency_max_interval_minutes",
                "must not be lower than the minimum interval",
            ));
        }
        if self.scheduler_entry_frequency_factor < 1 {
            return Err(ConfigError::invalid(
                "scheduler_entry_frequency_factor",
                "must be at least 1",
            ));
        }
        if self.polling_parsing_error_limit < 0 {
            return Err(ConfigError::invalid(
                "polling_parsing_error_limit",
                "must not be negative",
            ));
        }
        if self.cleanup_frequency_hours == 0 {
            return Err(ConfigError::invalid(
                "cleanup_frequency_hours",
                "must be at least 1",
            ));
        }
        if !(1..=3600).contains(&self.http_client_timeout_secs) {
            return Err(ConfigError::invalid(
                "http_client_timeout_secs",
                format!("{} is outside 1..=3600", self.http_client_timeout_secs),
            ));
        }
        if self.http_client_max_body_size_mb == 0 {
            return Err(ConfigError::invalid(
                "http_client_max_body_size_mb",
                "must be at least 1",
            ));
        }
        for proxy in self
            .http_client_proxy
            .iter()
            .chain(self.http_client_proxies.iter())
        {
            if url::Url::parse(proxy).is_err() {
                return Err(ConfigError::invalid(
                    "http_client_proxy",
                    format!("{proxy:?} is not a valid URL"),
                ));
            }
        }
        if !valid_rate(self.host_rate) {
            return Err(ConfigError::invalid(
                "host_rate",
                format!("{} is not a finite, non-negative rate", self.host_rate),
            ));
        }
        for rule in &self.host_limits {
            if rule.host.trim().is_empty() {
                return Err(ConfigError::invalid("host_limits", "empty host"));
            }
            if let Some(rate) = rule.rate.filter(|rate| !valid_rate(*rate)) {
                return Err(ConfigError::invalid(
                    "host_limits",
                    format!("rate {rate} for {} is not a finite, non-negative rate", rule.host),
                ));
            }
        }
        Ok(())
    }

    /// Per-request timeout.
    #[must_use]
    pub fn http_client_timeout(&self) -> Duration {
        Duration::from_secs(self.http_client_timeout_secs)
    }

    /// Maximum accepted response body, in bytes.
    #[must_use]
    pub fn http_client_max_body_size(&self) -> u64 {
        self.http_client_max_body_size_mb.saturating_mul(1024 * 1024)
    }

    /// Resolves the connection cap for `hostname`.
    #[must_use]
    pub fn host_connection_limit(&self, hostname: &str) -> usize {
        self.host_limits_for(hostname).connections
    }

    /// Resolves the connection cap and request rate for `hostname`.
    ///
    /// An exact rule wins, then the longest rule that is a dot-separated
    /// suffix of the hostname. Fields the rule leaves unset, or every field
    /// when no rule matches, come from [`host_connections`](Self::host_connections)
    /// and [`host_rate`](Self::host_rate).
    #[must_use]
    pub fn host_limits_for(&self, hostname: &str) -> HostLimits {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        let rule = self
            .host_limits
            .iter()
            .filter_map(|rule| {
                let host = rule.host.trim().trim_start_matches('.').to_ascii_lowercase();
                let matches = hostname == host
                    || hostname
                        .strip_suffix(host.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'));
                matches.then_some((host.len(), rule))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, rule)| rule);
        HostLimits {
            connections: rule
                .and_then(|rule| rule.connections)
                .unwrap_or(self.host_connections),
            rate: rule.and_then(|rule| rule.rate).unwrap_or(self.host_rate),
        }
    }
}

fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate >= 0.0
}
