//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use pressflow_infra::jobs::{BackoffPolicy, WorkerPoolConfig};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (default: `0.0.0.0:8080`).
    pub bind_addr: SocketAddr,
    /// Worker pool sizing, polling and retry backoff.
    pub worker: WorkerPoolConfig,
    /// Interval between SSE keep-alive comments (default: 15s).
    pub sse_keep_alive: Duration,
    /// Postgres connection string; unset means the in-memory job store.
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            worker: WorkerPoolConfig::default(),
            sse_keep_alive: Duration::from_secs(15),
            database_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default        |
    /// |---------------------------|----------------|
    /// | `BIND_ADDR`               | `0.0.0.0:8080` |
    /// | `WORKER_CONCURRENCY`      | `4`            |
    /// | `WORKER_POLL_INTERVAL_MS` | `250`          |
    /// | `RETRY_BASE_DELAY_MS`     | `1000`         |
    /// | `RETRY_MULTIPLIER`        | `2.0`          |
    /// | `RETRY_MAX_DELAY_MS`      | `300000`       |
    /// | `SSE_KEEP_ALIVE_SECS`     | `15`           |
    /// | `DATABASE_URL`            | unset          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let backoff = BackoffPolicy::default();

        let bind_addr = parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?;

        let concurrency = parse_or(&lookup, "WORKER_CONCURRENCY", defaults.worker.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        let poll_interval = millis_or(
            &lookup,
            "WORKER_POLL_INTERVAL_MS",
            defaults.worker.poll_interval,
        )?;
        let base_delay = millis_or(&lookup, "RETRY_BASE_DELAY_MS", backoff.base_delay)?;
        let max_delay = millis_or(&lookup, "RETRY_MAX_DELAY_MS", backoff.max_delay)?;

        let multiplier: f64 = parse_or(&lookup, "RETRY_MULTIPLIER", backoff.multiplier)?;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "RETRY_MULTIPLIER",
                &multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }

        let keep_alive_secs: u64 = parse_or(
            &lookup,
            "SSE_KEEP_ALIVE_SECS",
            defaults.sse_keep_alive.as_secs(),
        )?;
        if keep_alive_secs == 0 {
            return Err(ConfigError::invalid("SSE_KEEP_ALIVE_SECS", "0", "must be at least 1"));
        }

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Ok(Self {
            bind_addr,
            worker: defaults
                .worker
                .with_concurrency(concurrency)
                .with_poll_interval(poll_interval)
                .with_backoff(
                    BackoffPolicy::exponential(base_delay, multiplier).with_max_delay(max_delay),
                ),
            sse_keep_alive: Duration::from_secs(keep_alive_secs),
            database_url,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.backoff.base_delay, Duration::from_secs(1));
        assert_eq!(config.worker.backoff.multiplier, 2.0);
        assert_eq!(config.worker.backoff.max_delay, Duration::from_secs(300));
        assert_eq!(config.sse_keep_alive, Duration::from_secs(15));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("WORKER_CONCURRENCY", "16"),
            ("WORKER_POLL_INTERVAL_MS", "50"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("RETRY_MULTIPLIER", "2.5"),
            ("RETRY_MAX_DELAY_MS", "60000"),
            ("SSE_KEEP_ALIVE_SECS", "5"),
            ("DATABASE_URL", "postgres://localhost/pressflow"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.worker.concurrency, 16);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(50));
        assert_eq!(config.worker.backoff.delay_for_attempt(2), Duration::from_millis(625));
        assert_eq!(config.worker.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(config.sse_keep_alive, Duration::from_secs(5));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/pressflow"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("BIND_ADDR", "not-an-addr"),
            ("WORKER_CONCURRENCY", "0"),
            ("WORKER_CONCURRENCY", "many"),
            ("RETRY_MULTIPLIER", "0.5"),
            ("RETRY_MULTIPLIER", "NaN"),
            ("SSE_KEEP_ALIVE_SECS", "0"),
        ] {
            match load(&[(key, value)]) {
                Err(ConfigError::Invalid { key: got, .. }) => assert_eq!(got, key),
                Ok(_) => panic!("{key}={value} should be rejected"),
            }
        }
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        assert!(load(&[("DATABASE_URL", "  ")]).unwrap().database_url.is_none());
    }
}
