//! Worker configuration loaded from environment variables.

use std::time::Duration;

use relay::{RelayConfig, RetryPolicy};
use saga::ConsumerConfig;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("pretty") || value.eq_ignore_ascii_case("text") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `DATABASE_URL`: Postgres connection string; unset selects the in-memory store
/// - `DATABASE_MAX_CONNECTIONS` (default 10)
/// - `STORE_TIMEOUT_MS` (5000), `UNIT_TIMEOUT_MS` (10000)
/// - `CONSUMER_CONCURRENCY` (16)
/// - `OUTBOX_BATCH_SIZE` (50), `OUTBOX_INTERVAL_SECS` (5)
/// - `OUTBOX_MAX_ATTEMPTS` (10), `OUTBOX_BASE_BACKOFF_MS` (1000), `OUTBOX_MAX_BACKOFF_MS` (300000)
/// - `PUBLISH_TIMEOUT_MS` (5000)
/// - `SEED_DEMO_LOTS`: seed sample lots into the in-memory store (default false)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` (default) or `pretty`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub store_timeout: Duration,
    pub unit_timeout: Duration,
    pub consumer_concurrency: usize,
    pub outbox_batch_size: usize,
    pub outbox_interval: Duration,
    pub outbox_max_attempts: i32,
    pub outbox_base_backoff: Duration,
    pub outbox_max_backoff: Duration,
    pub publish_timeout: Duration,
    pub seed_demo_lots: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`. Unparseable values fall back to
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parse_var(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            store_timeout: millis("STORE_TIMEOUT_MS", defaults.store_timeout),
            unit_timeout: millis("UNIT_TIMEOUT_MS", defaults.unit_timeout),
            consumer_concurrency: parse_var(&lookup, "CONSUMER_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.consumer_concurrency),
            outbox_batch_size: parse_var(&lookup, "OUTBOX_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.outbox_batch_size),
            outbox_interval: parse_var(&lookup, "OUTBOX_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.outbox_interval),
            outbox_max_attempts: parse_var(&lookup, "OUTBOX_MAX_ATTEMPTS")
                .filter(|n: &i32| *n > 0)
                .unwrap_or(defaults.outbox_max_attempts),
            outbox_base_backoff: millis("OUTBOX_BASE_BACKOFF_MS", defaults.outbox_base_backoff),
            outbox_max_backoff: millis("OUTBOX_MAX_BACKOFF_MS", defaults.outbox_max_backoff),
            publish_timeout: millis("PUBLISH_TIMEOUT_MS", defaults.publish_timeout),
            seed_demo_lots: parse_var(&lookup, "SEED_DEMO_LOTS")
                .unwrap_or(defaults.seed_demo_lots),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            unit_timeout: self.unit_timeout,
            ..ConsumerConfig::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            batch_size: self.outbox_batch_size,
            interval: self.outbox_interval,
            publish_timeout: self.publish_timeout,
            retry: RetryPolicy {
                max_attempts: self.outbox_max_attempts,
                base_backoff: self.outbox_base_backoff,
                max_backoff: self.outbox_max_backoff,
            },
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            database_url: None,
            database_max_connections: 10,
            store_timeout: Duration::from_millis(5000),
            unit_timeout: Duration::from_millis(10_000),
            consumer_concurrency: 16,
            outbox_batch_size: 50,
            outbox_interval: Duration::from_secs(5),
            outbox_max_attempts: 10,
            outbox_base_backoff: Duration::from_millis(1000),
            outbox_max_backoff: Duration::from_millis(300_000),
            publish_timeout: Duration::from_millis(5000),
            seed_demo_lots: false,
        }
    }
}
