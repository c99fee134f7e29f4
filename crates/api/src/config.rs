//! Application configuration loaded from environment variables.

use std::time::Duration;

use messaging::RetryPolicy;
use saga::SagaConfig;

/// Log line format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Plain
        }
    }
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` bind address (default: `"0.0.0.0"`)
/// - `PORT` listen port (default: `3000`)
/// - `RUST_LOG` tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` `json` for JSON lines, anything else for plain text
/// - `DATABASE_URL` Postgres stores when set, in-memory stores otherwise
/// - `AMQP_URL` RabbitMQ broker; needs the `amqp` feature
/// - `SAGA_TIMEOUT_SECS` (900), `COMPENSATION_TIMEOUT_SECS` (300),
///   `RESERVATION_TTL_SECS` (1800), `SWEEP_INTERVAL_SECS` (30),
///   `PUBLISH_TIMEOUT_MS` (5000), `HANDLER_MAX_ATTEMPTS` (5)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub amqp_url: Option<String>,
    pub saga_timeout: Duration,
    pub compensation_timeout: Duration,
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub publish_timeout: Duration,
    pub handler_max_attempts: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            database_url: non_empty("DATABASE_URL"),
            amqp_url: non_empty("AMQP_URL"),
            saga_timeout: parsed("SAGA_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_timeout),
            compensation_timeout: parsed("COMPENSATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.compensation_timeout),
            reservation_ttl: parsed("RESERVATION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reservation_ttl),
            sweep_interval: parsed("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            publish_timeout: parsed("PUBLISH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_timeout),
            handler_max_attempts: parsed("HANDLER_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.handler_max_attempts),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig {
            saga_timeout: self.saga_timeout,
            compensation_timeout: self.compensation_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.handler_max_attempts)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Plain,
            database_url: None,
            amqp_url: None,
            saga_timeout: Duration::from_secs(900),
            compensation_timeout: Duration::from_secs(300),
            reservation_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(30),
            publish_timeout: Duration::from_millis(5000),
            handler_max_attempts: 5,
        }
    }
}
