//! Worker configuration from environment variables.
//!
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `WORKER_CONCURRENCY`: number of concurrent workers (default: 5)
//! - `ASSET_ROOT`: directory for per-job asset extraction (default: /tmp/assets)
//! - `TRAFFIC_LIMIT_BYTES`: monthly output ceiling (default: 20 TiB)
//! - `TRAFFIC_SAFETY_MARGIN`: fraction of the ceiling actually admitted (default: 0.95)
//! - `QUEUE_RATE_LIMIT_MAX` / `QUEUE_RATE_LIMIT_WINDOW_SECS`: intake ceiling (default: 20 per 60s)
//! - `CLAIM_VISIBILITY_SECS`: how long a claimed task stays hidden from other workers (default: 600)
//! - `SYNC_TIMEOUT_SECS`: synchronous wait ceiling (default: 300)
//! - `RETRY_ATTEMPTS` / `RETRY_BASE_DELAY_MS`: retry budget and backoff base (default: 3, 2000)
//! - `RENDER_TIMEOUT_SECS`: per-run engine timeout (default: 120)
//! - `LOG_FORMAT`: `compact` or `json` (default: compact)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: service name on spans (default: pdf-render-worker)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::queue::{IntakeLimit, RetryPolicy, DEFAULT_CLAIM_VISIBILITY};

const TIB: u64 = 1 << 40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: `{value}`")]
    Invalid { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub concurrency: usize,
    pub asset_root: PathBuf,
    pub traffic_limit_bytes: u64,
    pub traffic_safety_margin: f64,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    pub claim_visibility: Duration,
    pub sync_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub render_timeout: Duration,
    pub log_format: LogFormat,
    pub otel_endpoint: String,
    pub otel_service_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            concurrency: 5,
            asset_root: PathBuf::from("/tmp/assets"),
            traffic_limit_bytes: 20 * TIB,
            traffic_safety_margin: 0.95,
            rate_limit_max: 20,
            rate_limit_window: Duration::from_secs(60),
            claim_visibility: DEFAULT_CLAIM_VISIBILITY,
            sync_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(2000),
            render_timeout: Duration::from_secs(120),
            log_format: LogFormat::Compact,
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_service_name: "pdf-render-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let config = Self {
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            concurrency: parse(&get, "WORKER_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            asset_root: get("ASSET_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.asset_root),
            traffic_limit_bytes: parse(&get, "TRAFFIC_LIMIT_BYTES")?
                .unwrap_or(defaults.traffic_limit_bytes),
            traffic_safety_margin: parse(&get, "TRAFFIC_SAFETY_MARGIN")?
                .unwrap_or(defaults.traffic_safety_margin),
            rate_limit_max: parse(&get, "QUEUE_RATE_LIMIT_MAX")?.unwrap_or(defaults.rate_limit_max),
            rate_limit_window: parse(&get, "QUEUE_RATE_LIMIT_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            claim_visibility: parse(&get, "CLAIM_VISIBILITY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_visibility),
            sync_timeout: parse(&get, "SYNC_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_timeout),
            retry_attempts: parse(&get, "RETRY_ATTEMPTS")?.unwrap_or(defaults.retry_attempts),
            retry_base_delay: parse(&get, "RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            render_timeout: parse(&get, "RENDER_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.render_timeout),
            log_format: match get("LOG_FORMAT") {
                Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value,
                })?,
                None => defaults.log_format,
            },
            otel_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otel_endpoint),
            otel_service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.otel_service_name),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Zero {
                name: "WORKER_CONCURRENCY",
            });
        }
        if self.rate_limit_max == 0 {
            return Err(ConfigError::Zero {
                name: "QUEUE_RATE_LIMIT_MAX",
            });
        }
        if self.claim_visibility <= self.render_timeout {
            return Err(ConfigError::Invalid {
                name: "CLAIM_VISIBILITY_SECS",
                value: self.claim_visibility.as_secs().to_string(),
            });
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Zero {
                name: "RETRY_ATTEMPTS",
            });
        }
        if !(self.traffic_safety_margin > 0.0 && self.traffic_safety_margin <= 1.0) {
            return Err(ConfigError::Invalid {
                name: "TRAFFIC_SAFETY_MARGIN",
                value: self.traffic_safety_margin.to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
        }
    }

    pub fn intake_limit(&self) -> IntakeLimit {
        IntakeLimit::new(self.rate_limit_max, self.rate_limit_window)
    }
}

fn parse<T, G>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}
