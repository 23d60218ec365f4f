//! Exporter configuration.
//!
//! Values come from three layers, later ones winning:
//! 1. [`ExporterConfig::default`]
//! 2. standard `OTEL_*` environment variables ([`ExporterConfig::from_env`])
//! 3. an explicit JSON document or CLI flags set by the embedding application

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// What `push` does when the buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the incoming record.
    #[default]
    DropNewest,
    /// Evict the oldest buffered record to make room.
    DropOldest,
    /// Wait up to `block_timeout_millis` for space, then discard the incoming record.
    BlockWithTimeout,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverflowPolicy::DropNewest => "drop-newest",
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::BlockWithTimeout => "block-with-timeout",
        })
    }
}

/// What happens to a batch once its retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Put the batch back at the front of the buffer, at most once.
    #[default]
    Requeue,
    /// Drop the batch and count its records as dropped.
    Drop,
}

/// OTLP/HTTP payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "http/protobuf")]
    HttpProtobuf,
    #[serde(rename = "http/json")]
    HttpJson,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::HttpProtobuf => "http/protobuf",
            Protocol::HttpJson => "http/json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Protocol::HttpProtobuf => "application/x-protobuf",
            Protocol::HttpJson => "application/json",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "http/protobuf" => Ok(Protocol::HttpProtobuf),
            "http/json" => Ok(Protocol::HttpJson),
            other => Err(ConfigError::Invalid {
                field: "protocol",
                reason: format!("unsupported protocol {other:?}, expected http/protobuf or http/json"),
            }),
        }
    }
}

/// Configuration for the export pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExporterConfig {
    /// Collector base URL; signal paths (`/v1/traces` ...) are appended.
    pub endpoint: String,
    pub protocol: Protocol,
    /// Extra request headers (authentication, tenancy).
    pub headers: BTreeMap<String, String>,
    pub export_interval_millis: u64,
    pub max_queue_size: usize,
    pub max_batch_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// Only used by [`OverflowPolicy::BlockWithTimeout`].
    pub block_timeout_millis: u64,
    pub retry_policy: RetryPolicy,
    pub max_retries: u32,
    pub base_backoff_millis: u64,
    pub max_backoff_millis: u64,
    /// Apply random jitter to backoff delays.
    pub backoff_jitter: bool,
    pub request_timeout_millis: u64,
    pub flush_timeout_on_shutdown_millis: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318".to_string(),
            protocol: Protocol::HttpProtobuf,
            headers: BTreeMap::new(),
            export_interval_millis: 5_000,
            max_queue_size: 2_048,
            max_batch_size: 512,
            overflow_policy: OverflowPolicy::DropNewest,
            block_timeout_millis: 50,
            retry_policy: RetryPolicy::Requeue,
            max_retries: 5,
            base_backoff_millis: 100,
            max_backoff_millis: 5_000,
            backoff_jitter: true,
            request_timeout_millis: 10_000,
            flush_timeout_on_shutdown_millis: 30_000,
        }
    }
}

impl ExporterConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by the given variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(protocol) = lookup("OTEL_EXPORTER_OTLP_PROTOCOL") {
            config.protocol = protocol.parse()?;
        }
        if let Some(headers) = lookup("OTEL_EXPORTER_OTLP_HEADERS") {
            config.headers.extend(parse_headers(&headers)?);
        }
        if let Some(v) = lookup("OTEL_EXPORTER_OTLP_TIMEOUT") {
            config.request_timeout_millis = parse_number("OTEL_EXPORTER_OTLP_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("OTEL_BSP_SCHEDULE_DELAY") {
            config.export_interval_millis = parse_number("OTEL_BSP_SCHEDULE_DELAY", &v)?;
        }
        if let Some(v) = lookup("OTEL_BSP_MAX_QUEUE_SIZE") {
            config.max_queue_size = parse_number("OTEL_BSP_MAX_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = lookup("OTEL_BSP_MAX_EXPORT_BATCH_SIZE") {
            config.max_batch_size = parse_number("OTEL_BSP_MAX_EXPORT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OTEL_BSP_EXPORT_TIMEOUT") {
            config.flush_timeout_on_shutdown_millis = parse_number("OTEL_BSP_EXPORT_TIMEOUT", &v)?;
        }

        Ok(config)
    }

    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| ConfigError::Invalid {
            field: "endpoint",
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        if self.max_queue_size == 0 {
            return Err(invalid("maxQueueSize", "must be greater than zero"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("maxBatchSize", "must be greater than zero"));
        }
        if self.max_batch_size > self.max_queue_size {
            return Err(invalid("maxBatchSize", "must not exceed maxQueueSize"));
        }
        if self.export_interval_millis == 0 {
            return Err(invalid("exportIntervalMillis", "must be greater than zero"));
        }
        if self.base_backoff_millis > self.max_backoff_millis {
            return Err(invalid("baseBackoffMillis", "must not exceed maxBackoffMillis"));
        }
        if self.request_timeout_millis == 0 {
            return Err(invalid("requestTimeoutMillis", "must be greater than zero"));
        }
        Ok(())
    }

    /// Sets the collector endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the payload encoding.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_millis)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_millis)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_on_shutdown_millis)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

/// Parses `key1=value1,key2=value2` as used by `OTEL_EXPORTER_OTLP_HEADERS`.
fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut headers = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::Env {
            var: "OTEL_EXPORTER_OTLP_HEADERS",
            value: pair.to_string(),
        })?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}
