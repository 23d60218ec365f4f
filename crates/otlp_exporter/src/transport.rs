//! HTTP transport for encoded batches.
//!
//! [`Transport`] is the seam between the retry logic and the network. The
//! production implementation is [`HttpTransport`]; tests substitute scripted
//! transports.

use crate::config::ExporterConfig;
use crate::encode::EncodedBatch;
use crate::error::{ConfigError, TransportError};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use std::future::Future;
use std::sync::Arc;
use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

/// Header carrying the batch sequence number, for collector-side dedup.
pub const SEQUENCE_HEADER: &str = "otlp-batch-sequence";

/// What the collector answered.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed `Retry-After` (delta-seconds form only).
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: Bytes::new(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Sends one encoded batch and reports the collector's answer.
///
/// Implementations perform exactly one attempt; retrying is the caller's job.
/// Any HTTP status is a successful `send`; `Err` means no status was obtained.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        batch: &EncodedBatch,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(
        &self,
        batch: &EncodedBatch,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send {
        (**self).send(batch)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// OTLP/HTTP transport over `reqwest`.
///
/// Posts to `{endpoint}/v1/traces`, `/v1/metrics` or `/v1/logs` with the
/// configured headers and a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &ExporterConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::Client(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Client(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Full URL for a signal.
    pub fn url_for(&self, batch: &EncodedBatch) -> String {
        format!("{}{}", self.endpoint, batch.signal.path())
    }
}

impl Transport for HttpTransport {
    async fn send(&self, batch: &EncodedBatch) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(self.url_for(batch))
            .header(CONTENT_TYPE, batch.content_type)
            .header(SEQUENCE_HEADER, batch.sequence)
            .body(batch.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response_body(response.bytes().await, batch);

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }

    fn name(&self) -> &str {
        "otlp-http"
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// The response body, or empty if it could not be read. A 2xx status stands
/// on its own; only a partial-success report is lost.
fn response_body<E: Display>(read: Result<Bytes, E>, batch: &EncodedBatch) -> Bytes {
    read.unwrap_or_else(|e| {
        debug!(
            signal = %batch.signal,
            sequence = batch.sequence,
            error = %e,
            "failed to read collector response body"
        );
        Bytes::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Signal;

    fn batch(signal: Signal) -> EncodedBatch {
        EncodedBatch {
            signal,
            sequence: 3,
            content_type: "application/x-protobuf",
            body: Bytes::from_static(b"x"),
            record_count: 1,
        }
    }

    #[test]
    fn test_url_per_signal() {
        let config = ExporterConfig::default().with_endpoint("http://collector:4318/");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.url_for(&batch(Signal::Traces)), "http://collector:4318/v1/traces");
        assert_eq!(transport.url_for(&batch(Signal::Metrics)), "http://collector:4318/v1/metrics");
        assert_eq!(transport.url_for(&batch(Signal::Logs)), "http://collector:4318/v1/logs");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = ExporterConfig::default();
        config.headers.insert("bad header".into(), "v".into());
        assert!(matches!(HttpTransport::new(&config), Err(ConfigError::Client(_))));
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_unreadable_body_becomes_empty() {
        let read: Result<Bytes, &str> = Err("connection reset mid-body");
        assert!(response_body(read, &batch(Signal::Traces)).is_empty());

        let read: Result<Bytes, &str> = Ok(Bytes::from_static(b"{}"));
        assert_eq!(response_body(read, &batch(Signal::Traces)).as_ref(), b"{}");
    }
}
