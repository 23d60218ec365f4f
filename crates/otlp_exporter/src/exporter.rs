//! Exporter: response classification and retry with backoff.
//!
//! [`RetryingExporter`] wraps a [`Transport`] and drives one encoded batch to
//! a final [`DeliveryOutcome`]:
//!
//! - 2xx: exported
//! - 429/502/503/504 or a transport error: retried with exponential backoff
//!   and jitter, up to `max_retries`
//! - any other status: rejected immediately (retrying would repeat forever)
//!
//! Every attempt and every backoff sleep races the shutdown flush deadline.

use crate::config::ExporterConfig;
use crate::diagnostics::Diagnostics;
use crate::encode::EncodedBatch;
use crate::error::ExportError;
use crate::invariants::debug_assert_backoff_monotone;
use crate::shutdown::FlushDeadline;
use crate::transport::{Transport, TransportResponse};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Result of a single export attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportResult {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

impl ExportResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExportResult::Success)
    }
}

/// Maps an HTTP status to an export result.
pub fn classify(status: u16) -> ExportResult {
    match status {
        200..=299 => ExportResult::Success,
        429 | 502 | 503 | 504 => ExportResult::RetryableFailure(format!("collector returned {status}")),
        _ => ExportResult::FatalFailure(format!("collector rejected payload with {status}")),
    }
}

// =============================================================================
// RETRY CONFIGURATION
// =============================================================================

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Equal jitter: each delay is drawn from `[d/2, d]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &ExporterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
            jitter: config.backoff_jitter,
        }
    }

    /// Un-jittered delay before retry `retry` (1-indexed).
    fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Delay sequence for one batch.
///
/// Delays never decrease and never exceed `max_delay`, with or without jitter
/// and `Retry-After` hints.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
    previous: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retries: 0,
            previous: Duration::ZERO,
        }
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        self.retries += 1;
        let nominal = self.config.delay_for_retry(self.retries);

        let mut delay = if self.config.jitter && !nominal.is_zero() {
            let half = nominal / 2;
            rand::thread_rng().gen_range(half..=nominal)
        } else {
            nominal
        };
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        let delay = delay.max(self.previous).min(self.config.max_delay);

        debug_assert_backoff_monotone!(self.previous, delay, self.config.max_delay);
        self.previous = delay;
        delay
    }
}

// =============================================================================
// RETRYING EXPORTER
// =============================================================================

/// Final fate of one batch after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Collector accepted the batch. `response` is the body, for partial success.
    Exported { attempts: u32, response: Bytes },
    /// Collector refused the payload (fatal status).
    Rejected { status: u16, attempts: u32 },
    /// Still failing after `max_retries`.
    Exhausted { reason: String, attempts: u32 },
    /// The shutdown flush deadline passed first.
    TimedOut { attempts: u32 },
}

/// Sends encoded batches through a transport, retrying retryable failures.
pub struct RetryingExporter<T: Transport> {
    transport: T,
    config: RetryConfig,
    diagnostics: Arc<Diagnostics>,
}

impl<T: Transport> RetryingExporter<T> {
    pub fn new(transport: T, config: RetryConfig, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            transport,
            config,
            diagnostics,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One attempt, classified.
    pub async fn export(&self, batch: &EncodedBatch) -> ExportResult {
        self.attempt(batch).await.0
    }

    async fn attempt(&self, batch: &EncodedBatch) -> (ExportResult, Option<TransportResponse>) {
        match self.transport.send(batch).await {
            Ok(response) => (classify(response.status), Some(response)),
            Err(e) => (ExportResult::RetryableFailure(ExportError::from(e).to_string()), None),
        }
    }

    /// Retries `batch` until it is exported, rejected, out of retries, or
    /// `deadline` passes.
    pub async fn deliver(&self, batch: &EncodedBatch, deadline: &FlushDeadline) -> DeliveryOutcome {
        let mut backoff = Backoff::new(self.config.clone());
        let mut attempts = 0u32;

        loop {
            if deadline.is_expired() {
                return DeliveryOutcome::TimedOut { attempts };
            }
            attempts += 1;

            let (result, response) = tokio::select! {
                biased;
                () = deadline.reached() => return DeliveryOutcome::TimedOut { attempts },
                r = self.attempt(batch) => r,
            };

            let reason = match result {
                ExportResult::Success => {
                    let response = response.map(|r| r.body).unwrap_or_default();
                    return DeliveryOutcome::Exported { attempts, response };
                }
                ExportResult::FatalFailure(reason) => {
                    let status = response.as_ref().map_or(0, |r| r.status);
                    debug!(
                        signal = %batch.signal,
                        sequence = batch.sequence,
                        status,
                        reason = %reason,
                        "export rejected"
                    );
                    return DeliveryOutcome::Rejected { status, attempts };
                }
                ExportResult::RetryableFailure(reason) => reason,
            };

            if backoff.retries() >= self.config.max_retries {
                return DeliveryOutcome::Exhausted { reason, attempts };
            }

            let delay = backoff.next_delay(response.and_then(|r| r.retry_after));
            self.diagnostics.add_retries(1);
            debug!(
                signal = %batch.signal,
                sequence = batch.sequence,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "export attempt failed, backing off"
            );

            tokio::select! {
                biased;
                () = deadline.reached() => return DeliveryOutcome::TimedOut { attempts },
                () = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::record::Signal;
    use crate::shutdown::ShutdownSignal;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays a fixed script of responses and records when each call happened.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: Mutex<Vec<Instant>>,
        latency: Duration,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                latency: Duration::ZERO,
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, _batch: &EncodedBatch) -> Result<TransportResponse, TransportError> {
            self.calls.lock().unwrap().push(Instant::now());
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200)))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn encoded() -> EncodedBatch {
        EncodedBatch {
            signal: Signal::Traces,
            sequence: 0,
            content_type: "application/x-protobuf",
            body: Bytes::from_static(b"payload"),
            record_count: 1,
        }
    }

    fn exporter(transport: ScriptedTransport, config: RetryConfig) -> RetryingExporter<ScriptedTransport> {
        RetryingExporter::new(transport, config, Arc::new(Diagnostics::new()))
    }

    fn retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: true,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(200), ExportResult::Success);
        assert_eq!(classify(204), ExportResult::Success);
        for status in [429, 502, 503, 504] {
            assert!(matches!(classify(status), ExportResult::RetryableFailure(_)), "{status}");
        }
        for status in [400, 401, 404, 413, 500] {
            assert!(matches!(classify(status), ExportResult::FatalFailure(_)), "{status}");
        }
    }

    #[test]
    fn test_backoff_monotone_and_capped() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(retry_config(10));
            let mut prev = Duration::ZERO;
            for _ in 0..10 {
                let d = backoff.next_delay(None);
                assert!(d >= prev);
                assert!(d <= Duration::from_millis(300));
                prev = d;
            }
        }
    }

    #[test]
    fn test_backoff_without_jitter_doubles() {
        let mut config = retry_config(10);
        config.jitter = false;
        let mut backoff = Backoff::new(config);
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay(None).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn test_retry_after_raises_delay_within_cap() {
        let mut backoff = Backoff::new(retry_config(10));
        assert_eq!(backoff.next_delay(Some(Duration::from_secs(30))), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(None), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_retryable_failures_then_success() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse::new(503)),
            Err(TransportError::Connect("refused".into())),
            Ok(TransportResponse::new(429)),
            Ok(TransportResponse::new(200)),
        ]);
        let exporter = exporter(transport, retry_config(5));

        let outcome = exporter.deliver(&encoded(), &FlushDeadline::never()).await;
        assert!(matches!(outcome, DeliveryOutcome::Exported { attempts: 4, .. }));

        let times = exporter.transport().call_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "delays decreased: {gaps:?}");
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_millis(300)));
        assert_eq!(exporter.diagnostics.snapshot().export_retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_status_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse::new(400))]);
        let exporter = exporter(transport, retry_config(5));

        let outcome = exporter.deliver(&encoded(), &FlushDeadline::never()).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 400, attempts: 1 });
        assert_eq!(exporter.transport().call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse::new(503)); 10]);
        let exporter = exporter(transport, retry_config(2));

        let outcome = exporter.deliver(&encoded(), &FlushDeadline::never()).await;
        assert!(matches!(outcome, DeliveryOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(exporter.transport().call_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_export_attempt() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse::new(502)),
            Ok(TransportResponse::new(200)),
        ]);
        let exporter = exporter(transport, retry_config(5));
        assert!(matches!(exporter.export(&encoded()).await, ExportResult::RetryableFailure(_)));
        assert!(exporter.export(&encoded()).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_retryable() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect("refused".into()))]);
        let exporter = exporter(transport, retry_config(5));
        match exporter.export(&encoded()).await {
            ExportResult::RetryableFailure(reason) => assert_eq!(reason, "connection failed: refused"),
            other => panic!("expected retryable failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_skips_export() {
        let signal = ShutdownSignal::new();
        signal.trigger(Duration::ZERO);
        let exporter = exporter(ScriptedTransport::new(vec![]), retry_config(5));

        let outcome = exporter.deliver(&encoded(), &signal.deadline()).await;
        assert_eq!(outcome, DeliveryOutcome::TimedOut { attempts: 0 });
        assert!(exporter.transport().call_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_slow_attempt() {
        let signal = ShutdownSignal::new();
        let transport = ScriptedTransport::new(vec![]).with_latency(Duration::from_secs(10));
        let exporter = exporter(transport, retry_config(5));

        signal.trigger(Duration::from_secs(1));
        let start = Instant::now();
        let outcome = exporter.deliver(&encoded(), &signal.deadline()).await;
        assert_eq!(outcome, DeliveryOutcome::TimedOut { attempts: 1 });
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
