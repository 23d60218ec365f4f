//! OTLP Telemetry Exporter
//!
//! Buffers spans, metric points and log records from application code, groups
//! them into batches and ships them to an OpenTelemetry collector over
//! OTLP/HTTP (protobuf or JSON), with retry, backoff and a bounded flush on
//! shutdown.
//!
//! ```ignore
//! let pipeline = ExportPipeline::start(ExporterConfig::from_env()?)?;
//! let recorder = pipeline.recorder();
//!
//! recorder.record(span);          // sync, never fails
//!
//! let report = pipeline.shutdown().await;
//! ```
//!
//! Recording is synchronous and never returns an error; everything that goes
//! wrong after that point is visible through [`Diagnostics`] and `tracing`
//! events only.

mod invariants;

pub mod batch;
pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod encode;
pub mod error;
pub mod exporter;
pub mod log_bridge;
pub mod pipeline;
pub mod record;
pub mod shutdown;
pub mod transport;

// Re-export main types
pub use batch::Batch;
pub use buffer::{BatchBuffer, BufferConfig, PushOutcome, SequenceSource};
pub use config::{ExporterConfig, OverflowPolicy, Protocol, RetryPolicy};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use encode::{EncodedBatch, Encoder, OtlpSignal, PartialSuccess};
pub use error::{ConfigError, EncodingError, ExportError, TransportError};
pub use exporter::{classify, Backoff, DeliveryOutcome, ExportResult, RetryConfig, RetryingExporter};
pub use log_bridge::{LogSink, OtlpLogLayer};
pub use pipeline::{ExportPipeline, PipelineState, Recorder, ShutdownReport};
pub use record::{
    AttributeValue, Attributes, HistogramData, InstrumentationScope, LogRecord, MetricKind,
    MetricPoint, MetricValue, Record, Resource, Severity, Signal, Span, SpanEvent, SpanId,
    SpanKind, SpanStatus, TraceId,
};
pub use shutdown::{FlushDeadline, ShutdownSignal};
pub use transport::{HttpTransport, Transport, TransportResponse, SEQUENCE_HEADER};
