//! Telemetry record model.
//!
//! Records are built by instrumented application code and handed to a
//! [`Recorder`](crate::Recorder). Once pushed they are never mutated; the
//! resource and instrumentation scope are shared through `Arc` so that
//! building a record on the request path only copies pointers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Attribute map. Ordering is irrelevant to the data model; a `BTreeMap`
/// keeps the encoded payload deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Current wall-clock time as Unix nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Attribute value types supported by the OTLP `AnyValue` schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Returns `true` if this value (or any nested element) is a NaN or infinite double.
    pub fn has_non_finite(&self) -> bool {
        match self {
            Self::Double(v) => !v.is_finite(),
            Self::Array(values) => values.iter().any(AttributeValue::has_non_finite),
            _ => false,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

/// The entity producing telemetry (service, host, process).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: Attributes,
}

impl Resource {
    /// Creates an empty resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource carrying `service.name`.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self::new().with_attribute("service.name", service_name.into())
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// The library or module that emitted a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// 128-bit trace identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub const INVALID: TraceId = TraceId([0; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a random, valid trace id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id = Self(rng.gen());
            if id.is_valid() {
                return id;
            }
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// An all-zero id is invalid on the wire.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", u128::from_be_bytes(self.0))
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self)
    }
}

/// 64-bit span identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub const INVALID: SpanId = SpanId([0; 8]);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generates a random, valid span id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id = Self(rng.gen());
            if id.is_valid() {
                return id;
            }
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", u64::from_be_bytes(self.0))
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self)
    }
}

/// The three OTLP signals. Each maps to its own collector path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// Path appended to the collector endpoint.
    pub fn path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    #[default]
    Unset,
}

/// Span kind as defined by OpenTelemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    #[default]
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub timestamp: u64,
    pub name: String,
    pub attributes: Attributes,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            timestamp: now_nanos(),
            name: name.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A finished span ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Record creation time (Unix nanoseconds)
    pub timestamp: u64,
    pub resource: Arc<Resource>,
    pub scope: Arc<InstrumentationScope>,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// `None` for root spans
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    pub status: SpanStatus,
    pub attributes: Attributes,
    /// Ordered by insertion
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// Starts a span at the current time. Call [`Span::finish`] before recording it.
    pub fn new(
        resource: Arc<Resource>,
        scope: Arc<InstrumentationScope>,
        trace_id: TraceId,
        span_id: SpanId,
        name: impl Into<String>,
    ) -> Self {
        let now = now_nanos();
        Self {
            timestamp: now,
            resource,
            scope,
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time: now,
            end_time: now,
            status: SpanStatus::Unset,
            attributes: Attributes::new(),
            events: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: SpanId) -> Self {
        self.parent_span_id = Some(parent);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_event(&mut self, event: SpanEvent) {
        self.events.push(event);
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = now_nanos().max(self.start_time);
        self.timestamp = self.end_time;
        self.status = status;
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Instrument kind of a metric point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic cumulative sum
    Counter,
    Gauge,
    Histogram,
}

/// Explicit-bucket histogram distribution.
///
/// `bucket_counts` has one more entry than `bounds`: bucket `i` counts values
/// in `(bounds[i-1], bounds[i]]`, the last bucket is unbounded above.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramData {
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl HistogramData {
    /// Creates an empty histogram with the given upper bounds.
    pub fn with_bounds(bounds: Vec<f64>) -> Self {
        let buckets = bounds.len() + 1;
        Self {
            bounds,
            bucket_counts: vec![0; buckets],
            ..Self::default()
        }
    }

    /// Records one observation.
    pub fn observe(&mut self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        if let Some(bucket) = self.bucket_counts.get_mut(idx) {
            *bucket += 1;
        }
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Value carried by a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Int(i64),
    Double(f64),
    Histogram(HistogramData),
}

/// One data point of a named metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub timestamp: u64,
    pub resource: Arc<Resource>,
    pub scope: Arc<InstrumentationScope>,
    pub metric_name: String,
    pub description: String,
    pub unit: String,
    pub kind: MetricKind,
    /// Start of the aggregation window for counters and histograms
    pub start_time: Option<u64>,
    pub value: MetricValue,
    pub attributes: Attributes,
}

impl MetricPoint {
    pub fn new(
        resource: Arc<Resource>,
        scope: Arc<InstrumentationScope>,
        metric_name: impl Into<String>,
        kind: MetricKind,
        value: MetricValue,
    ) -> Self {
        Self {
            timestamp: now_nanos(),
            resource,
            scope,
            metric_name: metric_name.into(),
            description: String::new(),
            unit: String::new(),
            kind,
            start_time: None,
            value,
            attributes: Attributes::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_start_time(mut self, start_time: u64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Log severity, mapped onto the OTLP severity number ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// First severity number of the OTLP range for this level.
    pub fn number(self) -> i32 {
        match self {
            Severity::Trace => 1,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A single log line, optionally correlated with a span.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: u64,
    pub observed_timestamp: u64,
    pub resource: Arc<Resource>,
    pub scope: Arc<InstrumentationScope>,
    pub severity: Severity,
    pub body: String,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    pub attributes: Attributes,
}

impl LogRecord {
    pub fn new(
        resource: Arc<Resource>,
        scope: Arc<InstrumentationScope>,
        severity: Severity,
        body: impl Into<String>,
    ) -> Self {
        let now = now_nanos();
        Self {
            timestamp: now,
            observed_timestamp: now,
            resource,
            scope,
            severity,
            body: body.into(),
            trace_id: None,
            span_id: None,
            attributes: Attributes::new(),
        }
    }

    /// Correlates this log line with a span.
    pub fn with_span_context(mut self, trace_id: TraceId, span_id: SpanId) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Any record accepted by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Span(Span),
    Metric(MetricPoint),
    Log(LogRecord),
}

impl Record {
    pub fn signal(&self) -> Signal {
        match self {
            Record::Span(_) => Signal::Traces,
            Record::Metric(_) => Signal::Metrics,
            Record::Log(_) => Signal::Logs,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Span(s) => s.timestamp,
            Record::Metric(m) => m.timestamp,
            Record::Log(l) => l.timestamp,
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        match self {
            Record::Span(s) => &s.resource,
            Record::Metric(m) => &m.resource,
            Record::Log(l) => &l.resource,
        }
    }

    pub fn scope(&self) -> &Arc<InstrumentationScope> {
        match self {
            Record::Span(s) => &s.scope,
            Record::Metric(m) => &m.scope,
            Record::Log(l) => &l.scope,
        }
    }
}

impl From<Span> for Record {
    fn from(span: Span) -> Self {
        Record::Span(span)
    }
}

impl From<MetricPoint> for Record {
    fn from(point: MetricPoint) -> Self {
        Record::Metric(point)
    }
}

impl From<LogRecord> for Record {
    fn from(log: LogRecord) -> Self {
        Record::Log(log)
    }
}
