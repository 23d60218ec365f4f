//! Protocol Encoder
//!
//! Turns a [`Batch`] into an OTLP/HTTP request body. Records are grouped by
//! resource, then by instrumentation scope, in order of first appearance, as
//! collectors expect. Each record is validated against the wire schema first;
//! a record that cannot be represented is dropped on its own and counted,
//! the rest of the batch still goes out.
//!
//! Message types come from `opentelemetry-proto` (prost-generated, with serde
//! support), so the protobuf and JSON encodings share one conversion.

use crate::batch::Batch;
use crate::config::Protocol;
use crate::diagnostics::Diagnostics;
use crate::error::EncodingError;
use crate::record::{
    AttributeValue, Attributes, HistogramData, InstrumentationScope, LogRecord, MetricKind,
    MetricPoint, MetricValue, Resource, Signal, Span, SpanKind, SpanStatus,
};
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, ArrayValue, InstrumentationScope as ProtoScope, KeyValue,
};
use opentelemetry_proto::tonic::logs::v1::{LogRecord as ProtoLogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, AggregationTemporality, Gauge, Histogram, HistogramDataPoint,
    Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_proto::tonic::trace::v1::{
    span, status, ResourceSpans, ScopeSpans, Span as ProtoSpan, Status,
};
use prost::Message;
use std::sync::Arc;
use tracing::warn;

/// Records sharing one resource.
pub struct ResourceGroup<'a, T> {
    pub resource: &'a Resource,
    pub scopes: Vec<ScopeGroup<'a, T>>,
}

/// Records sharing one resource and one instrumentation scope.
pub struct ScopeGroup<'a, T> {
    pub scope: &'a InstrumentationScope,
    pub records: Vec<&'a T>,
}

/// Collector-reported partial acceptance of an otherwise successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSuccess {
    pub rejected: i64,
    pub message: String,
}

/// A record kind that maps onto one OTLP export request.
pub trait OtlpSignal: Sized + Send + Sync + 'static {
    const SIGNAL: Signal;

    /// The `Export*ServiceRequest` message for this signal.
    type Request: Message + serde::Serialize;

    fn resource(&self) -> &Arc<Resource>;

    fn scope(&self) -> &Arc<InstrumentationScope>;

    /// Checks that the record can be represented in `protocol`.
    fn validate(&self, protocol: Protocol) -> Result<(), EncodingError>;

    fn build_request(groups: Vec<ResourceGroup<'_, Self>>) -> Self::Request;

    /// Extracts `partial_success` from a 2xx response body, if the collector sent one.
    fn partial_success(protocol: Protocol, body: &[u8]) -> Option<PartialSuccess>;
}

/// Wire payload for one batch, ready for the transport.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub signal: Signal,
    pub sequence: u64,
    pub content_type: &'static str,
    pub body: Bytes,
    /// Records actually encoded (invalid ones excluded).
    pub record_count: usize,
}

/// Encodes batches for one protocol.
#[derive(Debug, Clone)]
pub struct Encoder {
    protocol: Protocol,
    diagnostics: Arc<Diagnostics>,
}

impl Encoder {
    pub fn new(protocol: Protocol, diagnostics: Arc<Diagnostics>) -> Self {
        Self { protocol, diagnostics }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Encodes `batch`, first removing records that cannot be represented.
    ///
    /// Removed records are counted as dropped, so a batch that is retried or
    /// requeued afterwards only carries valid records. Returns `Ok(None)` when
    /// nothing survives validation. An error means the payload as a whole
    /// could not be serialized.
    pub fn encode<T: OtlpSignal>(&self, batch: &mut Batch<T>) -> Result<Option<EncodedBatch>, EncodingError> {
        let sequence = batch.sequence();
        let protocol = self.protocol;
        let diagnostics = &self.diagnostics;
        batch.retain(|record| match record.validate(protocol) {
            Ok(()) => true,
            Err(e) => {
                diagnostics.record_encoding_error();
                diagnostics.add_dropped(1);
                warn!(
                    signal = %T::SIGNAL,
                    sequence,
                    error = %e,
                    "dropping record that cannot be encoded"
                );
                false
            }
        });

        if batch.is_empty() {
            return Ok(None);
        }

        let record_count = batch.len();
        let request = T::build_request(group(batch.records().iter().collect()));
        let body = serialize(&request, protocol)?;
        self.diagnostics.add_encoded(record_count as u64);

        Ok(Some(EncodedBatch {
            signal: T::SIGNAL,
            sequence,
            content_type: protocol.content_type(),
            body: Bytes::from(body),
            record_count,
        }))
    }

    /// Reads `partial_success` from a collector response for signal `T`.
    pub fn partial_success<T: OtlpSignal>(&self, body: &[u8]) -> Option<PartialSuccess> {
        if body.is_empty() {
            return None;
        }
        T::partial_success(self.protocol, body)
    }
}

fn serialize<M: Message + serde::Serialize>(message: &M, protocol: Protocol) -> Result<Vec<u8>, EncodingError> {
    match protocol {
        Protocol::HttpProtobuf => Ok(message.encode_to_vec()),
        Protocol::HttpJson => {
            serde_json::to_vec(message).map_err(|e| EncodingError::Serialization(e.to_string()))
        }
    }
}

/// Groups records by resource then scope, keeping first-appearance order.
fn group<'a, T: OtlpSignal>(records: Vec<&'a T>) -> Vec<ResourceGroup<'a, T>> {
    let mut groups: Vec<ResourceGroup<'a, T>> = Vec::new();

    for record in records {
        let resource: &'a Resource = record.resource();
        let scope: &'a InstrumentationScope = record.scope();

        let r = match groups
            .iter()
            .position(|g| std::ptr::eq(g.resource, resource) || g.resource == resource)
        {
            Some(i) => i,
            None => {
                groups.push(ResourceGroup {
                    resource,
                    scopes: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let scopes = &mut groups[r].scopes;
        let s = match scopes
            .iter()
            .position(|g| std::ptr::eq(g.scope, scope) || g.scope == scope)
        {
            Some(i) => i,
            None => {
                scopes.push(ScopeGroup {
                    scope,
                    records: Vec::new(),
                });
                scopes.len() - 1
            }
        };
        scopes[s].records.push(record);
    }

    groups
}

// =============================================================================
// COMMON CONVERSIONS
// =============================================================================

fn to_any_value(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Double(d) => any_value::Value::DoubleValue(*d),
        AttributeValue::Bytes(b) => any_value::Value::BytesValue(b.clone()),
        AttributeValue::Array(values) => any_value::Value::ArrayValue(ArrayValue {
            values: values.iter().map(to_any_value).collect(),
        }),
    };
    AnyValue { value: Some(value) }
}

fn to_key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(to_any_value(value)),
        })
        .collect()
}

fn to_proto_resource(resource: &Resource) -> ProtoResource {
    ProtoResource {
        attributes: to_key_values(&resource.attributes),
        ..Default::default()
    }
}

fn to_proto_scope(scope: &InstrumentationScope) -> ProtoScope {
    ProtoScope {
        name: scope.name.clone(),
        version: scope.version.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn check_attributes(
    attributes: &Attributes,
    protocol: Protocol,
    field: &'static str,
) -> Result<(), EncodingError> {
    if protocol == Protocol::HttpJson && attributes.values().any(AttributeValue::has_non_finite) {
        return Err(EncodingError::NonFinite {
            field,
            protocol: protocol.as_str(),
        });
    }
    Ok(())
}

fn check_double(value: f64, protocol: Protocol, field: &'static str) -> Result<(), EncodingError> {
    if protocol == Protocol::HttpJson && !value.is_finite() {
        return Err(EncodingError::NonFinite {
            field,
            protocol: protocol.as_str(),
        });
    }
    Ok(())
}

/// Reads a JSON `int64`, which the proto3 JSON mapping may render as a string.
fn json_i64(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_partial_success(body: &[u8], rejected_key: &str) -> Option<PartialSuccess> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let partial = json.get("partialSuccess")?;
    let rejected = partial.get(rejected_key).and_then(json_i64).unwrap_or(0);
    let message = partial
        .get("errorMessage")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    non_empty_partial(rejected, message)
}

fn non_empty_partial(rejected: i64, message: String) -> Option<PartialSuccess> {
    (rejected != 0 || !message.is_empty()).then_some(PartialSuccess { rejected, message })
}

// =============================================================================
// TRACES
// =============================================================================

fn proto_span_kind(kind: SpanKind) -> span::SpanKind {
    match kind {
        SpanKind::Internal => span::SpanKind::Internal,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Client => span::SpanKind::Client,
        SpanKind::Producer => span::SpanKind::Producer,
        SpanKind::Consumer => span::SpanKind::Consumer,
    }
}

fn proto_status(status: SpanStatus) -> Status {
    let code = match status {
        SpanStatus::Ok => status::StatusCode::Ok,
        SpanStatus::Error => status::StatusCode::Error,
        SpanStatus::Unset => status::StatusCode::Unset,
    };
    Status {
        code: code as i32,
        ..Default::default()
    }
}

fn to_proto_span(s: &Span) -> ProtoSpan {
    ProtoSpan {
        trace_id: s.trace_id.to_bytes().to_vec(),
        span_id: s.span_id.to_bytes().to_vec(),
        parent_span_id: s
            .parent_span_id
            .map(|p| p.to_bytes().to_vec())
            .unwrap_or_default(),
        name: s.name.clone(),
        kind: proto_span_kind(s.kind) as i32,
        start_time_unix_nano: s.start_time,
        end_time_unix_nano: s.end_time,
        attributes: to_key_values(&s.attributes),
        events: s
            .events
            .iter()
            .map(|e| span::Event {
                time_unix_nano: e.timestamp,
                name: e.name.clone(),
                attributes: to_key_values(&e.attributes),
                ..Default::default()
            })
            .collect(),
        status: Some(proto_status(s.status)),
        ..Default::default()
    }
}

impl OtlpSignal for Span {
    const SIGNAL: Signal = Signal::Traces;
    type Request = ExportTraceServiceRequest;

    fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    fn scope(&self) -> &Arc<InstrumentationScope> {
        &self.scope
    }

    fn validate(&self, protocol: Protocol) -> Result<(), EncodingError> {
        let parent_ok = self.parent_span_id.map_or(true, |p| p.is_valid());
        if !self.trace_id.is_valid() || !self.span_id.is_valid() || !parent_ok {
            return Err(EncodingError::InvalidSpanContext {
                name: self.name.clone(),
            });
        }
        if self.end_time < self.start_time {
            return Err(EncodingError::InvertedSpan {
                name: self.name.clone(),
            });
        }
        check_attributes(&self.attributes, protocol, "span attribute")?;
        for event in &self.events {
            check_attributes(&event.attributes, protocol, "span event attribute")?;
        }
        Ok(())
    }

    fn build_request(groups: Vec<ResourceGroup<'_, Self>>) -> Self::Request {
        ExportTraceServiceRequest {
            resource_spans: groups
                .into_iter()
                .map(|g| ResourceSpans {
                    resource: Some(to_proto_resource(g.resource)),
                    scope_spans: g
                        .scopes
                        .into_iter()
                        .map(|sg| ScopeSpans {
                            scope: Some(to_proto_scope(sg.scope)),
                            spans: sg.records.into_iter().map(to_proto_span).collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn partial_success(protocol: Protocol, body: &[u8]) -> Option<PartialSuccess> {
        match protocol {
            Protocol::HttpProtobuf => {
                let partial = ExportTraceServiceResponse::decode(body).ok()?.partial_success?;
                non_empty_partial(partial.rejected_spans, partial.error_message)
            }
            Protocol::HttpJson => json_partial_success(body, "rejectedSpans"),
        }
    }
}

// =============================================================================
// METRICS
// =============================================================================

fn check_histogram(h: &HistogramData, protocol: Protocol) -> Result<(), EncodingError> {
    if h.bucket_counts.len() != h.bounds.len() + 1 {
        return Err(EncodingError::InvalidHistogram(format!(
            "{} bucket counts for {} bounds",
            h.bucket_counts.len(),
            h.bounds.len()
        )));
    }
    if h.bounds.iter().any(|b| !b.is_finite()) {
        return Err(EncodingError::InvalidHistogram("non-finite bucket bound".into()));
    }
    if h.bounds.windows(2).any(|w| w[0] >= w[1]) {
        return Err(EncodingError::InvalidHistogram("bounds not strictly increasing".into()));
    }
    let total: u64 = h.bucket_counts.iter().sum();
    if total != h.count {
        return Err(EncodingError::InvalidHistogram(format!(
            "count {} does not match bucket total {}",
            h.count, total
        )));
    }
    check_double(h.sum, protocol, "histogram sum")?;
    if let Some(min) = h.min {
        check_double(min, protocol, "histogram min")?;
    }
    if let Some(max) = h.max {
        check_double(max, protocol, "histogram max")?;
    }
    Ok(())
}

fn number_value(value: &MetricValue) -> Option<number_data_point::Value> {
    match value {
        MetricValue::Int(i) => Some(number_data_point::Value::AsInt(*i)),
        MetricValue::Double(d) => Some(number_data_point::Value::AsDouble(*d)),
        MetricValue::Histogram(_) => None,
    }
}

fn number_point(p: &MetricPoint) -> Option<NumberDataPoint> {
    Some(NumberDataPoint {
        attributes: to_key_values(&p.attributes),
        start_time_unix_nano: p.start_time.unwrap_or_default(),
        time_unix_nano: p.timestamp,
        value: Some(number_value(&p.value)?),
        ..Default::default()
    })
}

fn histogram_point(p: &MetricPoint) -> Option<HistogramDataPoint> {
    let MetricValue::Histogram(h) = &p.value else {
        return None;
    };
    Some(HistogramDataPoint {
        attributes: to_key_values(&p.attributes),
        start_time_unix_nano: p.start_time.unwrap_or_default(),
        time_unix_nano: p.timestamp,
        count: h.count,
        sum: Some(h.sum),
        bucket_counts: h.bucket_counts.clone(),
        explicit_bounds: h.bounds.clone(),
        min: h.min,
        max: h.max,
        ..Default::default()
    })
}

/// Builds one `Metric` from points sharing name and kind.
fn to_proto_metric(points: &[&MetricPoint]) -> Option<Metric> {
    let first = points.first()?;
    let data = match first.kind {
        MetricKind::Counter => metric::Data::Sum(Sum {
            data_points: points.iter().filter_map(|p| number_point(p)).collect(),
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
        }),
        MetricKind::Gauge => metric::Data::Gauge(Gauge {
            data_points: points.iter().filter_map(|p| number_point(p)).collect(),
        }),
        MetricKind::Histogram => metric::Data::Histogram(Histogram {
            data_points: points.iter().filter_map(|p| histogram_point(p)).collect(),
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
        }),
    };
    Some(Metric {
        name: first.metric_name.clone(),
        description: first.description.clone(),
        unit: first.unit.clone(),
        data: Some(data),
        ..Default::default()
    })
}

fn to_proto_metrics(points: Vec<&MetricPoint>) -> Vec<Metric> {
    let mut by_name: Vec<Vec<&MetricPoint>> = Vec::new();
    for point in points {
        match by_name
            .iter_mut()
            .find(|g| g[0].metric_name == point.metric_name && g[0].kind == point.kind)
        {
            Some(g) => g.push(point),
            None => by_name.push(vec![point]),
        }
    }
    by_name.iter().filter_map(|g| to_proto_metric(g)).collect()
}

impl OtlpSignal for MetricPoint {
    const SIGNAL: Signal = Signal::Metrics;
    type Request = ExportMetricsServiceRequest;

    fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    fn scope(&self) -> &Arc<InstrumentationScope> {
        &self.scope
    }

    fn validate(&self, protocol: Protocol) -> Result<(), EncodingError> {
        match (self.kind, &self.value) {
            (MetricKind::Counter, MetricValue::Int(v)) if *v < 0 => {
                return Err(EncodingError::NegativeCounter {
                    name: self.metric_name.clone(),
                });
            }
            (MetricKind::Counter, MetricValue::Double(v)) if *v < 0.0 => {
                return Err(EncodingError::NegativeCounter {
                    name: self.metric_name.clone(),
                });
            }
            (MetricKind::Counter | MetricKind::Gauge, MetricValue::Double(v)) => {
                check_double(*v, protocol, "metric value")?;
            }
            (MetricKind::Counter | MetricKind::Gauge, MetricValue::Int(_)) => {}
            (MetricKind::Histogram, MetricValue::Histogram(h)) => check_histogram(h, protocol)?,
            _ => {
                return Err(EncodingError::KindMismatch {
                    name: self.metric_name.clone(),
                });
            }
        }
        check_attributes(&self.attributes, protocol, "metric attribute")
    }

    fn build_request(groups: Vec<ResourceGroup<'_, Self>>) -> Self::Request {
        ExportMetricsServiceRequest {
            resource_metrics: groups
                .into_iter()
                .map(|g| ResourceMetrics {
                    resource: Some(to_proto_resource(g.resource)),
                    scope_metrics: g
                        .scopes
                        .into_iter()
                        .map(|sg| ScopeMetrics {
                            scope: Some(to_proto_scope(sg.scope)),
                            metrics: to_proto_metrics(sg.records),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn partial_success(protocol: Protocol, body: &[u8]) -> Option<PartialSuccess> {
        match protocol {
            Protocol::HttpProtobuf => {
                let partial = ExportMetricsServiceResponse::decode(body).ok()?.partial_success?;
                non_empty_partial(partial.rejected_data_points, partial.error_message)
            }
            Protocol::HttpJson => json_partial_success(body, "rejectedDataPoints"),
        }
    }
}

// =============================================================================
// LOGS
// =============================================================================

fn to_proto_log(l: &LogRecord) -> ProtoLogRecord {
    ProtoLogRecord {
        time_unix_nano: l.timestamp,
        observed_time_unix_nano: l.observed_timestamp,
        severity_number: l.severity.number(),
        severity_text: l.severity.text().to_string(),
        body: Some(AnyValue {
            value: Some(any_value::Value::StringValue(l.body.clone())),
        }),
        attributes: to_key_values(&l.attributes),
        trace_id: l.trace_id.map(|t| t.to_bytes().to_vec()).unwrap_or_default(),
        span_id: l.span_id.map(|s| s.to_bytes().to_vec()).unwrap_or_default(),
        ..Default::default()
    }
}

impl OtlpSignal for LogRecord {
    const SIGNAL: Signal = Signal::Logs;
    type Request = ExportLogsServiceRequest;

    fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    fn scope(&self) -> &Arc<InstrumentationScope> {
        &self.scope
    }

    fn validate(&self, protocol: Protocol) -> Result<(), EncodingError> {
        check_attributes(&self.attributes, protocol, "log attribute")
    }

    fn build_request(groups: Vec<ResourceGroup<'_, Self>>) -> Self::Request {
        ExportLogsServiceRequest {
            resource_logs: groups
                .into_iter()
                .map(|g| ResourceLogs {
                    resource: Some(to_proto_resource(g.resource)),
                    scope_logs: g
                        .scopes
                        .into_iter()
                        .map(|sg| ScopeLogs {
                            scope: Some(to_proto_scope(sg.scope)),
                            log_records: sg.records.into_iter().map(to_proto_log).collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn partial_success(protocol: Protocol, body: &[u8]) -> Option<PartialSuccess> {
        match protocol {
            Protocol::HttpProtobuf => {
                let partial = ExportLogsServiceResponse::decode(body).ok()?.partial_success?;
                non_empty_partial(partial.rejected_log_records, partial.error_message)
            }
            Protocol::HttpJson => json_partial_success(body, "rejectedLogRecords"),
        }
    }
}
