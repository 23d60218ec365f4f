//! Bridge from `tracing` events to OTLP log records.
//!
//! Initialisation is explicit and two-phase, so the logging backend can be
//! installed before the exporter exists:
//!
//! 1. create a [`LogSink`] and install [`LogSink::layer`] in the subscriber
//! 2. start the [`ExportPipeline`](crate::ExportPipeline)
//! 3. [`LogSink::bind`] the pipeline's [`Recorder`]
//!
//! Events seen before step 3 are counted and discarded. Events emitted by this
//! crate are never bridged; otherwise every export warning would be exported.

use crate::pipeline::Recorder;
use crate::record::{
    AttributeValue, Attributes, InstrumentationScope, LogRecord, Resource, Severity, SpanId, TraceId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Field names that carry correlation ids instead of attributes.
const TRACE_ID_FIELD: &str = "trace_id";
const SPAN_ID_FIELD: &str = "span_id";

/// Target of this crate's own events.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Crates on the HTTP export path. Their events would loop back into the
/// pipeline they describe.
const TRANSPORT_TARGETS: [&str; 6] = ["reqwest", "hyper", "hyper_util", "h2", "rustls", "tokio_rustls"];

/// `true` if `target` is `krate` itself or one of its modules.
fn in_crate(target: &str, krate: &str) -> bool {
    target
        .strip_prefix(krate)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

fn is_export_path(target: &str) -> bool {
    in_crate(target, OWN_TARGET) || TRANSPORT_TARGETS.iter().any(|krate| in_crate(target, krate))
}

#[derive(Debug)]
struct SinkInner {
    recorder: OnceLock<Recorder>,
    resource: Arc<Resource>,
    scope: Arc<InstrumentationScope>,
    unbound: AtomicU64,
}

/// Destination for bridged log records. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    pub fn new(resource: Arc<Resource>) -> Self {
        let scope = InstrumentationScope::new(env!("CARGO_PKG_NAME")).with_version(env!("CARGO_PKG_VERSION"));
        Self::with_scope(resource, Arc::new(scope))
    }

    pub fn with_scope(resource: Arc<Resource>, scope: Arc<InstrumentationScope>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                recorder: OnceLock::new(),
                resource,
                scope,
                unbound: AtomicU64::new(0),
            }),
        }
    }

    /// Connects the sink to a pipeline. Returns `false` if it was already bound.
    pub fn bind(&self, recorder: Recorder) -> bool {
        self.inner.recorder.set(recorder).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.recorder.get().is_some()
    }

    /// Events discarded because the sink was not bound yet.
    pub fn unbound_events(&self) -> u64 {
        self.inner.unbound.load(Ordering::Relaxed)
    }

    /// A subscriber layer forwarding events at `max_level` or more severe.
    pub fn layer(&self, max_level: Level) -> OtlpLogLayer {
        OtlpLogLayer {
            sink: self.clone(),
            max_level,
        }
    }

    fn emit(&self, record: LogRecord) {
        match self.inner.recorder.get() {
            Some(recorder) => {
                recorder.record(record);
            }
            None => {
                self.inner.unbound.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// `tracing-subscriber` layer turning events into [`LogRecord`]s.
#[derive(Debug, Clone)]
pub struct OtlpLogLayer {
    sink: LogSink,
    max_level: Level,
}

impl<S: Subscriber> Layer<S> for OtlpLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level || is_export_path(metadata.target()) {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(
            Arc::clone(&self.sink.inner.resource),
            Arc::clone(&self.sink.inner.scope),
            severity(*metadata.level()),
            visitor.message.unwrap_or_default(),
        );
        record.attributes = visitor.attributes;
        record
            .attributes
            .insert("log.target".to_string(), metadata.target().into());
        record.trace_id = visitor.trace_id;
        record.span_id = visitor.span_id;
        self.sink.emit(record);
    }
}

fn severity(level: Level) -> Severity {
    match level {
        Level::TRACE => Severity::Trace,
        Level::DEBUG => Severity::Debug,
        Level::INFO => Severity::Info,
        Level::WARN => Severity::Warn,
        Level::ERROR => Severity::Error,
    }
}

#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
    attributes: Attributes,
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
}

impl LogVisitor {
    fn insert(&mut self, field: &Field, value: AttributeValue) {
        self.attributes.insert(field.name().to_string(), value);
    }
}

impl Visit for LogVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.record_str(field, &format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            TRACE_ID_FIELD => {
                self.trace_id = u128::from_str_radix(value, 16)
                    .ok()
                    .map(TraceId::from)
                    .filter(TraceId::is_valid);
            }
            SPAN_ID_FIELD => {
                self.span_id = u64::from_str_radix(value, 16)
                    .ok()
                    .map(SpanId::from)
                    .filter(SpanId::is_valid);
            }
            _ => self.insert(field, value.into()),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let value = i64::try_from(value).map_or_else(|_| AttributeValue::from(value.to_string()), AttributeValue::from);
        self.insert(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExporterConfig;
    use crate::encode::EncodedBatch;
    use crate::error::TransportError;
    use crate::pipeline::ExportPipeline;
    use crate::transport::{Transport, TransportResponse};
    use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
    use opentelemetry_proto::tonic::common::v1::any_value;
    use prost::Message;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct CapturingTransport {
        bodies: Mutex<Vec<bytes::Bytes>>,
    }

    impl Transport for CapturingTransport {
        async fn send(&self, batch: &EncodedBatch) -> Result<TransportResponse, TransportError> {
            self.bodies.lock().unwrap().push(batch.body.clone());
            Ok(TransportResponse::new(200))
        }

        fn name(&self) -> &str {
            "capturing"
        }
    }

    #[test]
    fn test_events_before_bind_are_counted() {
        let sink = LogSink::new(Arc::new(Resource::for_service("svc")));
        let subscriber = tracing_subscriber::registry().with(sink.layer(Level::INFO));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app", "early");
            tracing::debug!(target: "app", "filtered by level");
        });
        assert!(!sink.is_bound());
        assert_eq!(sink.unbound_events(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_events_exported_as_logs() {
        let sink = LogSink::new(Arc::new(Resource::for_service("svc")));
        let transport = Arc::new(CapturingTransport::default());
        let pipeline = ExportPipeline::with_transport(ExporterConfig::default(), Arc::clone(&transport)).unwrap();
        assert!(sink.bind(pipeline.recorder()));
        assert!(!sink.bind(pipeline.recorder()));

        let subscriber = tracing_subscriber::registry().with(sink.layer(Level::INFO));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(
                target: "app",
                trace_id = "0000000000000000000000000000abcd",
                span_id = "00000000000000ef",
                user = "ada",
                attempt = 3,
                "slow request"
            );
            tracing::warn!(target: "otlp_exporter::pipeline", "internal");
            tracing::warn!(target: "hyper_util::client", "connection reset");
        });

        pipeline.flush().await;
        assert_eq!(pipeline.diagnostics().records_exported(), 1);

        let bodies = transport.bodies.lock().unwrap().clone();
        let request = ExportLogsServiceRequest::decode(bodies[0].as_ref()).unwrap();
        let log = &request.resource_logs[0].scope_logs[0].log_records[0];
        assert_eq!(log.severity_text, "WARN");
        assert_eq!(
            log.body.as_ref().and_then(|b| b.value.clone()),
            Some(any_value::Value::StringValue("slow request".into()))
        );
        assert_eq!(log.trace_id, TraceId::from(0xabcd_u128).to_bytes().to_vec());
        assert_eq!(log.span_id, SpanId::from(0xef_u64).to_bytes().to_vec());

        let keys: Vec<&str> = log.attributes.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["attempt", "log.target", "user"]);

        pipeline.shutdown().await;
    }

    #[test]
    fn test_export_path_targets_matched_by_crate() {
        assert!(is_export_path("otlp_exporter"));
        assert!(is_export_path("otlp_exporter::pipeline"));
        assert!(is_export_path("hyper_util::client::legacy"));
        assert!(is_export_path("reqwest::connect"));
        assert!(!is_export_path("otlp_exporter_ext"));
        assert!(!is_export_path("otlp_exporter_ext::handler"));
        assert!(!is_export_path("hyperion"));
        assert!(!is_export_path("app"));
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(severity(Level::TRACE), Severity::Trace);
        assert_eq!(severity(Level::WARN), Severity::Warn);
        assert_eq!(severity(Level::ERROR), Severity::Error);
    }
}
