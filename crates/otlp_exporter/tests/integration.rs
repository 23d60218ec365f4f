//! End-to-end tests: pipeline against an in-process OTLP/HTTP collector.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use otlp_exporter::{
    EncodedBatch, ExportPipeline, ExporterConfig, InstrumentationScope, LogRecord, MetricKind,
    MetricPoint, MetricValue, Protocol, Resource, RetryPolicy, Severity, Span, SpanId, SpanStatus,
    TraceId, Transport, TransportError, TransportResponse,
};
use prost::Message;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

// =============================================================================
// FAKE COLLECTOR
// =============================================================================

#[derive(Debug, Clone)]
struct Received {
    path: String,
    content_type: String,
    sequence: Option<String>,
    authorization: Option<String>,
    body: Bytes,
}

/// Collector that records every request and answers from a status script
/// (200 once the script runs out).
#[derive(Default)]
struct FakeCollector {
    received: Mutex<Vec<Received>>,
    script: Mutex<VecDeque<u16>>,
}

impl FakeCollector {
    fn scripted(statuses: &[u16]) -> Arc<Self> {
        let collector = Self::default();
        collector.script.lock().unwrap().extend(statuses);
        Arc::new(collector)
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn ingest(
    State(collector): State<Arc<FakeCollector>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    collector.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        content_type: header("content-type").unwrap_or_default(),
        sequence: header(otlp_exporter::SEQUENCE_HEADER),
        authorization: header("authorization"),
        body,
    });
    let status = collector.script.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(status).unwrap()
}

async fn spawn_collector(collector: Arc<FakeCollector>) -> SocketAddr {
    let app = Router::new()
        .route("/v1/traces", post(ingest))
        .route("/v1/metrics", post(ingest))
        .route("/v1/logs", post(ingest))
        .with_state(collector);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config_for(addr: SocketAddr) -> ExporterConfig {
    ExporterConfig {
        export_interval_millis: 60_000,
        max_queue_size: 1_000,
        max_batch_size: 100,
        max_retries: 3,
        base_backoff_millis: 5,
        max_backoff_millis: 20,
        request_timeout_millis: 2_000,
        flush_timeout_on_shutdown_millis: 2_000,
        ..ExporterConfig::default().with_endpoint(format!("http://{addr}"))
    }
}

// =============================================================================
// RECORD HELPERS
// =============================================================================

fn resource() -> Arc<Resource> {
    Arc::new(Resource::for_service("integration"))
}

fn scope() -> Arc<InstrumentationScope> {
    Arc::new(InstrumentationScope::new("tests").with_version("1.0.0"))
}

fn span(name: &str) -> Span {
    let mut span = Span::new(resource(), scope(), TraceId::random(), SpanId::random(), name);
    span.set_attribute("http.route", "/");
    span.finish(SpanStatus::Ok);
    span
}

// =============================================================================
// HTTP TESTS
// =============================================================================

#[tokio::test]
async fn test_protobuf_export_over_http() {
    let collector = FakeCollector::scripted(&[]);
    let addr = spawn_collector(Arc::clone(&collector)).await;
    let mut config = config_for(addr);
    config.headers.insert("authorization".into(), "Bearer token".into());

    let pipeline = ExportPipeline::start(config).unwrap();
    let recorder = pipeline.recorder();
    for i in 0..3 {
        recorder.record(span(&format!("op-{i}")));
    }
    recorder.record(
        MetricPoint::new(resource(), scope(), "jobs", MetricKind::Counter, MetricValue::Int(7))
            .with_attribute("queue", "default"),
    );
    pipeline.flush().await;

    let received = collector.received();
    assert_eq!(received.len(), 2);

    let traces = &received[0];
    assert_eq!(traces.path, "/v1/traces");
    assert_eq!(traces.content_type, "application/x-protobuf");
    assert_eq!(traces.sequence.as_deref(), Some("0"));
    assert_eq!(traces.authorization.as_deref(), Some("Bearer token"));
    let request = ExportTraceServiceRequest::decode(traces.body.as_ref()).unwrap();
    let names: Vec<&str> = request.resource_spans[0].scope_spans[0]
        .spans
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, vec!["op-0", "op-1", "op-2"]);

    assert_eq!(received[1].path, "/v1/metrics");
    assert_eq!(received[1].sequence.as_deref(), Some("1"));
    let metrics = ExportMetricsServiceRequest::decode(received[1].body.as_ref()).unwrap();
    assert_eq!(metrics.resource_metrics[0].scope_metrics[0].metrics[0].name, "jobs");

    let report = pipeline.shutdown().await;
    assert!(!report.timed_out);
    assert_eq!(recorder.diagnostics().records_exported(), 4);
    assert_eq!(recorder.diagnostics().batches_exported_success(), 2);
}

#[tokio::test]
async fn test_json_export_over_http() {
    let collector = FakeCollector::scripted(&[]);
    let addr = spawn_collector(Arc::clone(&collector)).await;
    let config = config_for(addr).with_protocol(Protocol::HttpJson);

    let pipeline = ExportPipeline::start(config).unwrap();
    pipeline
        .recorder()
        .record(LogRecord::new(resource(), scope(), Severity::Error, "boom"));
    pipeline.flush().await;

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].path, "/v1/logs");
    assert_eq!(received[0].content_type, "application/json");
    let json: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let log = &json["resourceLogs"][0]["scopeLogs"][0]["logRecords"][0];
    assert_eq!(log["severityText"], "ERROR");
    assert!(log["body"].to_string().contains("boom"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_collector_is_retried_with_same_sequence() {
    let collector = FakeCollector::scripted(&[503, 503]);
    let addr = spawn_collector(Arc::clone(&collector)).await;

    let pipeline = ExportPipeline::start(config_for(addr)).unwrap();
    pipeline.recorder().record(span("retried"));
    pipeline.flush().await;

    let received = collector.received();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|r| r.sequence.as_deref() == Some("0")));
    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.export_retries, 2);
    assert_eq!(snapshot.records_exported, 1);
    assert_eq!(snapshot.batches_exported_failed, 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_bad_request_is_dropped_without_retry() {
    let collector = FakeCollector::scripted(&[400]);
    let addr = spawn_collector(Arc::clone(&collector)).await;

    let pipeline = ExportPipeline::start(config_for(addr)).unwrap();
    pipeline.recorder().record(span("rejected"));
    pipeline.flush().await;

    assert_eq!(collector.received().len(), 1);
    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.records_dropped, 1);
    assert_eq!(snapshot.batches_exported_failed, 1);
    assert_eq!(snapshot.batches_requeued, 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_collector_requeues_then_drops() {
    // Bind and release a port so nothing is listening on it.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = ExporterConfig {
        max_retries: 1,
        retry_policy: RetryPolicy::Requeue,
        ..config_for(addr)
    };

    let pipeline = ExportPipeline::start(config).unwrap();
    pipeline.recorder().record(span("lost"));

    pipeline.flush().await;
    assert_eq!(pipeline.snapshot().batches_requeued, 1);
    assert_eq!(pipeline.snapshot().records_dropped, 0);

    pipeline.flush().await;
    assert_eq!(pipeline.snapshot().records_dropped, 1);
    pipeline.shutdown().await;
}

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Transport that counts what it is asked to send and always succeeds.
#[derive(Default)]
struct CountingTransport {
    records: Mutex<usize>,
}

impl Transport for CountingTransport {
    async fn send(&self, batch: &EncodedBatch) -> Result<TransportResponse, TransportError> {
        *self.records.lock().unwrap() += batch.record_count;
        Ok(TransportResponse::new(200))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[tokio::test]
async fn test_zero_flush_budget_discards_500_records() {
    let transport = Arc::new(CountingTransport::default());
    let config = ExporterConfig {
        export_interval_millis: 60_000,
        max_queue_size: 1_000,
        max_batch_size: 1_000,
        flush_timeout_on_shutdown_millis: 0,
        ..ExporterConfig::default()
    };

    let pipeline = ExportPipeline::with_transport(config, Arc::clone(&transport)).unwrap();
    let recorder = pipeline.recorder();
    for i in 0..500 {
        recorder.record(span(&format!("op-{i}")));
    }

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .expect("shutdown must not block");

    assert_eq!(report.exported_records, 0);
    assert_eq!(report.discarded_records, 500);
    assert!(report.timed_out);
    assert_eq!(*transport.records.lock().unwrap(), 0);
    assert_eq!(recorder.diagnostics().shutdown_timeouts(), 1);
}

#[tokio::test]
async fn test_shutdown_exports_pending_records() {
    let transport = Arc::new(CountingTransport::default());
    let config = ExporterConfig {
        export_interval_millis: 60_000,
        max_queue_size: 1_000,
        max_batch_size: 64,
        ..ExporterConfig::default()
    };

    let pipeline = ExportPipeline::with_transport(config, Arc::clone(&transport)).unwrap();
    let recorder = pipeline.recorder();
    for i in 0..50 {
        recorder.record(span(&format!("op-{i}")));
    }

    let report = pipeline.shutdown().await;
    assert_eq!(report.discarded_records, 0);
    assert!(!report.timed_out);
    assert_eq!(*transport.records.lock().unwrap(), 50);
    assert_eq!(recorder.diagnostics().records_exported(), 50);
}

#[tokio::test]
async fn test_concurrent_producers_lose_nothing_below_capacity() {
    let transport = Arc::new(CountingTransport::default());
    let config = ExporterConfig {
        export_interval_millis: 10,
        max_queue_size: 4_096,
        max_batch_size: 128,
        ..ExporterConfig::default()
    };
    let pipeline = ExportPipeline::with_transport(config, Arc::clone(&transport)).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let recorder = pipeline.recorder();
            std::thread::spawn(move || {
                for i in 0..250 {
                    recorder.record(span(&format!("p{p}-{i}")));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let report = pipeline.shutdown().await;
    assert!(!report.timed_out);
    assert_eq!(*transport.records.lock().unwrap(), 1_000);
}
