//! # OTLP Exporter Demo
//!
//! Simulates a small web service with three handlers (`/`, `/greet/{name}`,
//! `/slow`) and exports its telemetry to an OTLP/HTTP collector:
//!
//! - one server span per request, with HTTP attributes and an event for `/slow`
//! - cumulative request counters and latency histograms per route
//! - `tracing` events bridged into OTLP log records, correlated to the span
//!
//! At the end the pipeline is shut down with its flush budget and the
//! diagnostics snapshot is printed as JSON.
//!
//! ## Running
//!
//! ```bash
//! # Against a local collector on :4318
//! cargo run -p otlp_exporter --bin demo -- --requests 200
//!
//! # JSON encoding, custom endpoint
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://collector:4318 \
//!     cargo run -p otlp_exporter --bin demo -- --protocol http/json
//! ```

use anyhow::Context;
use clap::Parser;
use otlp_exporter::{
    ExportPipeline, ExporterConfig, HistogramData, InstrumentationScope, LogSink, MetricKind,
    MetricPoint, MetricValue, Protocol, Recorder, Resource, Span, SpanEvent, SpanId, SpanKind,
    SpanStatus, TraceId,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Latency bucket bounds in milliseconds.
const LATENCY_BOUNDS_MS: [f64; 8] = [5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

#[derive(Parser, Debug)]
#[command(name = "demo", about = "Simulated web service exporting OTLP telemetry")]
struct Args {
    /// Collector base URL
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    endpoint: Option<String>,

    /// http/protobuf or http/json
    #[arg(long, env = "OTEL_EXPORTER_OTLP_PROTOCOL")]
    protocol: Option<Protocol>,

    /// Reported as `service.name`
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "otlp-demo")]
    service_name: String,

    /// Total simulated requests
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Concurrent simulated clients
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Milliseconds the `/slow` handler sleeps
    #[arg(long, default_value_t = 300)]
    slow_ms: u64,
}

/// Per-route request statistics, exported as cumulative metrics.
#[derive(Default)]
struct RouteStats {
    requests: i64,
    latency: Option<HistogramData>,
}

struct App {
    recorder: Recorder,
    resource: Arc<Resource>,
    scope: Arc<InstrumentationScope>,
    started: u64,
    stats: Mutex<BTreeMap<&'static str, RouteStats>>,
    slow: Duration,
}

impl App {
    /// Runs one request through the matching handler and records its telemetry.
    async fn serve(&self, path: &str) -> String {
        let route = route_of(path);
        let trace_id = TraceId::random();
        let span_id = SpanId::random();
        let mut span = Span::new(
            Arc::clone(&self.resource),
            Arc::clone(&self.scope),
            trace_id,
            span_id,
            format!("GET {route}"),
        )
        .with_kind(SpanKind::Server);
        span.set_attribute("http.request.method", "GET");
        span.set_attribute("http.route", route);
        span.set_attribute("url.path", path);

        let started = Instant::now();
        let body = match route {
            "/" => "Hello, OpenTelemetry!".to_string(),
            "/greet/{name}" => format!("Hello, {}!", path.trim_start_matches("/greet/")),
            _ => {
                span.add_event(SpanEvent::new("sleep.start"));
                tokio::time::sleep(self.slow).await;
                warn!(
                    trace_id = %trace_id,
                    span_id = %span_id,
                    route,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "slow request"
                );
                "Finally done!".to_string()
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        span.set_attribute("http.response.status_code", 200_i64);
        span.finish(SpanStatus::Ok);
        self.recorder.record(span);
        info!(trace_id = %trace_id, span_id = %span_id, route, "request served");

        let mut stats = self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = stats.entry(route).or_default();
        entry.requests += 1;
        entry
            .latency
            .get_or_insert_with(|| HistogramData::with_bounds(LATENCY_BOUNDS_MS.to_vec()))
            .observe(elapsed_ms);
        body
    }

    /// Records the current cumulative counters and histograms.
    fn record_metrics(&self) {
        let stats = self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (route, route_stats) in stats.iter() {
            let counter = MetricPoint::new(
                Arc::clone(&self.resource),
                Arc::clone(&self.scope),
                "http.server.requests",
                MetricKind::Counter,
                MetricValue::Int(route_stats.requests),
            )
            .with_start_time(self.started)
            .with_description("Requests served")
            .with_attribute("http.route", *route);
            self.recorder.record(counter);

            if let Some(latency) = &route_stats.latency {
                let histogram = MetricPoint::new(
                    Arc::clone(&self.resource),
                    Arc::clone(&self.scope),
                    "http.server.duration",
                    MetricKind::Histogram,
                    MetricValue::Histogram(latency.clone()),
                )
                .with_start_time(self.started)
                .with_unit("ms")
                .with_attribute("http.route", *route);
                self.recorder.record(histogram);
            }
        }
    }
}

fn route_of(path: &str) -> &'static str {
    if path == "/" {
        "/"
    } else if path.starts_with("/greet/") {
        "/greet/{name}"
    } else {
        "/slow"
    }
}

fn random_path() -> String {
    const NAMES: [&str; 4] = ["ada", "grace", "linus", "barbara"];
    let mut rng = rand::thread_rng();
    match rng.gen_range(0..10) {
        0..=4 => "/".to_string(),
        5..=8 => format!("/greet/{}", NAMES[rng.gen_range(0..NAMES.len())]),
        _ => "/slow".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let resource = Arc::new(
        Resource::for_service(args.service_name.clone())
            .with_attribute("service.version", env!("CARGO_PKG_VERSION")),
    );

    // Phase 1: logging backend with an unbound OTLP sink.
    let sink = LogSink::new(Arc::clone(&resource));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(sink.layer(Level::INFO))
        .init();

    // Phase 2: exporter.
    let mut config = ExporterConfig::from_env().context("reading OTEL_* environment")?;
    if let Some(endpoint) = args.endpoint {
        config = config.with_endpoint(endpoint);
    }
    if let Some(protocol) = args.protocol {
        config = config.with_protocol(protocol);
    }
    let pipeline = ExportPipeline::start(config.clone()).context("starting export pipeline")?;

    // Phase 3: bind.
    sink.bind(pipeline.recorder());
    info!(endpoint = %config.endpoint, protocol = config.protocol.as_str(), "telemetry pipeline ready");

    let app = Arc::new(App {
        recorder: pipeline.recorder(),
        resource,
        scope: Arc::new(InstrumentationScope::new("otlp-demo").with_version(env!("CARGO_PKG_VERSION"))),
        started: otlp_exporter::record::now_nanos(),
        stats: Mutex::new(BTreeMap::new()),
        slow: Duration::from_millis(args.slow_ms),
    });

    let reporter = tokio::spawn({
        let app = Arc::clone(&app);
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                app.record_metrics();
            }
        }
    });

    let started = Instant::now();
    let per_client = args.requests.div_ceil(args.concurrency.max(1));
    let mut clients = tokio::task::JoinSet::new();
    for _ in 0..args.concurrency.max(1) {
        let app = Arc::clone(&app);
        clients.spawn(async move {
            for _ in 0..per_client {
                let path = random_path();
                app.serve(&path).await;
            }
        });
    }
    while let Some(result) = clients.join_next().await {
        result.context("client task failed")?;
    }
    reporter.abort();
    app.record_metrics();

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "workload finished");

    let report = pipeline.shutdown().await;
    let snapshot = app.recorder.diagnostics().snapshot();

    println!(
        "shutdown: exported={} discarded={} timed_out={}",
        report.exported_records, report.discarded_records, report.timed_out
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
