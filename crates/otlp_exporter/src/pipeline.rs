//! Export Pipeline Controller
//!
//! Ties the three signal buffers, the encoder and the retrying exporter
//! together behind one background task.
//!
//! ```text
//!  producers ──record()──► [traces] [metrics] [logs]   (BatchBuffer per signal)
//!                                   │
//!           interval tick / size trigger / flush() / shutdown
//!                                   ▼
//!                      export task: drain → encode → deliver
//! ```
//!
//! Exactly one task exports, so batches of one signal never race each other.
//! Producers never wait on the network: `record` touches only a buffer.

use crate::batch::Batch;
use crate::buffer::{BatchBuffer, BufferConfig, PushOutcome, SequenceSource};
use crate::config::{ExporterConfig, OverflowPolicy, RetryPolicy};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::encode::{Encoder, OtlpSignal};
use crate::error::{ConfigError, ExportError};
use crate::exporter::{DeliveryOutcome, RetryConfig, RetryingExporter};
use crate::record::{LogRecord, MetricPoint, Record, Span};
use crate::shutdown::{FlushDeadline, ShutdownSignal};
use crate::transport::{HttpTransport, Transport};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle of the export task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    /// Waiting for the next trigger.
    Idle = 0,
    /// Running a drain-encode-export cycle.
    Exporting = 1,
    /// Final flush in progress; no new triggers are taken.
    ShuttingDown = 2,
    /// Task finished.
    Terminated = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Exporting,
            2 => PipelineState::ShuttingDown,
            _ => PipelineState::Terminated,
        }
    }
}

/// What the final flush achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records exported during the final flush.
    pub exported_records: u64,
    /// Records given up on after shutdown began.
    pub discarded_records: u64,
    /// `true` if the flush budget ran out.
    pub timed_out: bool,
}

struct Lanes {
    traces: BatchBuffer<Span>,
    metrics: BatchBuffer<MetricPoint>,
    logs: BatchBuffer<LogRecord>,
}

impl Lanes {
    fn close(&self) {
        self.traces.close();
        self.metrics.close();
        self.logs.close();
    }

    fn len(&self) -> usize {
        self.traces.len() + self.metrics.len() + self.logs.len()
    }
}

/// State shared between producers, the owner handle and the export task.
struct Shared {
    lanes: Lanes,
    diagnostics: Arc<Diagnostics>,
    state: AtomicU8,
    shutdown: ShutdownSignal,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Cloneable producer handle. Hand one to every piece of instrumented code.
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    /// Buffers a record for export. Never blocks except under
    /// `block-with-timeout`, never fails; overflow shows up in diagnostics.
    ///
    /// Under `block-with-timeout` the wait parks the calling thread. Called
    /// from a task on a current-thread runtime, that thread is the one the
    /// export task needs, so the wait always runs out and the record is
    /// dropped. Use another overflow policy there, or record from a
    /// blocking-capable thread.
    pub fn record(&self, record: impl Into<Record>) -> PushOutcome {
        let lanes = &self.shared.lanes;
        match record.into() {
            Record::Span(span) => lanes.traces.push(span),
            Record::Metric(point) => lanes.metrics.push(point),
            Record::Log(log) => lanes.logs.push(log),
        }
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.shared.state())
            .field("pending", &self.shared.lanes.len())
            .finish()
    }
}

/// Owner of the export task.
///
/// Construct once at startup, hand out [`Recorder`]s, call
/// [`shutdown`](Self::shutdown) on exit. Dropping the pipeline without calling
/// `shutdown` still starts the final flush, but nobody waits for it.
pub struct ExportPipeline {
    shared: Arc<Shared>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    task: Option<JoinHandle<ShutdownReport>>,
    flush_budget: Duration,
}

impl ExportPipeline {
    /// Starts a pipeline exporting over OTLP/HTTP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ExporterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Starts a pipeline over any transport.
    pub fn with_transport<T: Transport>(config: ExporterConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let diagnostics = Arc::new(Diagnostics::new());
        let flush_trigger = Arc::new(Notify::new());
        let buffer_config = BufferConfig {
            capacity: config.max_queue_size,
            flush_threshold: config.max_batch_size,
            overflow_policy: config.overflow_policy,
            block_timeout: config.block_timeout(),
        };
        let sequences = SequenceSource::new();
        let shared = Arc::new(Shared {
            lanes: Lanes {
                traces: lane(&buffer_config, &diagnostics, &flush_trigger, &sequences),
                metrics: lane(&buffer_config, &diagnostics, &flush_trigger, &sequences),
                logs: lane(&buffer_config, &diagnostics, &flush_trigger, &sequences),
            },
            diagnostics: Arc::clone(&diagnostics),
            state: AtomicU8::new(PipelineState::Idle as u8),
            shutdown: ShutdownSignal::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            encoder: Encoder::new(config.protocol, Arc::clone(&diagnostics)),
            exporter: RetryingExporter::new(transport, RetryConfig::from_config(&config), diagnostics),
            deadline: shared.shutdown.deadline(),
            retry_policy: config.retry_policy,
            overflow_policy: config.overflow_policy,
            max_batch_size: config.max_batch_size,
            flush_budget: config.flush_timeout(),
            reported_drops: 0,
            report: ShutdownReport::default(),
        };

        let (flush_tx, flush_rx) = mpsc::channel(16);
        info!(
            endpoint = %config.endpoint,
            protocol = %config.protocol.as_str(),
            interval_ms = config.export_interval_millis,
            max_queue_size = config.max_queue_size,
            max_batch_size = config.max_batch_size,
            "starting export pipeline"
        );
        let task = runtime.spawn(worker.run(config.export_interval(), flush_trigger, flush_rx));

        Ok(Self {
            shared,
            flush_tx,
            task: Some(task),
            flush_budget: config.flush_timeout(),
        })
    }

    /// A new producer handle.
    pub fn recorder(&self) -> Recorder {
        Recorder {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Runs an export cycle now and waits for it to finish.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stops accepting records, flushes everything within the configured
    /// budget and waits for the export task to finish. Never fails; a flush
    /// that runs out of time is reported, not raised.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.shared.shutdown.trigger(self.flush_budget);
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(error = %e, "export task failed");
                self.shared.set_state(PipelineState::Terminated);
                ShutdownReport::default()
            }),
            None => ShutdownReport::default(),
        }
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shared.shutdown.trigger(self.flush_budget);
        }
    }
}

/// One signal lane of a pipeline. All lanes number batches from `sequences`.
fn lane<S>(
    config: &BufferConfig,
    diagnostics: &Arc<Diagnostics>,
    flush_trigger: &Arc<Notify>,
    sequences: &SequenceSource,
) -> BatchBuffer<S> {
    BatchBuffer::with_sequences(
        config.clone(),
        Arc::clone(diagnostics),
        Arc::clone(flush_trigger),
        sequences.clone(),
    )
}

/// Whether a cycle is a normal one or the final flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Regular,
    Final,
}

/// The export task's state. Owned by the task alone.
struct Worker<T: Transport> {
    shared: Arc<Shared>,
    encoder: Encoder,
    exporter: RetryingExporter<T>,
    deadline: FlushDeadline,
    retry_policy: RetryPolicy,
    overflow_policy: OverflowPolicy,
    max_batch_size: usize,
    flush_budget: Duration,
    /// `records.dropped` at the end of the previous cycle.
    reported_drops: u64,
    report: ShutdownReport,
}

impl<T: Transport> Worker<T> {
    async fn run(
        mut self,
        period: Duration,
        flush_trigger: Arc<Notify>,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) -> ShutdownReport {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.deadline.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.triggered() => break,

                Some(ack) = flush_rx.recv() => {
                    self.cycle(Cycle::Regular).await;
                    let _ = ack.send(());
                }

                () = flush_trigger.notified() => {
                    self.cycle(Cycle::Regular).await;
                }

                _ = interval.tick() => {
                    self.cycle(Cycle::Regular).await;
                }
            }
        }

        self.shared.set_state(PipelineState::ShuttingDown);
        self.shared.lanes.close();
        info!(pending = self.shared.lanes.len(), "export pipeline shutting down");

        self.cycle(Cycle::Final).await;

        // flush() callers waiting behind shutdown
        flush_rx.close();
        while let Ok(ack) = flush_rx.try_recv() {
            let _ = ack.send(());
        }

        let report = std::mem::take(&mut self.report);
        if report.timed_out {
            self.shared.diagnostics.record_shutdown_timeout();
            let err = ExportError::ShutdownTimeout {
                budget: self.flush_budget,
                discarded: report.discarded_records,
            };
            error!(error = %err, "shutdown flush incomplete");
        }
        info!(
            exported = report.exported_records,
            discarded = report.discarded_records,
            "export pipeline terminated"
        );
        self.shared.set_state(PipelineState::Terminated);
        report
    }

    async fn cycle(&mut self, cycle: Cycle) {
        if cycle == Cycle::Regular {
            self.shared.set_state(PipelineState::Exporting);
        }

        let shared = Arc::clone(&self.shared);
        self.export_lane(&shared.lanes.traces, cycle).await;
        self.export_lane(&shared.lanes.metrics, cycle).await;
        self.export_lane(&shared.lanes.logs, cycle).await;

        if cycle == Cycle::Regular {
            let _ = self.shared.state.compare_exchange(
                PipelineState::Exporting as u8,
                PipelineState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        let dropped = self.shared.diagnostics.records_dropped();
        if dropped > self.reported_drops {
            let err = ExportError::Overflow {
                policy: self.overflow_policy,
            };
            warn!(
                error = %err,
                dropped = dropped - self.reported_drops,
                total = dropped,
                "telemetry records dropped since last export cycle"
            );
            self.reported_drops = dropped;
        }
    }

    /// Drains and exports one lane.
    ///
    /// A regular cycle exports at most the batches that were pending when it
    /// reached the lane, so a lane refilled as fast as it drains cannot hold
    /// the other signals back. It also stops at the first requeued batch and
    /// leaves the rest to the next trigger. The final cycle drains until
    /// empty, never requeues and discards everything once the flush deadline
    /// has passed.
    async fn export_lane<S: OtlpSignal>(&mut self, buffer: &BatchBuffer<S>, cycle: Cycle) {
        let mut batches_left = match cycle {
            Cycle::Regular => buffer.pending_batches(self.max_batch_size),
            Cycle::Final => usize::MAX,
        };
        loop {
            if cycle == Cycle::Regular && self.shared.shutdown.is_triggered() {
                return;
            }
            if batches_left == 0 {
                return;
            }
            batches_left -= 1;
            let Some(mut batch) = buffer.drain(self.max_batch_size) else {
                return;
            };

            if cycle == Cycle::Final && self.deadline.is_expired() {
                self.discard(&batch, true);
                continue;
            }

            let encoded = match self.encoder.encode(&mut batch) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => continue,
                Err(e) => {
                    self.shared.diagnostics.record_failure();
                    self.shared.diagnostics.add_dropped(batch.len() as u64);
                    let err = ExportError::from(e);
                    error!(signal = %S::SIGNAL, sequence = batch.sequence(), error = %err, "failed to encode batch");
                    continue;
                }
            };
            let records = encoded.record_count as u64;

            match self.exporter.deliver(&encoded, &self.deadline).await {
                DeliveryOutcome::Exported { attempts, response } => {
                    self.shared.diagnostics.record_success(records);
                    if cycle == Cycle::Final {
                        self.report.exported_records += records;
                    }
                    if let Some(partial) = self.encoder.partial_success::<S>(&response) {
                        let rejected = partial.rejected.max(0) as u64;
                        self.shared.diagnostics.add_rejected(rejected);
                        warn!(
                            signal = %S::SIGNAL,
                            sequence = encoded.sequence,
                            rejected,
                            message = %partial.message,
                            "collector partially accepted batch"
                        );
                    }
                    debug!(signal = %S::SIGNAL, sequence = encoded.sequence, records, attempts, "batch exported");
                }
                DeliveryOutcome::Rejected { status, .. } => {
                    let err = ExportError::RejectedPayload {
                        signal: S::SIGNAL,
                        sequence: encoded.sequence,
                        status,
                    };
                    error!(error = %err, records, "dropping rejected batch");
                    self.shared.diagnostics.record_failure();
                    self.discard(&batch, false);
                }
                DeliveryOutcome::Exhausted { reason, attempts } => {
                    self.shared.diagnostics.record_failure();
                    if cycle == Cycle::Regular && self.retry_policy == RetryPolicy::Requeue {
                        match buffer.requeue(batch) {
                            Ok(()) => {
                                self.shared.diagnostics.record_requeue();
                                warn!(
                                    signal = %S::SIGNAL,
                                    sequence = encoded.sequence,
                                    attempts,
                                    reason = %reason,
                                    "export failed, batch requeued"
                                );
                                return;
                            }
                            Err(batch) => {
                                warn!(
                                    signal = %S::SIGNAL,
                                    sequence = batch.sequence(),
                                    attempts,
                                    reason = %reason,
                                    "export failed again after requeue, dropping batch"
                                );
                                self.discard(&batch, false);
                            }
                        }
                    } else {
                        warn!(
                            signal = %S::SIGNAL,
                            sequence = encoded.sequence,
                            attempts,
                            reason = %reason,
                            "export failed, dropping batch"
                        );
                        self.discard(&batch, false);
                    }
                }
                DeliveryOutcome::TimedOut { attempts } => {
                    debug!(signal = %S::SIGNAL, sequence = encoded.sequence, attempts, "flush deadline hit");
                    self.shared.diagnostics.record_failure();
                    self.discard(&batch, true);
                }
            }
        }
    }

    fn discard<S>(&mut self, batch: &Batch<S>, timed_out: bool) {
        let records = batch.len() as u64;
        self.shared.diagnostics.add_dropped(records);
        if self.shared.shutdown.is_triggered() {
            self.report.discarded_records += records;
        }
        if timed_out {
            self.report.timed_out = true;
        }
    }
}
