use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what the pipeline did with the records it was given.
///
/// Shared between producers (drop counters) and the export task, so the
/// producer-touched counters are cache-padded to keep them off the export
/// task's cache lines.
#[derive(Debug, Default)]
pub struct Diagnostics {
    records_dropped: CachePadded<AtomicU64>,
    records_accepted: CachePadded<AtomicU64>,
    records_encoded: AtomicU64,
    records_exported: AtomicU64,
    records_rejected: AtomicU64,
    batches_exported_success: AtomicU64,
    batches_exported_failed: AtomicU64,
    batches_requeued: AtomicU64,
    export_retries: AtomicU64,
    encoding_errors: AtomicU64,
    shutdown_timeouts: AtomicU64,
}

// Relaxed everywhere: these are statistics, no other data is published through them.
impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        self.records_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_accepted(&self, count: u64) {
        self.records_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_encoded(&self, count: u64) {
        self.records_encoded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_rejected(&self, count: u64) {
        self.records_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, record_count: u64) {
        self.records_exported.fetch_add(record_count, Ordering::Relaxed);
        self.batches_exported_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.batches_exported_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeue(&self) {
        self.batches_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_retries(&self, count: u64) {
        self.export_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_encoding_error(&self) {
        self.encoding_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shutdown_timeout(&self) {
        self.shutdown_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn records_accepted(&self) -> u64 {
        self.records_accepted.load(Ordering::Relaxed)
    }

    pub fn records_encoded(&self) -> u64 {
        self.records_encoded.load(Ordering::Relaxed)
    }

    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported_success(&self) -> u64 {
        self.batches_exported_success.load(Ordering::Relaxed)
    }

    pub fn batches_exported_failed(&self) -> u64 {
        self.batches_exported_failed.load(Ordering::Relaxed)
    }

    pub fn shutdown_timeouts(&self) -> u64 {
        self.shutdown_timeouts.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            records_dropped: self.records_dropped(),
            records_accepted: self.records_accepted(),
            records_encoded: self.records_encoded(),
            records_exported: self.records_exported(),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            batches_exported_success: self.batches_exported_success(),
            batches_exported_failed: self.batches_exported_failed(),
            batches_requeued: self.batches_requeued.load(Ordering::Relaxed),
            export_retries: self.export_retries.load(Ordering::Relaxed),
            encoding_errors: self.encoding_errors.load(Ordering::Relaxed),
            shutdown_timeouts: self.shutdown_timeouts(),
        }
    }
}

/// Serializable counter values, keyed by their dotted monitoring names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    #[serde(rename = "records.dropped")]
    pub records_dropped: u64,
    #[serde(rename = "records.accepted")]
    pub records_accepted: u64,
    #[serde(rename = "records.encoded")]
    pub records_encoded: u64,
    #[serde(rename = "records.exported")]
    pub records_exported: u64,
    #[serde(rename = "records.rejected")]
    pub records_rejected: u64,
    #[serde(rename = "batches.exported.success")]
    pub batches_exported_success: u64,
    #[serde(rename = "batches.exported.failed")]
    pub batches_exported_failed: u64,
    #[serde(rename = "batches.requeued")]
    pub batches_requeued: u64,
    #[serde(rename = "export.retries")]
    pub export_retries: u64,
    #[serde(rename = "encoding.errors")]
    pub encoding_errors: u64,
    #[serde(rename = "shutdown.timeouts")]
    pub shutdown_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_dotted_names() {
        let diagnostics = Diagnostics::new();
        diagnostics.add_dropped(3);
        diagnostics.record_success(10);
        diagnostics.record_failure();

        let json = serde_json::to_value(diagnostics.snapshot()).unwrap();
        assert_eq!(json["records.dropped"], 3);
        assert_eq!(json["records.exported"], 10);
        assert_eq!(json["batches.exported.success"], 1);
        assert_eq!(json["batches.exported.failed"], 1);
    }
}
