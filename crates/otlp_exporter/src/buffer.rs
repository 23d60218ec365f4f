//! Batch Buffer
//!
//! A bounded queue between many producers and the single export task.
//!
//! - `push` is synchronous and is called from request-handling code. It only
//!   waits under [`OverflowPolicy::BlockWithTimeout`]; every other path takes
//!   the lock, appends or discards, and returns.
//! - `drain` is called by the export task only and hands out [`Batch`]es in
//!   insertion order, each stamped with the next number from a
//!   [`SequenceSource`]. Lanes of one pipeline share a source, so a number is
//!   never handed out twice by the same exporter.
//! - Batches that failed export can be put back at the front once with
//!   `requeue`; they keep their sequence number.
//!
//! A single `std::sync::Mutex` guards all state. Critical sections are a
//! `VecDeque` push or a bounded `drain(..n)`, so contention stays short.
//! Lock poisoning is tolerated: telemetry must never take a producer down.

use crate::batch::Batch;
use crate::config::OverflowPolicy;
use crate::diagnostics::Diagnostics;
use crate::invariants::{
    debug_assert_batch_bounded, debug_assert_sequence_advances, debug_assert_within_capacity,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Sizing and overflow behaviour of a [`BatchBuffer`].
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum records held, requeued batches included.
    pub capacity: usize,
    /// Pending count at which the export task is woken early.
    pub flush_threshold: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long a producer may wait under `BlockWithTimeout`.
    pub block_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 2_048,
            flush_threshold: 512,
            overflow_policy: OverflowPolicy::DropNewest,
            block_timeout: Duration::from_millis(50),
        }
    }
}

/// Batch sequence counter, shared by every buffer of one exporter.
#[derive(Debug, Clone, Default)]
pub struct SequenceSource(Arc<AtomicU64>);

impl SequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The number the next batch will get.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// What happened to a pushed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Record appended.
    Accepted,
    /// Buffer full; the pushed record was discarded.
    DroppedNewest,
    /// Buffer full; the oldest record was evicted and the pushed record appended.
    DroppedOldest,
    /// Buffer closed for shutdown; the pushed record was discarded.
    Closed,
}

impl PushOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, PushOutcome::Accepted | PushOutcome::DroppedOldest)
    }
}

struct State<T> {
    records: VecDeque<T>,
    /// Failed batches waiting for another attempt, served before `records`.
    requeued: VecDeque<Batch<T>>,
    requeued_len: usize,
    last_sequence: Option<u64>,
    closed: bool,
}

impl<T> State<T> {
    fn len(&self) -> usize {
        self.records.len() + self.requeued_len
    }
}

/// Bounded multi-producer / single-consumer record queue.
pub struct BatchBuffer<T> {
    state: Mutex<State<T>>,
    /// Signalled by `drain` and `close` for producers blocked on a full buffer.
    space_available: Condvar,
    config: BufferConfig,
    diagnostics: Arc<Diagnostics>,
    /// Wakes the export task once `flush_threshold` records are pending.
    flush_trigger: Arc<Notify>,
    sequences: SequenceSource,
}

impl<T> BatchBuffer<T> {
    /// A standalone buffer with its own sequence counter.
    pub fn new(config: BufferConfig, diagnostics: Arc<Diagnostics>, flush_trigger: Arc<Notify>) -> Self {
        Self::with_sequences(config, diagnostics, flush_trigger, SequenceSource::new())
    }

    /// A buffer numbering its batches from `sequences`.
    pub fn with_sequences(
        config: BufferConfig,
        diagnostics: Arc<Diagnostics>,
        flush_trigger: Arc<Notify>,
        sequences: SequenceSource,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                records: VecDeque::with_capacity(config.capacity.min(4_096)),
                requeued: VecDeque::new(),
                requeued_len: 0,
                last_sequence: None,
                closed: false,
            }),
            space_available: Condvar::new(),
            config,
            diagnostics,
            flush_trigger,
            sequences,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record, applying the overflow policy when full. Never fails.
    pub fn push(&self, record: T) -> PushOutcome {
        let capacity = self.config.capacity;
        let mut state = self.lock();
        let mut outcome = PushOutcome::Accepted;

        if state.closed {
            drop(state);
            self.diagnostics.add_dropped(1);
            return PushOutcome::Closed;
        }

        if state.len() >= capacity {
            match self.config.overflow_policy {
                OverflowPolicy::DropNewest => {
                    drop(state);
                    self.diagnostics.add_dropped(1);
                    return PushOutcome::DroppedNewest;
                }
                OverflowPolicy::DropOldest => {
                    // Requeued batches are not evicted; with only those left, drop the newcomer.
                    if state.records.pop_front().is_none() {
                        drop(state);
                        self.diagnostics.add_dropped(1);
                        return PushOutcome::DroppedNewest;
                    }
                    self.diagnostics.add_dropped(1);
                    outcome = PushOutcome::DroppedOldest;
                }
                OverflowPolicy::BlockWithTimeout => {
                    self.flush_trigger.notify_one();
                    let deadline = Instant::now() + self.config.block_timeout;
                    while state.len() >= capacity && !state.closed {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, _) = self
                            .space_available
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner);
                        state = guard;
                    }
                    if state.closed || state.len() >= capacity {
                        let closed = state.closed;
                        drop(state);
                        self.diagnostics.add_dropped(1);
                        return if closed {
                            PushOutcome::Closed
                        } else {
                            PushOutcome::DroppedNewest
                        };
                    }
                }
            }
        }

        state.records.push_back(record);
        let len = state.len();
        debug_assert_within_capacity!(len, capacity);
        drop(state);

        self.diagnostics.add_accepted(1);
        if len >= self.config.flush_threshold {
            self.flush_trigger.notify_one();
        }
        outcome
    }

    /// Removes up to `max_batch_size` records in insertion order.
    ///
    /// A requeued batch, if any, is returned first and unchanged. Returns
    /// `None` when nothing is pending.
    pub fn drain(&self, max_batch_size: usize) -> Option<Batch<T>> {
        let mut state = self.lock();

        if let Some(batch) = state.requeued.pop_front() {
            state.requeued_len -= batch.len();
            drop(state);
            self.space_available.notify_all();
            return Some(batch);
        }

        if state.records.is_empty() || max_batch_size == 0 {
            return None;
        }

        let take = max_batch_size.min(state.records.len());
        let records: Vec<T> = state.records.drain(..take).collect();
        let sequence = self.sequences.next();
        debug_assert_sequence_advances!(state.last_sequence, sequence);
        state.last_sequence = Some(sequence);
        drop(state);

        debug_assert_batch_bounded!(records.len(), max_batch_size);
        self.space_available.notify_all();
        Some(Batch::new(sequence, records))
    }

    /// Puts a failed batch back at the front of the buffer.
    ///
    /// A batch is requeued at most once; a second attempt (or a closed
    /// buffer) hands the batch back so the caller can drop it.
    pub fn requeue(&self, mut batch: Batch<T>) -> Result<(), Batch<T>> {
        if batch.is_requeued() {
            return Err(batch);
        }
        let mut state = self.lock();
        if state.closed {
            return Err(batch);
        }
        batch.mark_requeued();
        state.requeued_len += batch.len();
        state.requeued.push_back(batch);
        Ok(())
    }

    /// Stops accepting records and wakes blocked producers. Pending records stay drainable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.space_available.notify_all();
        self.flush_trigger.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pending records, requeued batches included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches `drain(max_batch_size)` would hand out for what is pending now.
    pub fn pending_batches(&self, max_batch_size: usize) -> usize {
        if max_batch_size == 0 {
            return 0;
        }
        let state = self.lock();
        state.requeued.len() + state.records.len().div_ceil(max_batch_size)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn buffer(capacity: usize, policy: OverflowPolicy) -> BatchBuffer<u64> {
        BatchBuffer::new(
            BufferConfig {
                capacity,
                flush_threshold: capacity,
                overflow_policy: policy,
                block_timeout: Duration::from_millis(20),
            },
            Arc::new(Diagnostics::new()),
            Arc::new(Notify::new()),
        )
    }

    fn drain_all(buffer: &BatchBuffer<u64>, max: usize) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(batch) = buffer.drain(max) {
            out.extend(batch.into_records());
        }
        out
    }

    #[test]
    fn test_drain_returns_insertion_order() {
        let buffer = buffer(100, OverflowPolicy::DropNewest);
        for i in 0..50 {
            assert_eq!(buffer.push(i), PushOutcome::Accepted);
        }
        assert_eq!(drain_all(&buffer, 7), (0..50).collect::<Vec<_>>());
        assert!(buffer.drain(7).is_none());
    }

    #[test]
    fn test_drop_newest_scenario() {
        // maxQueueSize=3: push A,B,C,D -> [A,B,C]
        let buffer = buffer(3, OverflowPolicy::DropNewest);
        assert_eq!(buffer.push(b'A' as u64), PushOutcome::Accepted);
        assert_eq!(buffer.push(b'B' as u64), PushOutcome::Accepted);
        assert_eq!(buffer.push(b'C' as u64), PushOutcome::Accepted);
        assert_eq!(buffer.push(b'D' as u64), PushOutcome::DroppedNewest);

        let batch = buffer.drain(10).unwrap();
        assert_eq!(batch.records(), &[b'A' as u64, b'B' as u64, b'C' as u64]);
        assert_eq!(buffer.diagnostics.records_dropped(), 1);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let n = 5;
        let buffer = buffer(n, OverflowPolicy::DropOldest);
        for i in 1..=n as u64 {
            buffer.push(i);
        }
        assert_eq!(buffer.push(n as u64 + 1), PushOutcome::DroppedOldest);
        assert_eq!(drain_all(&buffer, 100), (2..=n as u64 + 1).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequence_numbers_strictly_increase_without_gaps() {
        let buffer = buffer(1_000, OverflowPolicy::DropNewest);
        for i in 0..100 {
            buffer.push(i);
        }
        let mut sequences = Vec::new();
        while let Some(batch) = buffer.drain(9) {
            assert!(batch.len() <= 9);
            sequences.push(batch.sequence());
        }
        let expected: Vec<u64> = (0..sequences.len() as u64).collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn test_requeue_keeps_sequence_and_goes_first() {
        let buffer = buffer(10, OverflowPolicy::DropNewest);
        for i in 0..4 {
            buffer.push(i);
        }
        let first = buffer.drain(2).unwrap();
        assert_eq!(first.sequence(), 0);
        buffer.requeue(first).unwrap();
        assert_eq!(buffer.len(), 4);

        let again = buffer.drain(2).unwrap();
        assert_eq!(again.sequence(), 0);
        assert!(again.is_requeued());
        assert_eq!(again.records(), &[0, 1]);

        // Second requeue refused
        let refused = buffer.requeue(again).unwrap_err();
        assert_eq!(refused.records(), &[0, 1]);

        let next = buffer.drain(2).unwrap();
        assert_eq!(next.sequence(), 1);
        assert_eq!(next.records(), &[2, 3]);
    }

    #[test]
    fn test_pending_batches_counts_requeued_separately() {
        let buffer = buffer(100, OverflowPolicy::DropNewest);
        assert_eq!(buffer.pending_batches(10), 0);
        buffer.push(0);
        let batch = buffer.drain(10).unwrap();
        buffer.requeue(batch).unwrap();
        for i in 1..=11 {
            buffer.push(i);
        }
        assert_eq!(buffer.pending_batches(10), 3);

        let mut drained = 0;
        while buffer.drain(10).is_some() {
            drained += 1;
        }
        assert_eq!(drained, 3);
    }

    #[test]
    fn test_requeued_records_count_toward_capacity() {
        let buffer = buffer(3, OverflowPolicy::DropNewest);
        for i in 0..3 {
            buffer.push(i);
        }
        let batch = buffer.drain(3).unwrap();
        buffer.requeue(batch).unwrap();
        assert_eq!(buffer.push(99), PushOutcome::DroppedNewest);
    }

    #[test]
    fn test_drop_oldest_never_evicts_requeued_records() {
        let buffer = buffer(3, OverflowPolicy::DropOldest);
        for i in 0..3 {
            buffer.push(i);
        }
        let batch = buffer.drain(3).unwrap();
        buffer.requeue(batch).unwrap();

        // Only requeued records are pending, so the newcomer is the one dropped.
        assert_eq!(buffer.push(99), PushOutcome::DroppedNewest);
        assert_eq!(buffer.diagnostics.records_dropped(), 1);
        assert_eq!(buffer.len(), 3);

        let again = buffer.drain(3).unwrap();
        assert!(again.is_requeued());
        assert_eq!(again.records(), &[0, 1, 2]);
        assert!(buffer.drain(3).is_none());
    }

    #[test]
    fn test_shared_sequence_source_never_repeats_across_buffers() {
        let sequences = SequenceSource::new();
        let diagnostics = Arc::new(Diagnostics::new());
        let trigger = Arc::new(Notify::new());
        let lanes: Vec<BatchBuffer<u64>> = (0..3)
            .map(|_| {
                BatchBuffer::with_sequences(
                    BufferConfig::default(),
                    Arc::clone(&diagnostics),
                    Arc::clone(&trigger),
                    sequences.clone(),
                )
            })
            .collect();

        let mut seen = Vec::new();
        for round in 0..4u64 {
            for lane in &lanes {
                lane.push(round);
                seen.push(lane.drain(10).unwrap().sequence());
            }
        }
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(sequences.peek(), 12);
    }

    #[test]
    fn test_block_with_timeout_falls_back_to_drop_newest() {
        let buffer = buffer(2, OverflowPolicy::BlockWithTimeout);
        buffer.push(1);
        buffer.push(2);

        let start = Instant::now();
        assert_eq!(buffer.push(3), PushOutcome::DroppedNewest);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(drain_all(&buffer, 10), vec![1, 2]);
    }

    #[test]
    fn test_block_with_timeout_resumes_when_drained() {
        let buffer = Arc::new(BatchBuffer::new(
            BufferConfig {
                capacity: 1,
                flush_threshold: 1,
                overflow_policy: OverflowPolicy::BlockWithTimeout,
                block_timeout: Duration::from_secs(5),
            },
            Arc::new(Diagnostics::new()),
            Arc::new(Notify::new()),
        ));
        buffer.push(1);

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.drain(1).unwrap().records(), &[1]);

        assert_eq!(producer.join().unwrap(), PushOutcome::Accepted);
        assert_eq!(buffer.drain(1).unwrap().records(), &[2]);
    }

    #[test]
    fn test_closed_buffer_rejects_but_still_drains() {
        let buffer = buffer(10, OverflowPolicy::DropNewest);
        buffer.push(1);
        buffer.close();
        assert_eq!(buffer.push(2), PushOutcome::Closed);
        assert_eq!(drain_all(&buffer, 10), vec![1]);
        assert_eq!(buffer.diagnostics.records_dropped(), 1);
    }

    #[tokio::test]
    async fn test_flush_threshold_wakes_consumer() {
        let trigger = Arc::new(Notify::new());
        let buffer = BatchBuffer::new(
            BufferConfig {
                capacity: 10,
                flush_threshold: 3,
                ..Default::default()
            },
            Arc::new(Diagnostics::new()),
            Arc::clone(&trigger),
        );
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);

        let woke = tokio::time::timeout(Duration::from_millis(100), trigger.notified()).await;
        assert!(woke.is_ok());
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let buffer = Arc::new(buffer(100_000, OverflowPolicy::DropNewest));
        let handles: Vec<_> = (0..8u64)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for seq in 0..1_000u64 {
                        buffer.push(producer << 32 | seq);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all = drain_all(&buffer, 512);
        assert_eq!(all.len(), 8_000);
        for producer in 0..8u64 {
            let seqs: Vec<u64> = all
                .iter()
                .filter(|v| *v >> 32 == producer)
                .map(|v| v & 0xFFFF_FFFF)
                .collect();
            assert_eq!(seqs, (0..1_000).collect::<Vec<_>>());
        }
    }
}
