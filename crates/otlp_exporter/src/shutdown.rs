//! Shutdown coordination for the export task.
//!
//! Shutdown starts a flush with a hard budget. The budget becomes an absolute
//! deadline that every in-flight attempt and backoff sleep races against, so
//! the flush never overruns it no matter where the export task is waiting.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Triggers shutdown and publishes the flush deadline.
///
/// Only the first [`trigger`](Self::trigger) has effect; later calls are
/// no-ops and keep the original deadline.
#[derive(Debug)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    deadline_tx: watch::Sender<Option<Instant>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (deadline_tx, _) = watch::channel(None);
        Self {
            triggered: AtomicBool::new(false),
            deadline_tx,
        }
    }

    /// Starts shutdown with `budget` to flush. Returns `false` if shutdown was
    /// already in progress.
    pub fn trigger(&self, budget: Duration) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let deadline = Instant::now() + budget;
        self.deadline_tx.send_replace(Some(deadline));
        true
    }

    /// Returns `true` once shutdown has been initiated.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// A handle that observes the flush deadline.
    pub fn deadline(&self) -> FlushDeadline {
        FlushDeadline {
            rx: self.deadline_tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the flush deadline.
#[derive(Debug, Clone)]
pub struct FlushDeadline {
    rx: watch::Receiver<Option<Instant>>,
}

impl FlushDeadline {
    /// A deadline that is never set. For exporting outside a pipeline.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(None);
        Self { rx }
    }

    /// The deadline, once shutdown has set one.
    pub fn get(&self) -> Option<Instant> {
        *self.rx.borrow()
    }

    /// `true` if a deadline is set and has passed.
    pub fn is_expired(&self) -> bool {
        self.get().is_some_and(|d| Instant::now() >= d)
    }

    /// Completes once shutdown has set a deadline, returning it. Pending
    /// forever if shutdown never starts.
    pub async fn triggered(&self) -> Instant {
        let mut rx = self.rx.clone();
        let deadline = match rx.wait_for(Option::is_some).await {
            Ok(current) => *current,
            Err(_) => None,
        };
        match deadline {
            Some(deadline) => deadline,
            None => pending().await,
        }
    }

    /// Completes when the deadline passes. Pending forever if no deadline is
    /// ever set.
    pub async fn reached(&self) {
        let deadline = self.triggered().await;
        sleep_until(deadline).await;
    }
}
