//! Debug assertion macros for buffer, batch and backoff invariants.
//!
//! Only active in debug builds; release builds compile them away.

// =============================================================================
// Bounded batches
// =============================================================================

/// Assert that a drained batch never exceeds the requested size.
///
/// Used in: `BatchBuffer::drain()`
macro_rules! debug_assert_batch_bounded {
    ($len:expr, $max:expr) => {
        debug_assert!(
            $len <= $max,
            "batch of {} records exceeds max batch size {}",
            $len,
            $max
        )
    };
}

// =============================================================================
// Strictly increasing sequence numbers
// =============================================================================

/// Assert that a lane hands out sequence numbers in strictly increasing order.
///
/// Used in: `BatchBuffer::drain()`
macro_rules! debug_assert_sequence_advances {
    ($previous:expr, $assigned:expr) => {
        debug_assert!(
            $previous.map_or(true, |prev: u64| $assigned > prev),
            "sequence {} assigned after {:?}",
            $assigned,
            $previous
        )
    };
}

// =============================================================================
// Capacity
// =============================================================================

/// Assert that the buffer holds no more than its capacity after a push.
///
/// Used in: `BatchBuffer::push()`
macro_rules! debug_assert_within_capacity {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "buffer holds {} records, capacity is {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// Backoff
// =============================================================================

/// Assert that backoff delays never shrink and never exceed the cap.
///
/// Used in: `Backoff::next_delay()`
macro_rules! debug_assert_backoff_monotone {
    ($prev:expr, $next:expr, $max:expr) => {
        debug_assert!(
            $next >= $prev && $next <= $max,
            "backoff delay {:?} not within [{:?}, {:?}]",
            $next,
            $prev,
            $max
        )
    };
}

pub(crate) use debug_assert_backoff_monotone;
pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_sequence_advances;
pub(crate) use debug_assert_within_capacity;
