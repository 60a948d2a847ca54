//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay
//! nothing for them.

// =============================================================================
// Bounded queue
// =============================================================================

/// Assert that the export queue never grows past its configured size.
///
/// **Invariant**: `queue.len() ≤ max_queue_size`
///
/// Used in: `DropPolicy::handle()` after every insertion
macro_rules! debug_assert_bounded_queue {
    ($len:expr, $max:expr) => {
        debug_assert!(
            $len <= $max,
            "bounded queue violated: length {} exceeds maximum {}",
            $len,
            $max
        )
    };
}

// =============================================================================
// Token bucket
// =============================================================================

/// Assert that the token level stays within `[0, capacity]`.
///
/// Used in: `BucketState::refill()` and `BucketState::try_take()`
macro_rules! debug_assert_tokens_in_range {
    ($tokens:expr, $capacity:expr) => {
        debug_assert!(
            $tokens >= 0.0 && $tokens <= $capacity,
            "token bucket violated: {} tokens outside [0, {}]",
            $tokens,
            $capacity
        )
    };
}

/// Assert that drop and block counters never exceed the call total.
///
/// Used in: `RateLimiter::acquire()` after recording an outcome
macro_rules! debug_assert_counters_consistent {
    ($dropped:expr, $blocked:expr, $total:expr) => {
        debug_assert!(
            $dropped + $blocked <= $total,
            "rate limiter counters violated: dropped {} + blocked {} > total {}",
            $dropped,
            $blocked,
            $total
        )
    };
}

// =============================================================================
// Span ownership
// =============================================================================

/// Assert that a span entering the queue was sealed exactly once.
///
/// Used in: `BatchStage::enqueue()` before handing the span to the drop policy
macro_rules! debug_assert_sealed {
    ($span:expr) => {
        debug_assert!(
            $span.is_ended(),
            "span {} entered the export queue without being sealed",
            $span.span_id
        )
    };
}

pub(crate) use debug_assert_bounded_queue;
pub(crate) use debug_assert_counters_consistent;
pub(crate) use debug_assert_sealed;
pub(crate) use debug_assert_tokens_in_range;
