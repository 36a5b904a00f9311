//! Retry decisions for transient failures.
//!
//! Two policies share one [`Backoff`]:
//!
//! - [`TransportFailureRetryPolicy`] handles failures that happen before a
//!   response arrives. It is gated by the attempt budget, the failure
//!   classification and the idempotency of the request method.
//! - [`ResponseStatusRetryPolicy`] handles completed responses whose status is
//!   in [`RETRIABLE_STATUS_CODES`]. It is gated by the attempt budget only.
//!
//! Neither policy sleeps. The caller waits for the returned interval before
//! starting the next attempt.

mod backoff;
mod status;
mod transport;

pub use backoff::{Backoff, JitterSource, SeededJitter, ThreadRngJitter};
pub use status::{is_retriable_status, ResponseStatusRetryPolicy, RETRIABLE_STATUS_CODES};
pub use transport::{classify, IdempotencyPolicy, TransportFailureKind, TransportFailureRetryPolicy};

use std::time::Duration;

/// The outcome of a single retry decision.
///
/// Produced fresh for every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub retry: bool,
    /// How long to wait before the next attempt. Zero when `retry` is false.
    pub wait: Duration,
}

impl RetryDecision {
    /// A decision to give up.
    pub const fn stop() -> Self {
        Self {
            retry: false,
            wait: Duration::ZERO,
        }
    }

    /// A decision to retry after `wait`.
    pub const fn after(wait: Duration) -> Self {
        Self { retry: true, wait }
    }
}
