//! Retries driven by the response status code.

use super::Backoff;
use http::StatusCode;
use std::time::Duration;

/// Status codes treated as transient.
pub const RETRIABLE_STATUS_CODES: [StatusCode; 5] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::CONFLICT,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Returns `true` if `status` is in [`RETRIABLE_STATUS_CODES`].
pub fn is_retriable_status(status: StatusCode) -> bool {
    RETRIABLE_STATUS_CODES.contains(&status)
}

/// Decides whether a completed, non-successful response is retried.
///
/// The request method is not consulted: a transient status means the server
/// produced a well-formed answer, and such responses are retried for every
/// method. Transport failures are stricter, see
/// [`TransportFailureRetryPolicy`](super::TransportFailureRetryPolicy).
///
/// # Examples
///
/// ```
/// use steadfetch::retry::{Backoff, ResponseStatusRetryPolicy, ThreadRngJitter};
/// use http::StatusCode;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let backoff = Backoff::new(
///     Duration::from_millis(100),
///     Duration::from_millis(50),
///     Arc::new(ThreadRngJitter),
/// );
/// let policy = ResponseStatusRetryPolicy::new(3, backoff);
///
/// assert!(policy.decide(StatusCode::SERVICE_UNAVAILABLE, 3));
/// assert!(!policy.decide(StatusCode::SERVICE_UNAVAILABLE, 4));
/// assert!(!policy.decide(StatusCode::NOT_FOUND, 1));
/// ```
#[derive(Debug, Clone)]
pub struct ResponseStatusRetryPolicy {
    max_retries: usize,
    backoff: Backoff,
}

impl ResponseStatusRetryPolicy {
    pub fn new(max_retries: usize, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Returns `true` if the attempt numbered `attempt` (1-based) that
    /// produced `status` should be followed by another one.
    pub fn decide(&self, status: StatusCode, attempt: usize) -> bool {
        attempt <= self.max_retries && is_retriable_status(status)
    }

    /// The wait to apply before the next attempt, with fresh jitter.
    pub fn next_interval(&self) -> Duration {
        self.backoff.next_interval()
    }
}
