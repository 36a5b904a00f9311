//! Retries driven by transport-level failures.

use super::{Backoff, RetryDecision};
use http::Method;
use std::error::Error as StdError;
use std::io;

/// Classification of a failure that happened before a response arrived.
///
/// The first four kinds are transient and may be retried. Everything else,
/// including protocol errors and DNS failures, is `NonRetriable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFailureKind {
    /// The connection closed before a response was received.
    NoResponseReceived,
    /// Establishing the connection took too long, or no pooled connection
    /// became available in time.
    ConnectTimeout,
    /// The remote host refused the connection.
    ConnectRefused,
    /// The connection went quiet for longer than the socket timeout.
    SocketReadTimeout,
    /// Any other failure.
    NonRetriable,
}

impl TransportFailureKind {
    /// Returns `true` for the four transient kinds.
    pub fn is_retriable(self) -> bool {
        !matches!(self, TransportFailureKind::NonRetriable)
    }
}

/// Classifies a `reqwest` error by walking its source chain.
pub fn classify(error: &reqwest::Error) -> TransportFailureKind {
    let dropped = causes(error)
        .filter_map(|e| e.downcast_ref::<hyper::Error>())
        .any(|e| e.is_incomplete_message())
        || has_io_kind(
            error,
            &[
                io::ErrorKind::ConnectionReset,
                io::ErrorKind::ConnectionAborted,
                io::ErrorKind::BrokenPipe,
                io::ErrorKind::UnexpectedEof,
            ],
        );

    FailureSignals {
        timeout: error.is_timeout(),
        connect: error.is_connect(),
        refused: has_io_kind(error, &[io::ErrorKind::ConnectionRefused]),
        dropped,
    }
    .kind()
}

/// What a failed request reported about itself.
#[derive(Debug, Clone, Copy, Default)]
struct FailureSignals {
    timeout: bool,
    connect: bool,
    refused: bool,
    /// The peer closed or reset the connection mid-exchange.
    dropped: bool,
}

impl FailureSignals {
    fn kind(self) -> TransportFailureKind {
        match self {
            Self {
                timeout: true,
                connect: true,
                ..
            } => TransportFailureKind::ConnectTimeout,
            Self { timeout: true, .. } => TransportFailureKind::SocketReadTimeout,
            Self {
                connect: true,
                refused: true,
                ..
            } => TransportFailureKind::ConnectRefused,
            Self { connect: true, .. } => TransportFailureKind::NonRetriable,
            Self { dropped: true, .. } => TransportFailureKind::NoResponseReceived,
            _ => TransportFailureKind::NonRetriable,
        }
    }
}

fn causes<'a>(
    error: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(error), |&e| e.source())
}

fn has_io_kind(error: &reqwest::Error, kinds: &[io::ErrorKind]) -> bool {
    causes(error)
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .any(|io| kinds.contains(&io.kind()))
}

/// Which request methods may be resent after a transport failure.
///
/// A method is idempotent unless it is listed as non-idempotent. Only `POST`
/// is listed by default.
///
/// # Examples
///
/// ```
/// use steadfetch::retry::IdempotencyPolicy;
/// use http::Method;
///
/// let policy = IdempotencyPolicy::default();
/// assert!(policy.is_idempotent(&Method::GET));
/// assert!(!policy.is_idempotent(&Method::POST));
///
/// let policy = policy.with_non_idempotent(Method::PATCH);
/// assert!(!policy.is_idempotent(&Method::PATCH));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    non_idempotent: Vec<Method>,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            non_idempotent: vec![Method::POST],
        }
    }
}

impl IdempotencyPolicy {
    /// Marks another method as non-idempotent.
    pub fn with_non_idempotent(mut self, method: Method) -> Self {
        if !self.non_idempotent.contains(&method) {
            self.non_idempotent.push(method);
        }
        self
    }

    pub fn is_idempotent(&self, method: &Method) -> bool {
        !self.non_idempotent.contains(method)
    }
}

/// Decides whether an attempt that failed at the transport level is retried.
///
/// Checks run in order: the attempt budget, the failure classification, then
/// the idempotency of the method. A transport failure gives no guarantee that
/// a non-idempotent request was not applied by the server, so those are never
/// resent. When every check passes the decision carries a freshly jittered
/// wait, which the caller is responsible for sleeping.
#[derive(Debug, Clone)]
pub struct TransportFailureRetryPolicy {
    max_retries: usize,
    idempotency: IdempotencyPolicy,
    backoff: Backoff,
}

impl TransportFailureRetryPolicy {
    pub fn new(max_retries: usize, idempotency: IdempotencyPolicy, backoff: Backoff) -> Self {
        Self {
            max_retries,
            idempotency,
            backoff,
        }
    }

    /// Decides what follows the failed attempt numbered `attempt` (1-based).
    pub fn decide(
        &self,
        kind: TransportFailureKind,
        attempt: usize,
        method: &Method,
    ) -> RetryDecision {
        if attempt > self.max_retries {
            return RetryDecision::stop();
        }
        if !kind.is_retriable() {
            return RetryDecision::stop();
        }
        if !self.idempotency.is_idempotent(method) {
            tracing::debug!(
                method = %method,
                kind = ?kind,
                "Not retrying non-idempotent request after transport failure"
            );
            return RetryDecision::stop();
        }
        RetryDecision::after(self.backoff.next_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{JitterSource, ThreadRngJitter};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const RETRIABLE: [TransportFailureKind; 4] = [
        TransportFailureKind::NoResponseReceived,
        TransportFailureKind::ConnectTimeout,
        TransportFailureKind::ConnectRefused,
        TransportFailureKind::SocketReadTimeout,
    ];

    fn policy(max_retries: usize) -> TransportFailureRetryPolicy {
        TransportFailureRetryPolicy::new(
            max_retries,
            IdempotencyPolicy::default(),
            Backoff::new(
                Duration::from_millis(100),
                Duration::from_millis(50),
                Arc::new(ThreadRngJitter),
            ),
        )
    }

    #[test]
    fn test_retriable_kinds_wait_within_window() {
        let p = policy(3);
        for kind in RETRIABLE {
            for attempt in 1..=3 {
                let decision = p.decide(kind, attempt, &Method::GET);
                assert!(decision.retry, "{kind:?} at attempt {attempt}");
                assert!(decision.wait >= Duration::from_millis(100));
                assert!(decision.wait < Duration::from_millis(150));
            }
        }
    }

    #[test]
    fn test_post_is_never_retried() {
        let p = policy(3);
        for kind in RETRIABLE {
            assert_eq!(p.decide(kind, 1, &Method::POST), RetryDecision::stop());
        }
    }

    #[test]
    fn test_budget_exhausted() {
        let p = policy(2);
        for kind in RETRIABLE {
            assert_eq!(p.decide(kind, 3, &Method::GET), RetryDecision::stop());
        }
        assert!(!policy(0).decide(TransportFailureKind::ConnectTimeout, 1, &Method::GET).retry);
    }

    #[test]
    fn test_non_retriable_kind_stops() {
        let decision = policy(5).decide(TransportFailureKind::NonRetriable, 1, &Method::GET);
        assert_eq!(decision, RetryDecision::stop());
    }

    #[test]
    fn test_extended_idempotency_policy() {
        struct Fixed;
        impl JitterSource for Fixed {
            fn sample(&self, _upper: Duration) -> Duration {
                Duration::from_millis(7)
            }
        }

        let p = TransportFailureRetryPolicy::new(
            1,
            IdempotencyPolicy::default().with_non_idempotent(Method::PATCH),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(20), Arc::new(Fixed)),
        );

        assert!(!p.decide(TransportFailureKind::ConnectRefused, 1, &Method::PATCH).retry);
        assert_eq!(
            p.decide(TransportFailureKind::ConnectRefused, 1, &Method::PUT),
            RetryDecision::after(Duration::from_millis(17))
        );
    }

    #[test]
    fn test_failure_signals_precedence() {
        let connect_timeout = FailureSignals {
            timeout: true,
            connect: true,
            ..Default::default()
        };
        assert_eq!(connect_timeout.kind(), TransportFailureKind::ConnectTimeout);

        let read_timeout = FailureSignals {
            timeout: true,
            dropped: true,
            ..Default::default()
        };
        assert_eq!(read_timeout.kind(), TransportFailureKind::SocketReadTimeout);

        let refused = FailureSignals {
            connect: true,
            refused: true,
            ..Default::default()
        };
        assert_eq!(refused.kind(), TransportFailureKind::ConnectRefused);

        // DNS and TLS failures surface as connect errors without a refusal.
        let unresolved = FailureSignals {
            connect: true,
            dropped: true,
            ..Default::default()
        };
        assert_eq!(unresolved.kind(), TransportFailureKind::NonRetriable);

        let reset = FailureSignals {
            dropped: true,
            ..Default::default()
        };
        assert_eq!(reset.kind(), TransportFailureKind::NoResponseReceived);
        assert_eq!(
            FailureSignals::default().kind(),
            TransportFailureKind::NonRetriable
        );
    }

    #[test]
    fn test_classify_builder_error_is_non_retriable() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert_eq!(classify(&err), TransportFailureKind::NonRetriable);
    }

    #[tokio::test]
    async fn test_classify_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::get(format!("http://{addr}/")).await.unwrap_err();
        assert_eq!(classify(&err), TransportFailureKind::ConnectRefused);
    }

    #[tokio::test]
    async fn test_classify_read_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let client = reqwest::Client::builder()
            .read_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let err = client.get(format!("http://{addr}/")).send().await.unwrap_err();

        assert_eq!(classify(&err), TransportFailureKind::SocketReadTimeout);
        server.abort();
    }

    #[tokio::test]
    async fn test_classify_closed_without_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
        });

        let err = reqwest::get(format!("http://{addr}/")).await.unwrap_err();
        assert_eq!(classify(&err), TransportFailureKind::NoResponseReceived);
    }
}
