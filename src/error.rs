//! Error types for client construction and GET requests.
//!
//! A logical request surfaces exactly one [`Error`]. Every variant raised by
//! the request path records how many attempts were made, and keeps the
//! classification, status, or body that caused the final failure.

use crate::pool::Route;
use crate::retry::TransportFailureKind;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// The main error type of the client.
///
/// # Examples
///
/// ```no_run
/// use steadfetch::{Client, ClientConfig, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::new(ClientConfig::builder().build()?);
///
/// match client.get::<serde_json::Value>("https://api.example.com/items").await {
///     Ok(value) => println!("Got {value}"),
///     Err(Error::Response { status, reason, attempts, .. }) => {
///         eprintln!("HTTP {status} ({reason}) after {attempts} attempts");
///     }
///     Err(Error::Transport { kind, attempts, .. }) => {
///         eprintln!("Transport failure {kind:?} after {attempts} attempts");
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration was provided. Raised at construction time only.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The target URL could not be parsed or has no host.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A low-level failure occurred before a well-formed response arrived.
    ///
    /// `kind` is the classification used for the retry decision. Classified
    /// kinds were retried until the budget ran out; `NonRetriable` failures
    /// are raised on the attempt they occur.
    ///
    /// Also raised, as `NonRetriable`, when a new pooled connection cannot be
    /// created.
    #[error("Transport error ({kind:?}) after {attempts} attempt(s): {source}")]
    Transport {
        /// The classification of the final failure
        kind: TransportFailureKind,
        /// Number of attempts made, including the initial one
        attempts: usize,
        /// The underlying transport error
        #[source]
        source: reqwest::Error,
    },

    /// No pooled connection became available within the request timeout.
    #[error("No connection to {route} available within {waited:?} after {attempts} attempt(s)")]
    PoolExhausted {
        /// The route the connection was requested for
        route: Route,
        /// How long the final attempt waited
        waited: Duration,
        /// Number of attempts made, including the initial one
        attempts: usize,
    },

    /// The connection pool was shut down.
    #[error("Connection pool is closed (after {attempts} attempt(s))")]
    PoolClosed {
        /// Number of attempts made, including the one that found the pool closed
        attempts: usize,
    },

    /// The server answered with a non-200 status that was not retried, or
    /// the retry budget ran out.
    #[error("HTTP error {status} ({reason}) after {attempts} attempt(s)")]
    Response {
        /// The HTTP status code
        status: StatusCode,
        /// The reason phrase for the status
        reason: String,
        /// The raw response body, empty if it could not be read
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
        /// Number of attempts made, including the initial one
        attempts: usize,
    },

    /// The response was 200 but the body did not decode into the target type.
    #[error("Failed to decode response (status {status}) after {attempts} attempt(s): {serde_error}")]
    Decode {
        /// The raw response body that failed to decode
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
        /// Number of attempts made, including the initial one
        attempts: usize,
    },

    /// The response was 200 but its body could not be read.
    #[error("Failed to read response body after {attempts} attempt(s): {source}")]
    BodyRead {
        /// Number of attempts made, including the initial one
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    /// Returns the transport classification of this error, if it has one.
    ///
    /// Pool exhaustion is reported as [`TransportFailureKind::ConnectTimeout`].
    pub fn transport_kind(&self) -> Option<TransportFailureKind> {
        match self {
            Error::Transport { kind, .. } => Some(*kind),
            Error::PoolExhausted { .. } => Some(TransportFailureKind::ConnectTimeout),
            _ => None,
        }
    }

    /// Returns `true` if the failure class is one the client retries.
    ///
    /// This looks at the classification only. Whether a retry actually happens
    /// also depends on the attempt budget and, for transport failures, on the
    /// request method.
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfetch::Error;
    /// use http::{HeaderMap, StatusCode};
    ///
    /// let err = Error::Response {
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     reason: "Service Unavailable".to_string(),
    ///     raw_response: String::new(),
    ///     headers: HeaderMap::new(),
    ///     attempts: 4,
    /// };
    /// assert!(err.is_retriable());
    ///
    /// let err = Error::Response {
    ///     status: StatusCode::NOT_FOUND,
    ///     reason: "Not Found".to_string(),
    ///     raw_response: String::new(),
    ///     headers: HeaderMap::new(),
    ///     attempts: 1,
    /// };
    /// assert!(!err.is_retriable());
    /// ```
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Transport { kind, .. } => kind.is_retriable(),
            Error::PoolExhausted { .. } => true,
            Error::Response { status, .. } => crate::retry::is_retriable_status(*status),
            Error::Configuration(_)
            | Error::InvalidUrl(_)
            | Error::PoolClosed { .. }
            | Error::Decode { .. }
            | Error::BodyRead { .. } => false,
        }
    }

    /// Returns the HTTP status code if the server answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Response { status, .. } => Some(*status),
            Error::Decode { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Response { raw_response, .. } => Some(raw_response),
            Error::Decode { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the number of attempts made before this error was raised.
    ///
    /// `None` for errors raised before the first attempt.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Error::Transport { attempts, .. }
            | Error::PoolExhausted { attempts, .. }
            | Error::PoolClosed { attempts }
            | Error::Response { attempts, .. }
            | Error::Decode { attempts, .. }
            | Error::BodyRead { attempts, .. } => Some(*attempts),
            Error::Configuration(_) | Error::InvalidUrl(_) => None,
        }
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_is_a_retriable_connect_timeout() {
        let err = Error::PoolExhausted {
            route: Route::new("http", "localhost", 8080),
            waited: Duration::from_millis(10),
            attempts: 2,
        };

        assert_eq!(
            err.transport_kind(),
            Some(TransportFailureKind::ConnectTimeout)
        );
        assert!(err.is_retriable());
        assert_eq!(err.attempts(), Some(2));
        assert!(err.to_string().contains("http://localhost:8080"));
    }

    #[test]
    fn test_decode_error_is_terminal() {
        let err = Error::Decode {
            raw_response: "{".to_string(),
            serde_error: "EOF while parsing".to_string(),
            status: StatusCode::OK,
            attempts: 3,
        };

        assert!(!err.is_retriable());
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.status(), Some(StatusCode::OK));
        assert_eq!(err.raw_response(), Some("{"));
        assert_eq!(err.transport_kind(), None);
    }

    #[test]
    fn test_conflict_status_is_retriable() {
        let err = Error::Response {
            status: StatusCode::CONFLICT,
            reason: "Conflict".to_string(),
            raw_response: "busy".to_string(),
            headers: HeaderMap::new(),
            attempts: 1,
        };

        assert!(err.is_retriable());
        assert_eq!(err.raw_response(), Some("busy"));
        assert_eq!(
            err.to_string(),
            "HTTP error 409 Conflict (Conflict) after 1 attempt(s)"
        );
    }

    #[test]
    fn test_errors_before_first_attempt_have_no_count() {
        assert_eq!(Error::Configuration("bad".to_string()).attempts(), None);
        assert_eq!(Error::PoolClosed { attempts: 1 }.attempts(), Some(1));
        assert!(!Error::PoolClosed { attempts: 1 }.is_retriable());
    }
}
