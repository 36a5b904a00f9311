//! Decoded response together with the details of the exchange that produced it.

use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// A successfully decoded response.
///
/// Returned by [`Client::fetch`](crate::Client::fetch). Dereferences to the
/// decoded value.
///
/// # Examples
///
/// ```no_run
/// use steadfetch::{Client, ClientConfig};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Quota {
///     used: u64,
///     limit: u64,
/// }
///
/// # async fn example() -> Result<(), steadfetch::Error> {
/// let client = Client::new(ClientConfig::builder().build()?);
/// let response = client.fetch::<Quota>("https://usage.example.com/quota").await?;
///
/// println!("{} of {}", response.used, response.limit);
/// println!("took {:?} over {} attempt(s)", response.latency, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The decoded body.
    pub data: T,

    /// The body exactly as received.
    pub raw_body: String,

    /// Always `200 OK`.
    pub status: StatusCode,

    pub headers: HeaderMap,

    /// Time from the start of the first attempt until the body was decoded,
    /// backoff waits included.
    pub latency: Duration,

    /// Number of attempts made, `1` if the first one succeeded.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Consumes the response, returning the decoded value.
    pub fn into_inner(self) -> T {
        self.data
    }

    /// Returns `true` if the request needed more than one attempt.
    ///
    /// # Examples
    ///
    /// ```
    /// # use steadfetch::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response {
    ///     data: 7u32,
    ///     raw_body: "7".to_string(),
    ///     status: StatusCode::OK,
    ///     headers: HeaderMap::new(),
    ///     latency: Duration::from_millis(250),
    ///     attempts: 2,
    /// };
    ///
    /// assert!(response.was_retried());
    /// assert_eq!(response.into_inner(), 7);
    /// ```
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
