//! GET client that retries transient failures over a bounded connection pool.
//!
//! The [`Client`] type is the main entry point. Each logical request runs as a
//! strict sequence of attempts: acquire a pooled connection, send the request,
//! release the connection, then either decode the body, fail, or wait and try
//! again.

use crate::{
    attempt::RequestAttempt,
    pool::{ConnectionPool, PoolError, PoolStats, Route},
    retry::{
        classify, Backoff, IdempotencyPolicy, JitterSource, ResponseStatusRetryPolicy,
        ThreadRngJitter, TransportFailureKind, TransportFailureRetryPolicy,
    },
    ClientConfig, Error, Response, Result,
};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// A pooled, retrying client for JSON GET requests.
///
/// The client is meant to be created once and shared. Cloning is cheap and
/// clones share the same connection pool.
///
/// # Examples
///
/// ```no_run
/// use steadfetch::{Client, ClientConfig};
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Account {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), steadfetch::Error> {
/// let config = ClientConfig::builder()
///     .max_connections(16)
///     .socket_timeout(Duration::from_secs(3))
///     .max_retries(2)
///     .retry_interval(Duration::from_millis(100))
///     .jitter(Duration::from_millis(50))
///     .build()?;
/// let client = Client::new(config);
///
/// let account: Account = client.get("https://core.example.com/accounts/42").await?;
/// println!("{} -> {}", account.id, account.name);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool,
    transport_policy: TransportFailureRetryPolicy,
    status_policy: ResponseStatusRetryPolicy,
}

/// An attempt that produced a response, with the connection already released.
struct Completed {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: reqwest::Result<String>,
}

/// An attempt that failed before a response arrived.
enum AttemptFailure {
    Transport(reqwest::Error),
    Pool(PoolError),
}

impl AttemptFailure {
    fn kind(&self) -> TransportFailureKind {
        match self {
            AttemptFailure::Transport(e) => classify(e),
            AttemptFailure::Pool(PoolError::Exhausted { .. }) => TransportFailureKind::ConnectTimeout,
            AttemptFailure::Pool(_) => TransportFailureKind::NonRetriable,
        }
    }

    fn into_error(self, kind: TransportFailureKind, attempts: usize) -> Error {
        match self {
            AttemptFailure::Transport(source) => Error::Transport {
                kind,
                attempts,
                source,
            },
            AttemptFailure::Pool(PoolError::Exhausted { route, waited }) => Error::PoolExhausted {
                route,
                waited,
                attempts,
            },
            AttemptFailure::Pool(PoolError::Closed) => Error::PoolClosed { attempts },
            AttemptFailure::Pool(PoolError::Build(source)) => Error::Transport {
                kind,
                attempts,
                source,
            },
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Transport(e) => write!(f, "{}", e),
            AttemptFailure::Pool(e) => write!(f, "{}", e),
        }
    }
}

impl Client {
    /// Creates a client with default jitter and idempotency settings.
    pub fn new(config: ClientConfig) -> Self {
        Self::from_parts(config, Arc::new(ThreadRngJitter), IdempotencyPolicy::default())
    }

    /// Creates a new `ClientBuilder`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn from_parts(
        config: ClientConfig,
        jitter: Arc<dyn JitterSource>,
        idempotency: IdempotencyPolicy,
    ) -> Self {
        let backoff = Backoff::new(config.retry_interval(), config.jitter(), jitter);
        let transport_policy =
            TransportFailureRetryPolicy::new(config.max_retries(), idempotency, backoff.clone());
        let status_policy = ResponseStatusRetryPolicy::new(config.max_retries(), backoff);
        let pool = ConnectionPool::new(&config);

        Client {
            inner: Arc::new(ClientInner {
                config,
                pool,
                transport_policy,
                status_policy,
            }),
        }
    }

    /// Fetches `url` and decodes the JSON body into `T`.
    ///
    /// Unknown JSON fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns the single terminal error of the request; see [`Error`].
    pub async fn get<T>(&self, url: impl AsRef<str>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.fetch(url).await.map(Response::into_inner)
    }

    /// Like [`get`](Self::get), but keeps the raw body, headers, latency and
    /// attempt count alongside the decoded value.
    pub async fn fetch<T>(&self, url: impl AsRef<str>) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let url = Url::parse(url.as_ref())?;
        let route = Route::from_url(&url)?;
        let mut attempt = RequestAttempt::first(Method::GET, url);
        let start_time = Instant::now();

        loop {
            let delay = match self.execute(&attempt, &route).await {
                Ok(completed) if completed.status == StatusCode::OK => {
                    return decode(completed, start_time.elapsed(), attempt.number());
                }
                Ok(completed) => self.on_status(completed, &attempt)?,
                Err(failure) => self.on_failure(failure, &attempt)?,
            };

            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = attempt.number(),
                url = %attempt.url(),
                "Retrying request after delay"
            );
            tokio::time::sleep(delay).await;
            attempt.next();
        }
    }

    /// Runs one attempt. The connection is released before this returns.
    async fn execute(
        &self,
        attempt: &RequestAttempt,
        route: &Route,
    ) -> std::result::Result<Completed, AttemptFailure> {
        let mut conn = self
            .inner
            .pool
            .acquire(route)
            .await
            .map_err(AttemptFailure::Pool)?;

        tracing::debug!(
            method = %attempt.method(),
            url = %attempt.url(),
            attempt = attempt.number(),
            reused = conn.is_reused(),
            "Executing HTTP request"
        );

        let sent = conn
            .client()
            .request(attempt.method().clone(), attempt.url().clone())
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                conn.mark_broken();
                return Err(AttemptFailure::Transport(e));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let reason = reason_phrase(&response);

        tracing::info!(
            status = status.as_u16(),
            attempt = attempt.number(),
            "Received HTTP response"
        );

        let body = response.text().await;
        if body.is_err() {
            conn.mark_broken();
        }

        Ok(Completed {
            status,
            reason,
            headers,
            body,
        })
    }

    /// Handles a non-200 response: the backoff to apply, or the terminal error.
    fn on_status(&self, completed: Completed, attempt: &RequestAttempt) -> Result<Duration> {
        let Completed {
            status,
            reason,
            headers,
            body,
        } = completed;
        let raw_response = body.unwrap_or_default();

        if status.is_server_error() {
            tracing::warn!(
                status = status.as_u16(),
                attempt = attempt.number(),
                response = %raw_response,
                "Server error (5xx)"
            );
        } else {
            tracing::warn!(
                status = status.as_u16(),
                attempt = attempt.number(),
                response = %raw_response,
                "Unexpected status"
            );
        }

        let policy = &self.inner.status_policy;
        if !policy.decide(status, attempt.number()) {
            return Err(Error::Response {
                status,
                reason,
                raw_response,
                headers,
                attempts: attempt.number(),
            });
        }
        Ok(policy.next_interval())
    }

    /// Handles a transport failure: the backoff to apply, or the terminal error.
    fn on_failure(&self, failure: AttemptFailure, attempt: &RequestAttempt) -> Result<Duration> {
        let kind = failure.kind();
        tracing::warn!(
            error = %failure,
            kind = ?kind,
            attempt = attempt.number(),
            method = %attempt.method(),
            url = %attempt.url(),
            "Request failed"
        );

        let decision = self
            .inner
            .transport_policy
            .decide(kind, attempt.number(), attempt.method());
        if !decision.retry {
            return Err(failure.into_error(kind, attempt.number()));
        }
        Ok(decision.wait)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current usage of the connection pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Closes the connection pool. Later requests fail with [`Error::PoolClosed`].
    pub fn shutdown(&self) {
        self.inner.pool.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

fn decode<T>(completed: Completed, latency: Duration, attempts: usize) -> Result<Response<T>>
where
    T: DeserializeOwned,
{
    let raw_body = completed
        .body
        .map_err(|source| Error::BodyRead { attempts, source })?;

    match serde_json::from_str::<T>(&raw_body) {
        Ok(data) => Ok(Response {
            data,
            raw_body,
            status: completed.status,
            headers: completed.headers,
            latency,
            attempts,
        }),
        Err(e) => {
            tracing::error!(
                error = %e,
                raw_response = %raw_body,
                "Failed to decode response"
            );

            Err(Error::Decode {
                raw_response: raw_body,
                serde_error: e.to_string(),
                status: completed.status,
                attempts,
            })
        }
    }
}

/// The server's reason phrase, falling back to the canonical one.
fn reason_phrase(response: &reqwest::Response) -> String {
    response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|phrase| std::str::from_utf8(phrase.as_bytes()).ok())
        .or_else(|| response.status().canonical_reason())
        .unwrap_or_default()
        .to_string()
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```
/// use steadfetch::retry::{IdempotencyPolicy, SeededJitter};
/// use steadfetch::{Client, ClientConfig};
/// use http::Method;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), steadfetch::Error> {
/// let client = Client::builder()
///     .config(ClientConfig::builder().max_retries(1).build()?)
///     .jitter_source(Arc::new(SeededJitter::new(7)))
///     .idempotency(IdempotencyPolicy::default().with_non_idempotent(Method::PATCH))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    jitter_source: Option<Arc<dyn JitterSource>>,
    idempotency: IdempotencyPolicy,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            jitter_source: None,
            idempotency: IdempotencyPolicy::default(),
        }
    }

    /// Sets the validated configuration. Required.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the random source used for backoff jitter.
    pub fn jitter_source(mut self, source: Arc<dyn JitterSource>) -> Self {
        self.jitter_source = Some(source);
        self
    }

    /// Replaces the set of methods never resent after a transport failure.
    pub fn idempotency(mut self, policy: IdempotencyPolicy) -> Self {
        self.idempotency = policy;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no configuration was provided.
    pub fn build(self) -> Result<Client> {
        let config = self
            .config
            .ok_or_else(|| Error::Configuration("Client configuration is required".to_string()))?;
        let jitter = self
            .jitter_source
            .unwrap_or_else(|| Arc::new(ThreadRngJitter));

        Ok(Client::from_parts(config, jitter, self.idempotency))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
