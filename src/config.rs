//! Client configuration.
//!
//! [`ClientConfig`] is the validated, immutable configuration shared by the
//! connection pool and both retry policies. It is produced either through
//! [`ClientConfig::builder`] or by converting externally loaded
//! [`ClientSettings`]. Once built it never changes.

use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Validated client configuration.
///
/// All timing and capacity values are strictly positive. `max_retries` may be
/// zero, in which case every failure is terminal.
///
/// # Examples
///
/// ```
/// use steadfetch::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::builder()
///     .max_connections(8)
///     .max_retries(2)
///     .retry_interval(Duration::from_millis(100))
///     .jitter(Duration::from_millis(50))
///     .build()
///     .unwrap();
///
/// assert_eq!(config.max_connections_total(), 8);
/// assert_eq!(config.max_connections_per_route(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    max_connections_total: usize,
    max_connections_per_route: usize,
    connect_timeout: Duration,
    socket_timeout: Duration,
    connection_request_timeout: Duration,
    connection_ttl: Duration,
    max_retries: usize,
    retry_interval: Duration,
    jitter: Duration,
    core_base_url: Option<Url>,
    usage_base_url: Option<Url>,
}

impl ClientConfig {
    /// Creates a builder pre-populated with defaults.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Maximum number of connections across all routes.
    pub fn max_connections_total(&self) -> usize {
        self.max_connections_total
    }

    /// Maximum number of connections to a single route.
    pub fn max_connections_per_route(&self) -> usize {
        self.max_connections_per_route
    }

    /// Time allowed to establish a TCP connection.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Maximum inactivity between two reads on an established connection.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Time a caller waits for a pooled connection before giving up.
    pub fn connection_request_timeout(&self) -> Duration {
        self.connection_request_timeout
    }

    /// Age after which a connection is discarded instead of reused.
    pub fn connection_ttl(&self) -> Duration {
        self.connection_ttl
    }

    /// Number of retries allowed after the initial attempt.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Base backoff interval between attempts.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Upper bound (exclusive) of the random addition to `retry_interval`.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Informational base URL of the core service, if configured.
    pub fn core_base_url(&self) -> Option<&Url> {
        self.core_base_url.as_ref()
    }

    /// Informational base URL of the usage service, if configured.
    pub fn usage_base_url(&self) -> Option<&Url> {
        self.usage_base_url.as_ref()
    }
}

/// Builder for [`ClientConfig`].
///
/// Unset values fall back to the defaults listed on each setter.
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    max_connections_total: usize,
    max_connections_per_route: usize,
    connect_timeout: Duration,
    socket_timeout: Duration,
    connection_request_timeout: Duration,
    connection_ttl: Duration,
    max_retries: usize,
    retry_interval: Duration,
    jitter: Duration,
    core_base_url: Option<String>,
    usage_base_url: Option<String>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            max_connections_total: 20,
            max_connections_per_route: 20,
            connect_timeout: Duration::from_secs(2),
            socket_timeout: Duration::from_secs(5),
            connection_request_timeout: Duration::from_secs(1),
            connection_ttl: Duration::from_secs(60),
            max_retries: 3,
            retry_interval: Duration::from_millis(200),
            jitter: Duration::from_millis(100),
            core_base_url: None,
            usage_base_url: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Sets both the total and the per-route connection ceiling. Default: 20.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections_total = max;
        self.max_connections_per_route = max;
        self
    }

    /// Sets the total connection ceiling. Default: 20.
    pub fn max_connections_total(mut self, max: usize) -> Self {
        self.max_connections_total = max;
        self
    }

    /// Sets the per-route connection ceiling. Default: 20.
    pub fn max_connections_per_route(mut self, max: usize) -> Self {
        self.max_connections_per_route = max;
        self
    }

    /// Default: 2s.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default: 5s.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Default: 1s.
    pub fn connection_request_timeout(mut self, timeout: Duration) -> Self {
        self.connection_request_timeout = timeout;
        self
    }

    /// Default: 60s.
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    /// Default: 3. Zero disables retries.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Default: 200ms.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Default: 100ms.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn core_base_url(mut self, url: impl Into<String>) -> Self {
        self.core_base_url = Some(url.into());
        self
    }

    pub fn usage_base_url(mut self, url: impl Into<String>) -> Self {
        self.usage_base_url = Some(url.into());
        self
    }

    /// Validates the values and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any capacity or timing value is zero,
    /// and [`Error::InvalidUrl`] if a base URL does not parse.
    pub fn build(self) -> Result<ClientConfig> {
        require_positive_count("max_connections_total", self.max_connections_total)?;
        require_positive_count("max_connections_per_route", self.max_connections_per_route)?;
        require_positive("connect_timeout", self.connect_timeout)?;
        require_positive("socket_timeout", self.socket_timeout)?;
        require_positive("connection_request_timeout", self.connection_request_timeout)?;
        require_positive("connection_ttl", self.connection_ttl)?;
        require_positive("retry_interval", self.retry_interval)?;
        require_positive("jitter", self.jitter)?;

        let core_base_url = self.core_base_url.as_deref().map(Url::parse).transpose()?;
        let usage_base_url = self.usage_base_url.as_deref().map(Url::parse).transpose()?;

        Ok(ClientConfig {
            max_connections_total: self.max_connections_total,
            max_connections_per_route: self.max_connections_per_route,
            connect_timeout: self.connect_timeout,
            socket_timeout: self.socket_timeout,
            connection_request_timeout: self.connection_request_timeout,
            connection_ttl: self.connection_ttl,
            max_retries: self.max_retries,
            retry_interval: self.retry_interval,
            jitter: self.jitter,
            core_base_url,
            usage_base_url,
        })
    }
}

fn require_positive(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Configuration(format!("{name} must be positive")));
    }
    Ok(())
}

fn require_positive_count(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Configuration(format!("{name} must be positive")));
    }
    Ok(())
}

/// Raw client settings as they appear in external configuration.
///
/// Timing values are milliseconds. The fields are signed so that a negative
/// value surfaces as a configuration error rather than a parse error.
/// `max_threads` is used as both the total and the per-route connection ceiling.
///
/// # Examples
///
/// ```
/// use steadfetch::{ClientConfig, ClientSettings};
///
/// let settings: ClientSettings = serde_json::from_str(r#"{
///     "maxThreads": 10,
///     "connectionTimeout": 1000,
///     "socketTimeout": 3000,
///     "connectionRequestTimeout": 500,
///     "connectionTimeToLive": 30000,
///     "maxRetries": 2,
///     "retryInterval": 100,
///     "jitterTime": 50
/// }"#).unwrap();
///
/// let config = ClientConfig::try_from(settings).unwrap();
/// assert_eq!(config.max_retries(), 2);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    pub max_threads: i64,
    pub connection_timeout: i64,
    pub socket_timeout: i64,
    pub connection_request_timeout: i64,
    pub connection_time_to_live: i64,
    pub max_retries: i64,
    pub retry_interval: i64,
    pub jitter_time: i64,
    #[serde(default)]
    pub core_base_url: Option<String>,
    #[serde(default)]
    pub usage_base_url: Option<String>,
}

impl TryFrom<ClientSettings> for ClientConfig {
    type Error = Error;

    fn try_from(settings: ClientSettings) -> Result<Self> {
        let mut builder = ClientConfig::builder()
            .max_connections(count("maxThreads", settings.max_threads)?)
            .connect_timeout(millis("connectionTimeout", settings.connection_timeout)?)
            .socket_timeout(millis("socketTimeout", settings.socket_timeout)?)
            .connection_request_timeout(millis(
                "connectionRequestTimeout",
                settings.connection_request_timeout,
            )?)
            .connection_ttl(millis(
                "connectionTimeToLive",
                settings.connection_time_to_live,
            )?)
            .max_retries(non_negative("maxRetries", settings.max_retries)?)
            .retry_interval(millis("retryInterval", settings.retry_interval)?)
            .jitter(millis("jitterTime", settings.jitter_time)?);

        if let Some(url) = settings.core_base_url {
            builder = builder.core_base_url(url);
        }
        if let Some(url) = settings.usage_base_url {
            builder = builder.usage_base_url(url);
        }

        builder.build()
    }
}

fn millis(name: &str, value: i64) -> Result<Duration> {
    let value = u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::Configuration(format!("{name} must be positive, got {value}")))?;
    Ok(Duration::from_millis(value))
}

fn count(name: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::Configuration(format!("{name} must be positive, got {value}")))
}

fn non_negative(name: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::Configuration(format!("{name} must not be negative, got {value}")))
}
