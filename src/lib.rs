//! # Steadfetch - a pooled, retrying JSON GET client
//!
//! Steadfetch sends GET requests through a bounded pool of reusable
//! connections, decodes `200 OK` JSON bodies into typed values, and retries
//! transient failures with jittered backoff.
//!
//! ## Quick Start
//!
//! ```no_run
//! use steadfetch::{Client, ClientConfig};
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Usage {
//!     account: String,
//!     requests: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), steadfetch::Error> {
//!     let config = ClientConfig::builder()
//!         .max_connections(10)
//!         .connect_timeout(Duration::from_secs(1))
//!         .socket_timeout(Duration::from_secs(3))
//!         .connection_request_timeout(Duration::from_millis(500))
//!         .connection_ttl(Duration::from_secs(30))
//!         .max_retries(3)
//!         .retry_interval(Duration::from_millis(200))
//!         .jitter(Duration::from_millis(100))
//!         .build()?;
//!
//!     let client = steadfetch::Client::new(config);
//!     let usage: Usage = client.get("https://usage.example.com/accounts/42").await?;
//!     println!("{} made {} requests", usage.account, usage.requests);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## What gets retried
//!
//! A failed attempt is retried only while the attempt number is within
//! `max_retries`, and only for one of two reasons:
//!
//! - **Transport failures** classified as [`NoResponseReceived`], [`ConnectTimeout`],
//!   [`ConnectRefused`] or [`SocketReadTimeout`], when the request method is
//!   idempotent. Running out of pooled connections counts as a connect timeout.
//! - **Transient statuses**: 408, 409, 500, 503 and 504, regardless of method.
//!
//! The wait between attempts is `retry_interval` plus a random value in
//! `[0, jitter)`. Undecodable bodies, other statuses and unclassified
//! transport errors fail immediately.
//!
//! [`NoResponseReceived`]: retry::TransportFailureKind::NoResponseReceived
//! [`ConnectTimeout`]: retry::TransportFailureKind::ConnectTimeout
//! [`ConnectRefused`]: retry::TransportFailureKind::ConnectRefused
//! [`SocketReadTimeout`]: retry::TransportFailureKind::SocketReadTimeout

mod attempt;
mod client;
mod config;
mod error;
pub mod pool;
mod response;
pub mod retry;

pub use attempt::RequestAttempt;
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ClientConfigBuilder, ClientSettings};
pub use error::{Error, Result};
pub use response::Response;
pub use retry::{RetryDecision, TransportFailureKind};
