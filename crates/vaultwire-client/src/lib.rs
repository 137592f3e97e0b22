//! # vaultwire-client
//!
//! Session and transport layer for a Vault-compatible secrets server.
//!
//! A [`Client`] holds the server address, the active token and per-request
//! policy (headers, wrap TTL, MFA, policy override). The token can be set
//! directly or read from a token sink file written by a local agent; an
//! encrypted sink is opened with a curve25519 key exchange. A background
//! task keeps the token in sync with the sink.
//!
//! Requests are built with [`Client::new_request`] and executed with
//! [`Client::raw_request`], which applies the rate limiter, retries server
//! errors with backoff and follows at most one redirect.
//!
//! ## Example
//!
//! ```no_run
//! use reqwest::Method;
//! use vaultwire_client::{Client, Config};
//!
//! # async fn example() -> Result<(), vaultwire_client::ClientError> {
//! let config = Config::from_env()?.with_max_retries(3);
//! let client = Client::new(config).await?;
//!
//! let request = client.new_request(Method::GET, "/v1/sys/health").await;
//! let response = client.raw_request(request).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
mod executor;
pub mod rate_limit;
pub mod request;
pub mod response;
mod sink;
pub mod tls;
pub mod transport;

pub use client::{Client, TokenSource, WrappingLookupFn};
pub use config::Config;
pub use discovery::{DnsSrvResolver, NoSrvResolver, SrvResolver, SrvTarget};
pub use error::{ClientError, CryptoError, OutputStringError, ResponseError, SinkError};
pub use rate_limit::RateLimiter;
pub use request::Request;
pub use response::Response;
pub use tls::TlsContext;
pub use transport::{BackoffFn, default_backoff, linear_jitter_backoff};

pub use vaultwire_common::{ConfigError, TlsConfig};
