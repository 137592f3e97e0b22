//! # vaultwire-common
//!
//! Plain data shared by the vaultwire crates. Nothing here touches the
//! network or spawns tasks.
//!
//! - [`env`]: recognized environment variables, the [`ReadEnv`] abstraction
//!   and [`EnvSettings`] parsing
//! - [`tls`]: the declarative [`TlsConfig`] descriptor
//! - [`sink`]: agent and token-sink wire types
//! - [`headers`]: request header names
//!
//! ## Example
//!
//! ```
//! use std::collections::HashMap;
//! use vaultwire_common::{EnvSettings, env};
//!
//! let mut vars = HashMap::new();
//! vars.insert(env::VAULT_RATE_LIMIT.to_string(), "5:10".to_string());
//!
//! let settings = EnvSettings::read(&vars)?;
//! let limit = settings.rate_limit.unwrap_or(env::RateLimitSpec { rate: 0.0, burst: 0 });
//! assert_eq!(limit.burst, 10);
//! # Ok::<(), vaultwire_common::ConfigError>(())
//! ```

pub mod env;
pub mod error;
pub mod headers;
pub mod sink;
pub mod tls;

pub use env::{EnvSettings, RateLimitSpec, ReadEnv, SystemEnv};
pub use error::ConfigError;
pub use sink::{AgentSink, PublicKeyInfo, SinkEnvelope};
pub use tls::TlsConfig;
