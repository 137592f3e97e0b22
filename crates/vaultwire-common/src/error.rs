//! Configuration errors shared across the workspace.

use thiserror::Error;

/// Errors raised while reading configuration from the environment or
/// validating a configuration descriptor.
///
/// All of these are detected before any state is mutated, so a caller that
/// receives one can assume its existing configuration is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The server or agent address could not be used.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address as supplied.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `VAULT_RATE_LIMIT` is neither `rate:burst` nor a bare number.
    #[error("VAULT_RATE_LIMIT was provided but incorrectly formatted")]
    InvalidRateLimit,

    /// A duration value could not be parsed.
    #[error("could not parse {var} value {value:?} as a duration")]
    InvalidDuration {
        /// Name of the variable that carried the value.
        var: &'static str,
        /// The raw value.
        value: String,
    },

    /// A boolean value could not be parsed.
    #[error("could not parse {var} value {value:?} as a boolean")]
    InvalidBool {
        /// Name of the variable that carried the value.
        var: &'static str,
        /// The raw value.
        value: String,
    },

    /// An unsigned integer value could not be parsed.
    #[error("could not parse {var} value {value:?} as an unsigned integer")]
    InvalidInteger {
        /// Name of the variable that carried the value.
        var: &'static str,
        /// The raw value.
        value: String,
    },

    /// A client certificate was given without its key.
    #[error("client certificate provided without a client key")]
    MissingClientKey,

    /// A client key was given without its certificate.
    #[error("client key provided without a client certificate")]
    MissingClientCert,
}
