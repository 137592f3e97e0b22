//! Error types for the client library.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use thiserror::Error;
use url::Url;

use vaultwire_common::{ConfigError, TlsConfig, headers};

use crate::response::Response;

/// Appended to transport errors that look like a TLS client talking to a
/// plaintext listener.
pub const TLS_MISMATCH_HINT: &str = "This usually means the server is serving plain HTTP while the \
client is configured for HTTPS, or the other way around. Either enable TLS on the server or point \
the client at an http:// address, for example by setting VAULT_ADDR=http://<address>.";

/// Errors that can occur while configuring a client or executing a request.
///
/// Configuration and protocol errors are raised before any network activity
/// and are never retried. Transport errors have already been through the
/// retry policy by the time they surface here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Environment or descriptor validation failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TLS material could not be loaded or assembled.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A file could not be read or written.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Network or HTTP failure after retries were exhausted.
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest_middleware::Error),

    /// A transport failure that looks like a TLS/plaintext mismatch.
    #[error("Transport error: {source}\n\n{hint}", hint = TLS_MISMATCH_HINT)]
    TlsMismatch {
        /// Underlying failure.
        #[source]
        source: reqwest_middleware::Error,
    },

    /// The configured client timeout elapsed.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The token contains characters that cannot be sent in a header.
    #[error("Configured token contains non-printable characters and cannot be used")]
    NonPrintableToken,

    /// A redirect pointed from an encrypted to a plaintext scheme.
    #[error("Redirect would cause protocol downgrade: {from} -> {to}")]
    RedirectDowngrade {
        /// The URL that issued the redirect.
        from: Url,
        /// The redirect target.
        to: Url,
    },

    /// A redirect response carried no usable location.
    #[error("Invalid redirect: {0}")]
    InvalidRedirect(String),

    /// The server answered with an error status.
    ///
    /// The full response stays available through [`ClientError::response`].
    #[error("{error}")]
    Api {
        /// Parsed error payload.
        error: ResponseError,
        /// The response that carried it.
        response: Box<Response>,
    },

    /// Curl output mode short-circuited the request.
    #[error(transparent)]
    CurlOutput(#[from] OutputStringError),

    /// The agent refused the sink listing.
    #[error("Agent returned status {status} listing file sinks: {body}")]
    Agent {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Sink discovery through the agent failed while building a session.
    #[error("Failed to determine the token sink path from agent {address}: {source}")]
    AgentDiscovery {
        /// The configured agent address.
        address: String,
        /// Underlying failure.
        #[source]
        source: Box<ClientError>,
    },

    /// Sink discovery was requested without an agent address.
    #[error("An agent address must be configured to discover token sinks")]
    MissingAgentAddress,

    /// A header value contains characters HTTP does not allow.
    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),

    /// The agent address is unusable for sink discovery.
    #[error("Invalid agent address {0}: must not contain a path")]
    InvalidAgentAddress(Url),

    /// A key exchange on an unsupported curve was requested.
    #[error("Unsupported Diffie-Hellman type {0:?}, only curve25519 is supported")]
    UnsupportedDhType(String),

    /// Key agreement or symmetric crypto failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The token sink could not be read or opened.
    #[error("Token sink error: {0}")]
    Sink(#[from] SinkError),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Check if this error is potentially retryable by the caller.
    ///
    /// Returns `true` for transport failures and timeouts.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TlsMismatch { .. } | Self::Timeout(_)
        )
    }

    /// The server response behind an [`ClientError::Api`] error.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Api { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }

    /// The HTTP status behind an [`ClientError::Api`] error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { error, .. } => Some(error.status_code),
            _ => None,
        }
    }
}

/// Failures in key agreement or token decryption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// A curve25519 public key was not 32 bytes.
    #[error("invalid curve25519 public key length {0}, expected 32")]
    InvalidPublicKey(usize),

    /// Key agreement produced an all-zero secret.
    #[error("key agreement produced a non-contributory shared secret")]
    NonContributory,

    /// An AES-GCM nonce was not 12 bytes.
    #[error("invalid nonce length {0}, expected 12")]
    InvalidNonce(usize),

    /// Authentication or decryption failed.
    #[error("decryption failed")]
    Decrypt,

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
}

/// Failures while reading and opening the token sink.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// No sink path is configured.
    #[error("no token sink path is configured")]
    NotConfigured,

    /// The sink file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// The sink file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The sink holds an encrypted envelope but no key exchange was started.
    #[error("{} holds an encrypted token but no key exchange was initiated", .path.display())]
    UnexpectedEnvelope {
        /// The sink file.
        path: PathBuf,
    },

    /// The envelope could not be decrypted.
    #[error("failed to decrypt {}: {source}", .path.display())]
    Decrypt {
        /// The sink file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: CryptoError,
    },

    /// The decrypted token is not UTF-8.
    #[error("decrypted token in {} is not valid UTF-8", .path.display())]
    InvalidToken {
        /// The sink file.
        path: PathBuf,
    },
}

/// A server-reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// Request method.
    pub method: Method,
    /// Request URL.
    pub url: Url,
    /// Response status code.
    pub status_code: u16,
    /// Namespace the request was scoped to, if any.
    pub namespace: Option<String>,
    /// Errors reported by the server, or the raw body when it was not a
    /// JSON error envelope.
    pub errors: Vec<String>,
    /// Whether `errors` holds a raw body rather than parsed messages.
    pub raw: bool,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error making API request.\n\n")?;
        if let Some(namespace) = &self.namespace {
            writeln!(f, "Namespace: {namespace}")?;
        }
        let label = if self.raw { "Raw Message" } else { "Errors" };
        write!(
            f,
            "URL: {} {}\nCode: {}. {label}:\n\n",
            self.method, self.url, self.status_code
        )?;

        if self.raw {
            return f.write_str(&self.errors.join("\n"));
        }
        let bullets: Vec<String> = self.errors.iter().map(|e| format!("* {e}")).collect();
        f.write_str(&bullets.join("\n"))
    }
}

impl std::error::Error for ResponseError {}

/// Returned instead of performing a request while curl output is enabled.
///
/// Carries the request exactly as it would have been sent so
/// [`OutputStringError::curl_string`] can render an equivalent command.
#[derive(Debug, Clone, Error)]
#[error("request not sent: curl output was requested")]
pub struct OutputStringError {
    /// Request method.
    pub method: Method,
    /// Request URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// TLS settings of the transport.
    pub tls: TlsConfig,
}

impl OutputStringError {
    /// Render a `curl` invocation equivalent to the intercepted request.
    ///
    /// The token header is replaced with a shell substitution so the
    /// rendered command never contains the secret.
    #[must_use]
    pub fn curl_string(&self) -> String {
        let mut parts: Vec<String> = vec!["curl".to_string()];

        if self.tls.insecure {
            parts.push("--insecure".to_string());
        }
        if self.method != Method::GET {
            parts.push(format!("-X {}", self.method));
        }
        let file_flags = [
            ("--cacert", &self.tls.ca_cert),
            ("--capath", &self.tls.ca_path),
            ("--cert", &self.tls.client_cert),
            ("--key", &self.tls.client_key),
        ];
        for (flag, path) in file_flags {
            if let Some(path) = path {
                parts.push(format!("{flag} '{}'", path.display()));
            }
        }

        for (name, value) in &self.headers {
            let value = if name.as_str().eq_ignore_ascii_case(headers::TOKEN) {
                "$(vault print token)".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            parts.push(format!("-H \"{name}: {value}\""));
        }

        if let Some(body) = self.body.as_ref().filter(|b| !b.is_empty()) {
            let escaped = String::from_utf8_lossy(body).replace('\'', "'\"'\"'");
            parts.push(format!("-d '{escaped}'"));
        }

        parts.push(self.url.to_string());
        parts.join(" ")
    }
}
