//! HTTP transport and retry policy.
//!
//! The pooled `reqwest::Client` is built once per configuration change and
//! shared by every request and every cloned session. Retries are layered on
//! per call through `reqwest-middleware`, so the current retry count and
//! backoff are always the ones in effect when the request starts.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{
    RetryDecision, RetryPolicy, RetryTransientMiddleware, Retryable, RetryableStrategy,
    default_on_request_failure,
};

#[cfg(not(unix))]
use vaultwire_common::ConfigError;

use crate::error::ClientError;
use crate::tls::TlsContext;

/// Lower bound of the default backoff.
pub const DEFAULT_RETRY_WAIT_MIN: Duration = Duration::from_millis(1000);
/// Upper bound of the default backoff.
pub const DEFAULT_RETRY_WAIT_MAX: Duration = Duration::from_millis(1500);
/// TCP connect and TLS handshake timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long idle pooled connections are kept.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maps the number of retries already made to the wait before the next one.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Linear backoff with jitter.
///
/// Before retry `n` (zero-based) waits a random duration in `[min, max)`
/// multiplied by `n + 1`. When `max <= min` the wait is exactly
/// `min * (n + 1)`.
#[must_use]
pub fn linear_jitter_backoff(min: Duration, max: Duration) -> BackoffFn {
    Arc::new(move |retries: u32| {
        let multiplier = retries.saturating_add(1);
        if max <= min {
            return min.saturating_mul(multiplier);
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..max - min);
        (min + jitter).saturating_mul(multiplier)
    })
}

/// The backoff used unless one is configured.
#[must_use]
pub fn default_backoff() -> BackoffFn {
    linear_jitter_backoff(DEFAULT_RETRY_WAIT_MIN, DEFAULT_RETRY_WAIT_MAX)
}

/// Retries up to `max_retries` times, waiting as `backoff` says.
pub struct BackoffRetryPolicy {
    max_retries: u32,
    backoff: BackoffFn,
}

impl BackoffRetryPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(max_retries: u32, backoff: BackoffFn) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn should_retry(&self, _request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        if n_past_retries >= self.max_retries {
            return RetryDecision::DoNotRetry;
        }
        RetryDecision::Retry {
            execute_after: SystemTime::now() + (self.backoff)(n_past_retries),
        }
    }
}

/// Retries server errors and connection failures; everything else is
/// returned as is.
///
/// `501 Not Implemented` is not retried since repeating the request cannot
/// change the answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerErrorStrategy;

impl RetryableStrategy for ServerErrorStrategy {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(response) => is_retryable_status(response.status()).then_some(Retryable::Transient),
            Err(error @ reqwest_middleware::Error::Reqwest(_)) => {
                if looks_like_tls_mismatch(error) {
                    Some(Retryable::Fatal)
                } else {
                    default_on_request_failure(error)
                }
            }
            Err(reqwest_middleware::Error::Middleware(_)) => Some(Retryable::Fatal),
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED
}

/// Whether an error chain looks like TLS spoken to a plaintext listener.
pub fn looks_like_tls_mismatch(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        let message = err.to_string();
        if message.contains("oversized")
            || message.contains("InvalidContentType")
            || message.contains("corrupt message")
            || message.contains("wrong version number")
        {
            return true;
        }
        current = err.source();
    }
    false
}

/// Build the pooled transport.
///
/// Redirects are never followed here; the executor handles them itself.
/// A `socket` routes every connection through a Unix domain socket.
///
/// # Errors
///
/// Returns [`ClientError::Tls`] if the client cannot be constructed, or a
/// configuration error when a socket is requested on a platform without
/// Unix domain sockets.
pub fn build_http_client(
    tls: &TlsContext,
    socket: Option<&Path>,
) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder()
        .use_preconfigured_tls(tls.client_config())
        .redirect(Policy::none())
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(30));

    if let Some(socket) = socket {
        #[cfg(unix)]
        {
            builder = builder.unix_socket(socket.to_path_buf());
        }
        #[cfg(not(unix))]
        {
            return Err(ClientError::Config(ConfigError::InvalidAddress {
                address: socket.display().to_string(),
                reason: "unix sockets are not supported on this platform".to_string(),
            }));
        }
    }

    builder
        .build()
        .map_err(|e| ClientError::Tls(format!("building HTTP client: {e}")))
}

/// Wrap `client` with the retry middleware.
#[must_use]
pub fn with_retries(
    client: reqwest::Client,
    max_retries: u32,
    backoff: BackoffFn,
) -> ClientWithMiddleware {
    let policy = BackoffRetryPolicy::new(max_retries, backoff);
    reqwest_middleware::ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy_and_strategy(
            policy,
            ServerErrorStrategy,
        ))
        .build()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn jitter_stays_within_scaled_bounds() {
        let backoff = linear_jitter_backoff(Duration::from_millis(100), Duration::from_millis(150));
        for retries in 0..4u32 {
            let wait = backoff(retries);
            let scale = retries + 1;
            assert!(wait >= Duration::from_millis(100) * scale, "{wait:?}");
            assert!(wait < Duration::from_millis(150) * scale, "{wait:?}");
        }
    }

    #[test]
    fn degenerate_bounds_are_linear() {
        let backoff = linear_jitter_backoff(Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(backoff(0), Duration::from_millis(50));
        assert_eq!(backoff(2), Duration::from_millis(150));
    }

    #[test]
    fn policy_stops_at_max_retries() {
        let policy = BackoffRetryPolicy::new(2, Arc::new(|_| Duration::ZERO));
        let start = SystemTime::now();
        assert!(matches!(
            policy.should_retry(start, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 2),
            RetryDecision::DoNotRetry
        ));

        let never = BackoffRetryPolicy::new(0, default_backoff());
        assert!(matches!(
            never.should_retry(start, 0),
            RetryDecision::DoNotRetry
        ));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn tls_mismatch_is_found_in_source_chain() {
        let inner = std::io::Error::other("received corrupt message of type InvalidContentType");
        assert!(looks_like_tls_mismatch(&Wrapped(inner)));

        let refused = std::io::Error::other("connection refused");
        assert!(!looks_like_tls_mismatch(&Wrapped(refused)));
    }

    #[tokio::test]
    async fn connection_failures_are_transient() {
        let error = reqwest::Client::new()
            .get("http://127.0.0.1:1/v1/sys/health")
            .send()
            .await
            .unwrap_err();
        assert!(error.is_connect());

        let outcome = ServerErrorStrategy.handle(&Err(reqwest_middleware::Error::Reqwest(error)));
        assert!(outcome == Some(Retryable::Transient));
    }

    #[test]
    fn middleware_failures_are_fatal() {
        let error = reqwest_middleware::Error::Middleware(anyhow::anyhow!("rejected"));
        assert!(ServerErrorStrategy.handle(&Err(error)) == Some(Retryable::Fatal));
    }
}
