//! Request execution: rate limiting, retries, timeouts and redirects.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use url::Url;

use vaultwire_common::{TlsConfig, headers};

use crate::client::Client;
use crate::error::ClientError;
use crate::rate_limit::RateLimiter;
use crate::request::Request;
use crate::response::Response;
use crate::transport::{BackoffFn, looks_like_tls_mismatch, with_retries};

/// Configuration captured once per call.
struct CallSettings {
    limiter: Option<Arc<RateLimiter>>,
    http_client: reqwest::Client,
    max_retries: u32,
    backoff: BackoffFn,
    timeout: Duration,
    output_curl_string: bool,
    tls: TlsConfig,
}

impl Client {
    /// Execute `request`.
    ///
    /// # Errors
    ///
    /// See [`Client::raw_request_with_cancel`].
    pub async fn raw_request(&self, request: Request) -> Result<Response, ClientError> {
        self.raw_request_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute `request`, giving up when `cancel` fires.
    ///
    /// Waits for the rate limiter, retries server errors and connection
    /// failures with backoff, and follows at most one `301`, `302` or `307`
    /// redirect, replaying the body. A second redirect is returned as is.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Cancelled`] if `cancel` fires first; nothing is sent
    ///   when that happens while waiting for the rate limiter.
    /// - [`ClientError::NonPrintableToken`] before anything is sent.
    /// - [`ClientError::CurlOutput`] in curl output mode, instead of sending.
    /// - [`ClientError::Timeout`] when the configured timeout elapses.
    /// - [`ClientError::Transport`] or [`ClientError::TlsMismatch`] once
    ///   retries are exhausted.
    /// - [`ClientError::RedirectDowngrade`] for an https to http redirect.
    /// - [`ClientError::Api`] when the server reports an error; the response
    ///   is attached.
    pub async fn raw_request_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, ClientError> {
        let settings = {
            let config = self.inner.read_config();
            CallSettings {
                limiter: config.limiter.clone(),
                http_client: config.http_client.clone(),
                max_retries: config.max_retries,
                backoff: Arc::clone(&config.backoff),
                timeout: config.timeout,
                output_curl_string: config.output_curl_string,
                tls: config.tls.settings().clone(),
            }
        };

        if let Some(limiter) = &settings.limiter {
            limiter.wait(cancel).await?;
        }

        if request
            .client_token
            .as_ref()
            .is_some_and(|token| !is_printable(token.expose_secret()))
        {
            return Err(ClientError::NonPrintableToken);
        }

        if settings.output_curl_string {
            return Err(request.to_output_string(settings.tls)?.into());
        }

        let client = with_retries(settings.http_client, settings.max_retries, settings.backoff);
        let namespace = request
            .headers
            .get(headers::NAMESPACE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        send(&client, request, namespace, settings.timeout, cancel).await
    }
}

/// Send `request`, following at most one redirect.
async fn send(
    client: &ClientWithMiddleware,
    mut request: Request,
    namespace: Option<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Response, ClientError> {
    let mut redirected = false;
    loop {
        let current = request.full_url();
        let http = request.to_http()?;
        let response = execute(client, http, namespace.clone(), timeout, cancel).await?;

        if let Some(target) =
            check_redirect(&current, response.status(), response.location(), redirected)?
        {
            debug!("Following redirect from {current} to {target}");
            request.url = target;
            redirected = true;
            continue;
        }

        if let Some(error) = response.error() {
            return Err(ClientError::Api {
                error,
                response: Box::new(response),
            });
        }
        return Ok(response);
    }
}

fn is_printable(token: &str) -> bool {
    token.chars().all(is_printable_char)
}

/// Graphic characters and the ASCII space. Controls, format characters,
/// non-ASCII spaces, line and paragraph separators and private-use code
/// points are rejected.
fn is_printable_char(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    !c.is_control()
        && !c.is_whitespace()
        && !matches!(
            c,
            '\u{00AD}'
                | '\u{061C}'
                | '\u{180E}'
                | '\u{200B}'..='\u{200F}'
                | '\u{2028}'..='\u{202E}'
                | '\u{2060}'..='\u{206F}'
                | '\u{FEFF}'
                | '\u{FFF9}'..='\u{FFFB}'
                | '\u{E000}'..='\u{F8FF}'
                | '\u{F0000}'..='\u{10FFFF}'
        )
}

async fn execute(
    client: &ClientWithMiddleware,
    request: reqwest::Request,
    namespace: Option<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Response, ClientError> {
    let method = request.method().clone();
    let call = async {
        let response = client.execute(request).await.map_err(transport_error)?;
        Response::read(method, namespace, response)
            .await
            .map_err(|e| transport_error(e.into()))
    };

    let timed = async {
        if timeout.is_zero() {
            call.await
        } else {
            tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ClientError::Timeout(timeout))?
        }
    };

    tokio::select! {
        () = cancel.cancelled() => Err(ClientError::Cancelled),
        result = timed => result,
    }
}

fn transport_error(error: reqwest_middleware::Error) -> ClientError {
    if looks_like_tls_mismatch(&error) {
        ClientError::TlsMismatch { source: error }
    } else {
        ClientError::Transport(error)
    }
}

/// Decide whether a response is a redirect to follow.
///
/// Only `301`, `302` and `307` are followed, and only when no redirect has
/// been followed yet. The location is resolved against `current`.
pub(crate) fn check_redirect(
    current: &Url,
    status: StatusCode,
    location: Option<&str>,
    already_redirected: bool,
) -> Result<Option<Url>, ClientError> {
    let is_redirect = matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
    );
    if already_redirected || !is_redirect {
        return Ok(None);
    }

    let location = location
        .ok_or_else(|| ClientError::InvalidRedirect("missing Location header".to_string()))?;
    let target = current
        .join(location)
        .map_err(|e| ClientError::InvalidRedirect(format!("{location}: {e}")))?;

    if current.scheme() == "https" && target.scheme() != "https" {
        return Err(ClientError::RedirectDowngrade {
            from: current.clone(),
            to: target,
        });
    }
    Ok(Some(target))
}
