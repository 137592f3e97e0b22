//! Buffered server responses.

use std::borrow::Cow;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::ResponseError;

/// The server's error envelope.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<String>,
}

/// A fully read response.
///
/// The body is buffered once when the response arrives, so the error
/// accessor and the body accessors can be used in any order.
#[derive(Debug, Clone)]
pub struct Response {
    method: Method,
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    namespace: Option<String>,
}

impl Response {
    /// Buffer a transport response.
    pub(crate) async fn read(
        method: Method,
        namespace: Option<String>,
        response: reqwest::Response,
    ) -> Result<Self, reqwest::Error> {
        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Self {
            method,
            url,
            status,
            headers,
            body,
            namespace,
        })
    }

    /// The method of the request that produced this response.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The URL that produced this response.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes.
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The location a redirect response points at.
    pub(crate) fn location(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    /// The server-reported error carried by this response, if any.
    ///
    /// Statuses 200 through 399 are not errors. Otherwise the body is read
    /// as the server's `{"errors": [...]}` envelope; a body that is not
    /// such an envelope is reported verbatim.
    #[must_use]
    pub fn error(&self) -> Option<ResponseError> {
        if (200..400).contains(&self.status.as_u16()) {
            return None;
        }

        let (errors, raw) = match serde_json::from_slice::<ErrorEnvelope>(&self.body) {
            Ok(envelope) => (envelope.errors, false),
            Err(_) => (vec![self.text().into_owned()], true),
        };

        Some(ResponseError {
            method: self.method.clone(),
            url: self.url.clone(),
            status_code: self.status.as_u16(),
            namespace: self.namespace.clone(),
            errors,
            raw,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(status: u16, body: &'static str) -> Self {
        Self {
            method: Method::GET,
            url: Url::parse("https://127.0.0.1:8200/v1/sys/health").unwrap_or_else(|_| unreachable!()),
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            namespace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_redirect_statuses_are_not_errors() {
        assert!(Response::for_test(200, "{}").error().is_none());
        assert!(Response::for_test(204, "").error().is_none());
        assert!(Response::for_test(307, "").error().is_none());
    }

    #[test]
    fn error_envelope_is_parsed() {
        let response = Response::for_test(400, r#"{"errors":["missing client token","second"]}"#);
        let error = response.error();
        let error = error.as_ref();
        assert_eq!(error.map(|e| e.status_code), Some(400));
        assert_eq!(error.map(|e| e.raw), Some(false));
        assert_eq!(
            error.map(|e| e.errors.clone()),
            Some(vec!["missing client token".to_string(), "second".to_string()])
        );
    }

    #[test]
    fn non_json_body_is_raw() {
        let response = Response::for_test(502, "bad gateway");
        let error = response.error();
        assert_eq!(error.as_ref().map(|e| e.raw), Some(true));
        assert_eq!(
            error.map(|e| e.errors),
            Some(vec!["bad gateway".to_string()])
        );
        // the body is still readable after error extraction
        assert_eq!(response.text(), "bad gateway");
    }
}
