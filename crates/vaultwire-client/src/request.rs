//! Outgoing requests.
//!
//! A [`Request`] is a snapshot of the session taken when it is built. Later
//! changes to the session (a new token, different headers) do not affect it.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use smallvec::SmallVec;
use url::Url;

use vaultwire_common::{TlsConfig, headers};

use crate::client::Client;
use crate::discovery::SrvTarget;
use crate::error::{ClientError, OutputStringError};

/// Wrap TTL requested for `sys/wrapping/wrap` writes when nothing else is
/// configured.
pub const DEFAULT_WRAPPING_TTL: &str = "5m";

const WRAPPING_WRAP_PATH: &str = "sys/wrapping/wrap";

/// The wrap TTL policy used when a session has no lookup function.
///
/// `env_wrap_ttl` (from `VAULT_WRAP_TTL`) applies to every request.
/// Otherwise only writes to `sys/wrapping/wrap` are wrapped, for
/// [`DEFAULT_WRAPPING_TTL`].
#[must_use]
pub fn default_wrapping_lookup(env_wrap_ttl: Option<&str>, method: &Method, path: &str) -> String {
    if let Some(ttl) = env_wrap_ttl.filter(|ttl| !ttl.is_empty()) {
        return ttl.to_string();
    }
    if (method == Method::PUT || method == Method::POST) && path == WRAPPING_WRAP_PATH {
        return DEFAULT_WRAPPING_TTL.to_string();
    }
    String::new()
}

/// A request ready to be executed.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Target URL. Its query is ignored; see [`Request::params`].
    pub url: Url,
    /// Token sent as `X-Vault-Token`; nothing is sent when `None` or empty.
    pub client_token: Option<SecretString>,
    /// Requested wrap TTL; empty for none.
    pub wrap_ttl: String,
    /// One `X-Vault-MFA` header per entry.
    pub mfa_header_values: SmallVec<[String; 2]>,
    /// Sends `X-Vault-Policy-Override: true`.
    pub policy_override: bool,
    /// Additional headers sent verbatim.
    pub headers: HeaderMap,
    /// Query parameters.
    pub params: Vec<(String, String)>,
    body: Option<Bytes>,
    json_body: bool,
}

impl Request {
    /// A bare request with no token or headers.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            client_token: None,
            wrap_ttl: String::new(),
            mfa_header_values: SmallVec::new(),
            policy_override: false,
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            json_body: false,
        }
    }

    /// Serialize `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Serialization`] if `value` cannot be encoded.
    pub fn set_json_body<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ClientError> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        self.json_body = true;
        Ok(())
    }

    /// Use raw bytes as the body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
        self.json_body = false;
    }

    /// The body, if any.
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Add a query parameter.
    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.push((key.into(), value.into()));
    }

    /// The URL with its query replaced by [`Request::params`].
    #[must_use]
    pub fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        url.set_query(None);
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        url
    }

    /// The headers as they go on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NonPrintableToken`] for a token that cannot be
    /// a header value and [`ClientError::InvalidHeader`] for a bad wrap TTL
    /// or MFA value.
    pub fn wire_headers(&self) -> Result<HeaderMap, ClientError> {
        let mut wire = self.headers.clone();

        if let Some(token) = self
            .client_token
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .filter(|token| !token.is_empty())
        {
            let mut value =
                HeaderValue::from_str(token).map_err(|_| ClientError::NonPrintableToken)?;
            value.set_sensitive(true);
            wire.insert(headers::TOKEN, value);
        }
        if !self.wrap_ttl.is_empty() {
            wire.insert(headers::WRAP_TTL, header_value(headers::WRAP_TTL, &self.wrap_ttl)?);
        }
        for mfa in &self.mfa_header_values {
            wire.append(headers::MFA, header_value(headers::MFA, mfa)?);
        }
        if self.policy_override {
            wire.insert(headers::POLICY_OVERRIDE, HeaderValue::from_static("true"));
        }
        if self.body.is_some() && self.json_body {
            wire.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(wire)
    }

    /// Build the transport request.
    ///
    /// The body is shared, not copied, so the result can be rebuilt for a
    /// retry or redirect as often as needed.
    pub(crate) fn to_http(&self) -> Result<reqwest::Request, ClientError> {
        let mut request = reqwest::Request::new(self.method.clone(), self.full_url());
        *request.headers_mut() = self.wire_headers()?;
        if let Some(body) = &self.body {
            *request.body_mut() = Some(body.clone().into());
        }
        Ok(request)
    }

    /// The error returned instead of sending this request in curl output
    /// mode.
    pub(crate) fn to_output_string(&self, tls: TlsConfig) -> Result<OutputStringError, ClientError> {
        Ok(OutputStringError {
            method: self.method.clone(),
            url: self.full_url(),
            headers: self.wire_headers()?,
            body: self.body.clone(),
            tls,
        })
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name))
}

/// Join `path` onto `base` and normalize the result the way a URL path is
/// expected: one leading slash, no empty, `.` or `..` segments, no trailing
/// slash.
pub(crate) fn join_path(base: &str, path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// The path the wrap TTL lookup sees.
pub(crate) fn lookup_path(path: &str) -> &str {
    path.strip_prefix("/v1/")
        .or_else(|| path.strip_prefix("v1/"))
        .unwrap_or(path)
}

fn with_target(url: &Url, target: &SrvTarget) -> Option<Url> {
    let mut url = url.clone();
    url.set_host(Some(&target.host)).ok()?;
    url.set_port(Some(target.port)).ok()?;
    Some(url)
}

impl Client {
    /// Build a request for `method` on `path`, relative to the session's
    /// address.
    ///
    /// When the address has no explicit port, an `_http._tcp` SRV record for
    /// its host replaces host and port. Discovery failures are ignored.
    pub async fn new_request(&self, method: Method, path: &str) -> Request {
        let (base, explicit_port, snapshot, resolver) = {
            let state = self.inner.read_state();
            let config = self.inner.read_config();

            let lookup = lookup_path(path);
            let wrap_ttl = state.wrapping_lookup.as_ref().map_or_else(
                || default_wrapping_lookup(state.env_wrap_ttl.as_deref(), &method, lookup),
                |lookup_fn| lookup_fn(&method, lookup),
            );
            let snapshot = Snapshot {
                token: state.token.clone(),
                wrap_ttl,
                mfa: state.mfa_creds.clone(),
                policy_override: state.policy_override,
                headers: state.headers.clone(),
            };
            (
                state.addr.clone(),
                state.explicit_port || config.unix_socket.is_some(),
                snapshot,
                Arc::clone(&config.srv_resolver),
            )
        };

        let mut url = base.clone();
        if !explicit_port
            && let Some(host) = base.host_str()
            && let Some(target) = resolver.lookup(host).await
            && let Some(discovered) = with_target(&base, &target)
        {
            debug!("Using SRV target {}:{} for {host}", target.host, target.port);
            url = discovered;
        }
        url.set_path(&join_path(base.path(), path));
        url.set_query(None);
        url.set_fragment(None);

        Request {
            method,
            url,
            client_token: snapshot.token,
            wrap_ttl: snapshot.wrap_ttl,
            mfa_header_values: snapshot.mfa,
            policy_override: snapshot.policy_override,
            headers: snapshot.headers,
            params: Vec::new(),
            body: None,
            json_body: false,
        }
    }
}

struct Snapshot {
    token: Option<SecretString>,
    wrap_ttl: String,
    mfa: SmallVec<[String; 2]>,
    policy_override: bool,
    headers: HeaderMap,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::discovery::SrvResolver;

    #[derive(Debug)]
    struct FixedResolver(SrvTarget);

    #[async_trait]
    impl SrvResolver for FixedResolver {
        async fn lookup(&self, host: &str) -> Option<SrvTarget> {
            (host == "vault.service.consul").then(|| self.0.clone())
        }
    }

    async fn client_for(address: &str) -> Client {
        let resolver = FixedResolver(SrvTarget {
            host: "node1.vault.service.consul".to_string(),
            port: 8243,
        });
        let config = Config::new()
            .unwrap()
            .with_address(address)
            .with_srv_resolver(Arc::new(resolver));
        Client::with_env(config, &HashMap::<String, String>::new()).await.unwrap()
    }

    #[test]
    fn join_path_cleans() {
        assert_eq!(join_path("/", "v1/sys/health"), "/v1/sys/health");
        assert_eq!(join_path("/prefix/", "/v1/secret/"), "/prefix/v1/secret");
        assert_eq!(join_path("", "a/./b/../c"), "/a/c");
        assert_eq!(join_path("", ""), "/");
    }

    #[test]
    fn lookup_path_strips_version_prefix() {
        assert_eq!(lookup_path("/v1/sys/wrapping/wrap"), "sys/wrapping/wrap");
        assert_eq!(lookup_path("v1/sys/wrapping/wrap"), "sys/wrapping/wrap");
        assert_eq!(lookup_path("sys/v1/x"), "sys/v1/x");
    }

    #[test]
    fn default_wrapping_policy() {
        assert_eq!(
            default_wrapping_lookup(None, &Method::POST, "sys/wrapping/wrap"),
            DEFAULT_WRAPPING_TTL
        );
        assert_eq!(
            default_wrapping_lookup(None, &Method::PUT, "sys/wrapping/wrap"),
            DEFAULT_WRAPPING_TTL
        );
        assert_eq!(
            default_wrapping_lookup(None, &Method::GET, "sys/wrapping/wrap"),
            ""
        );
        assert_eq!(default_wrapping_lookup(None, &Method::PUT, "secret/foo"), "");
        assert_eq!(
            default_wrapping_lookup(Some("30s"), &Method::GET, "secret/foo"),
            "30s"
        );
    }

    #[tokio::test]
    async fn request_snapshots_session() {
        let client = client_for("https://127.0.0.1:8200").await;
        client.set_token("s.snapshot");
        client.set_mfa_creds(["totp:1"]);
        client.set_policy_override(true);
        client.set_namespace("ns1/").unwrap();

        let request = client.new_request(Method::GET, "/v1/sys/health").await;
        client.set_token("s.changed");
        client.clear_namespace();

        assert_eq!(request.url.as_str(), "https://127.0.0.1:8200/v1/sys/health");
        assert_eq!(
            request.client_token.as_ref().unwrap().expose_secret(),
            "s.snapshot"
        );
        let wire = request.wire_headers().unwrap();
        assert_eq!(wire.get(headers::TOKEN).unwrap(), "s.snapshot");
        assert!(wire.get(headers::TOKEN).unwrap().is_sensitive());
        assert_eq!(wire.get(headers::MFA).unwrap(), "totp:1");
        assert_eq!(wire.get(headers::POLICY_OVERRIDE).unwrap(), "true");
        assert_eq!(wire.get(headers::NAMESPACE).unwrap(), "ns1/");
        assert!(wire.get(headers::WRAP_TTL).is_none());
    }

    #[tokio::test]
    async fn wrap_lookup_sees_stripped_path() {
        let client = client_for("https://127.0.0.1:8200").await;
        let request = client
            .new_request(Method::POST, "/v1/sys/wrapping/wrap")
            .await;
        assert_eq!(request.wrap_ttl, DEFAULT_WRAPPING_TTL);

        client.set_wrapping_lookup_func(Arc::new(|method: &Method, path: &str| {
            format!("{method}:{path}")
        }));
        let request = client.new_request(Method::GET, "v1/secret/app").await;
        assert_eq!(request.wrap_ttl, "GET:secret/app");
        assert_eq!(
            request.wire_headers().unwrap().get(headers::WRAP_TTL).unwrap(),
            "GET:secret/app"
        );
    }

    #[tokio::test]
    async fn srv_record_replaces_host_without_port() {
        let client = client_for("https://vault.service.consul").await;
        let request = client.new_request(Method::GET, "v1/sys/health").await;
        assert_eq!(
            request.url.as_str(),
            "https://node1.vault.service.consul:8243/v1/sys/health"
        );
    }

    #[tokio::test]
    async fn explicit_port_skips_srv() {
        let client = client_for("https://vault.service.consul:443").await;
        let request = client.new_request(Method::GET, "v1/sys/health").await;
        assert_eq!(request.url.host_str(), Some("vault.service.consul"));
    }

    #[tokio::test]
    async fn missing_srv_keeps_address() {
        let client = client_for("https://vault.example.com/base").await;
        let request = client.new_request(Method::GET, "v1/sys/health").await;
        assert_eq!(
            request.url.as_str(),
            "https://vault.example.com/base/v1/sys/health"
        );
    }

    #[test]
    fn json_body_and_params() {
        let mut request = Request::new(
            Method::PUT,
            Url::parse("https://127.0.0.1:8200/v1/secret/app").unwrap(),
        );
        request.set_json_body(&serde_json::json!({"password": "hunter2"})).unwrap();
        request.add_param("version", "2");

        let http = request.to_http().unwrap();
        assert_eq!(
            http.url().as_str(),
            "https://127.0.0.1:8200/v1/secret/app?version=2"
        );
        assert_eq!(
            http.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            http.body().unwrap().as_bytes().unwrap(),
            br#"{"password":"hunter2"}"#
        );
        assert!(http.headers().get(headers::TOKEN).is_none());
    }

    #[test]
    fn control_characters_in_token_are_rejected() {
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://127.0.0.1:8200/v1/sys/health").unwrap(),
        );
        request.client_token = Some(SecretString::from("s.bad\ntoken"));
        assert!(matches!(
            request.wire_headers().unwrap_err(),
            ClientError::NonPrintableToken
        ));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn joined_paths_are_clean(
            base in "(/[a-z0-9.]{0,6}){0,4}/?",
            path in "/?([a-z0-9.]{0,6}/){0,4}[a-z0-9.]{0,6}",
        ) {
            let joined = join_path(&base, &path);
            prop_assert!(joined.starts_with('/'));
            prop_assert!(joined == "/" || !joined.ends_with('/'));
            prop_assert!(!joined.contains("//"));
            prop_assert!(joined.split('/').all(|s| s != "." && s != ".."));
        }

        #[test]
        fn version_prefix_is_stripped_once(rest in "[a-z/]{0,20}") {
            let with_slash = format!("/v1/{rest}");
            let without = format!("v1/{rest}");
            prop_assert_eq!(lookup_path(&with_slash), rest.as_str());
            prop_assert_eq!(lookup_path(&without), rest.as_str());
        }
    }
}
