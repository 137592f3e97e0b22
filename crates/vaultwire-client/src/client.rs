//! The client session.
//!
//! A [`Client`] is a cheap handle onto shared session state. Identity
//! (address, token, headers, wrap policy) lives behind one lock and the
//! [`Config`] behind another. Whenever both are needed the session lock is
//! taken first.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use smallvec::SmallVec;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use vaultwire_common::sink::{AGENT_PATH_FILE_SINKS, AGENT_SINK_NAME_PARAM, DH_TYPE_CURVE25519};
use vaultwire_common::{AgentSink, EnvSettings, PublicKeyInfo, ReadEnv, SystemEnv, headers};

use crate::config::{Config, parse_address};
use crate::crypto::{DhState, KeyPair};
use crate::error::{ClientError, SinkError};
use crate::rate_limit::RateLimiter;
use crate::sink;
use crate::transport::BackoffFn;

/// Chooses the wrap TTL for a request from its method and path.
///
/// The path has any leading `v1/` removed. An empty result means no
/// wrapping.
pub type WrappingLookupFn = Arc<dyn Fn(&Method, &str) -> String + Send + Sync>;

/// Where the session's token comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Set by the caller or the environment.
    Explicit,
    /// Read from a plaintext sink file.
    PlainSink,
    /// Decrypted from a sink file after a key exchange with the agent.
    EncryptedSink,
}

pub(crate) enum CredentialSource {
    Explicit,
    PlainSink,
    EncryptedSink(DhState),
}

impl CredentialSource {
    const fn kind(&self) -> TokenSource {
        match self {
            Self::Explicit => TokenSource::Explicit,
            Self::PlainSink => TokenSource::PlainSink,
            Self::EncryptedSink(_) => TokenSource::EncryptedSink,
        }
    }
}

pub(crate) struct SessionState {
    pub(crate) addr: Url,
    pub(crate) explicit_port: bool,
    pub(crate) token: Option<SecretString>,
    pub(crate) headers: HeaderMap,
    pub(crate) wrapping_lookup: Option<WrappingLookupFn>,
    pub(crate) env_wrap_ttl: Option<String>,
    pub(crate) mfa_creds: SmallVec<[String; 2]>,
    pub(crate) policy_override: bool,
    pub(crate) source: CredentialSource,
    pub(crate) use_sink_for_token: bool,
    pub(crate) sink_polling_started: bool,
}

impl SessionState {
    fn new(addr: Url, explicit_port: bool) -> Self {
        Self {
            addr,
            explicit_port,
            token: None,
            headers: HeaderMap::new(),
            wrapping_lookup: None,
            env_wrap_ttl: None,
            mfa_creds: SmallVec::new(),
            policy_override: false,
            source: CredentialSource::Explicit,
            use_sink_for_token: false,
            sink_polling_started: false,
        }
    }
}

pub(crate) struct ClientInner {
    state: RwLock<SessionState>,
    config: RwLock<Config>,
    poller_shutdown: CancellationToken,
}

impl ClientInner {
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_config(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_config(&self) -> RwLockWriteGuard<'_, Config> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.poller_shutdown.cancel();
    }
}

/// A session with a server.
///
/// Cloning the handle shares the session; use [`Client::clone_session`] for
/// an independent one.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read_state();
        let config = self.inner.read_config();
        f.debug_struct("Client")
            .field("address", &state.addr.as_str())
            .field("token", &state.token.as_ref().map(|_| "[REDACTED]"))
            .field("token_source", &state.source.kind())
            .field("use_sink_for_token", &state.use_sink_for_token)
            .field("config", &*config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a session, reading session variables from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`Client::with_env`].
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        Self::with_env(config, &SystemEnv).await
    }

    /// Create a session, reading session variables from `env`.
    ///
    /// The agent address, when configured, replaces the server address. The
    /// token comes from the first available of:
    ///
    /// 1. `VAULT_TOKEN`
    /// 2. the configured token sink path
    /// 3. the sink advertised by the agent, which may start a key exchange
    ///
    /// A sink source starts the background poller. `VAULT_NAMESPACE`,
    /// `VAULT_WRAP_TTL` and `VAULT_MFA` seed the session as well.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for an invalid address or environment,
    /// and [`ClientError::AgentDiscovery`] when the agent cannot be asked for
    /// its sink.
    pub async fn with_env<E: ReadEnv + ?Sized>(
        mut config: Config,
        env: &E,
    ) -> Result<Self, ClientError> {
        let settings = EnvSettings::read(env)?;
        let parsed = parse_address(config.effective_address())?;
        config.use_unix_socket(parsed.socket)?;

        let mut state = SessionState::new(parsed.url, parsed.explicit_port);
        if let Some(namespace) = &settings.namespace {
            state
                .headers
                .insert(headers::NAMESPACE, header_value(headers::NAMESPACE, namespace)?);
        }
        state.env_wrap_ttl = settings.wrap_ttl;
        state.mfa_creds.extend(settings.mfa);

        let has_sink_path = config.token_file_sink_path.is_some();
        let agent_address = config.agent_address.clone();
        let client = Self::from_parts(state, config);

        if let Some(token) = settings.token {
            client.inner.write_state().token = Some(token);
            return Ok(client);
        }

        if !has_sink_path {
            let Some(agent_address) = agent_address else {
                return Ok(client);
            };
            let path = client.get_sink_path_from_agent().await.map_err(|source| {
                ClientError::AgentDiscovery {
                    address: agent_address,
                    source: Box::new(source),
                }
            })?;
            client.inner.write_config().token_file_sink_path = Some(path);
        }

        {
            let mut state = client.inner.write_state();
            if matches!(state.source, CredentialSource::Explicit) {
                state.source = CredentialSource::PlainSink;
            }
            state.use_sink_for_token = true;
        }
        client.start_sink_polling();
        Ok(client)
    }

    fn from_parts(state: SessionState, config: Config) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: RwLock::new(state),
                config: RwLock::new(config),
                poller_shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The base address requests are built from.
    #[must_use]
    pub fn address(&self) -> Url {
        self.inner.read_state().addr.clone()
    }

    /// Point the session at a new server address.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if `address` does not parse. The
    /// session is unchanged on error.
    pub fn set_address(&self, address: &str) -> Result<(), ClientError> {
        let parsed = parse_address(address)?;

        let mut state = self.inner.write_state();
        let mut config = self.inner.write_config();
        config.use_unix_socket(parsed.socket)?;
        config.address = address.to_string();
        state.addr = parsed.url;
        state.explicit_port = parsed.explicit_port;
        Ok(())
    }

    /// The current token.
    #[must_use]
    pub fn token(&self) -> Option<SecretString> {
        self.inner.read_state().token.clone()
    }

    /// Set the token used for subsequent requests.
    ///
    /// A non-empty token stops the sink from overwriting it. An empty token
    /// clears the current one and hands control back to the sink.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        if token.is_empty() {
            self.clear_token();
            return;
        }
        let mut state = self.inner.write_state();
        state.token = Some(SecretString::from(token));
        state.use_sink_for_token = false;
    }

    /// Drop the token and resume reading it from the sink, if one is
    /// configured.
    pub fn clear_token(&self) {
        let resume = {
            let mut state = self.inner.write_state();
            state.token = None;
            state.use_sink_for_token = true;
            !state.sink_polling_started && self.inner.read_config().token_file_sink_path.is_some()
        };
        if resume {
            self.start_sink_polling();
        }
    }

    /// Where the token comes from.
    #[must_use]
    pub fn token_source(&self) -> TokenSource {
        self.inner.read_state().source.kind()
    }

    /// A copy of the custom headers sent with every request.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.inner.read_state().headers.clone()
    }

    /// Replace the custom headers.
    pub fn set_headers(&self, headers: HeaderMap) {
        self.inner.write_state().headers = headers;
    }

    /// Scope requests to a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidHeader`] if `namespace` cannot be sent
    /// as a header value.
    pub fn set_namespace(&self, namespace: &str) -> Result<(), ClientError> {
        let value = header_value(headers::NAMESPACE, namespace)?;
        self.inner
            .write_state()
            .headers
            .insert(headers::NAMESPACE, value);
        Ok(())
    }

    /// Stop scoping requests to a namespace.
    pub fn clear_namespace(&self) {
        self.inner.write_state().headers.remove(headers::NAMESPACE);
    }

    /// The wrap TTL lookup in effect, if one was set.
    #[must_use]
    pub fn wrapping_lookup_func(&self) -> Option<WrappingLookupFn> {
        self.inner.read_state().wrapping_lookup.clone()
    }

    /// Choose wrap TTLs with `lookup` instead of the default policy.
    pub fn set_wrapping_lookup_func(&self, lookup: WrappingLookupFn) {
        self.inner.write_state().wrapping_lookup = Some(lookup);
    }

    /// Go back to the default wrap TTL policy.
    pub fn clear_wrapping_lookup_func(&self) {
        self.inner.write_state().wrapping_lookup = None;
    }

    /// The MFA credentials sent with every request.
    #[must_use]
    pub fn mfa_creds(&self) -> Vec<String> {
        self.inner.read_state().mfa_creds.to_vec()
    }

    /// Replace the MFA credentials.
    pub fn set_mfa_creds(&self, creds: impl IntoIterator<Item = impl Into<String>>) {
        self.inner.write_state().mfa_creds = creds.into_iter().map(Into::into).collect();
    }

    /// Ask the server to override soft-mandatory policy failures.
    pub fn set_policy_override(&self, enabled: bool) {
        self.inner.write_state().policy_override = enabled;
    }

    /// Limit requests to `rate` per second with bursts of `burst`.
    ///
    /// A burst of zero blocks every request until the caller cancels it.
    pub fn set_limiter(&self, rate: f64, burst: u32) {
        self.inner.write_config().limiter = Some(Arc::new(RateLimiter::new(rate, burst)));
    }

    /// Remove the rate limit.
    pub fn clear_limiter(&self) {
        self.inner.write_config().limiter = None;
    }

    /// Set the retry bound for transient failures.
    pub fn set_max_retries(&self, max_retries: u32) {
        self.inner.write_config().max_retries = max_retries;
    }

    /// Set the per-request timeout; zero disables it.
    pub fn set_client_timeout(&self, timeout: Duration) {
        self.inner.write_config().timeout = timeout;
    }

    /// Set the wait between retries.
    pub fn set_backoff(&self, backoff: BackoffFn) {
        self.inner.write_config().backoff = backoff;
    }

    /// Whether requests are rendered as curl commands instead of sent.
    #[must_use]
    pub fn output_curl_string(&self) -> bool {
        self.inner.read_config().output_curl_string
    }

    /// Render requests as curl commands instead of sending them.
    pub fn set_output_curl_string(&self, enabled: bool) {
        self.inner.write_config().output_curl_string = enabled;
    }

    /// Change the sink file the poller reads.
    pub fn set_token_file_sink_path(&self, path: impl Into<PathBuf>) {
        self.inner.write_config().token_file_sink_path = Some(path.into());
    }

    /// A snapshot of the session's configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.inner.read_config().clone()
    }

    /// A new, independent session talking to the same server.
    ///
    /// The new session shares the transport and copies the address, retry
    /// bound, timeout, backoff and rate limiter. It starts without a token,
    /// headers or sink.
    ///
    /// The environment is not read again, so `VAULT_TOKEN`, `VAULT_NAMESPACE`
    /// and the other session variables are not applied to the copy; set the
    /// token explicitly with [`Client::set_token`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the current address no longer
    /// parses.
    pub fn clone_session(&self) -> Result<Self, ClientError> {
        let state = self.inner.read_state();
        let config = self.inner.read_config();

        let mut copy = config.clone();
        copy.address = config.effective_address().to_string();
        copy.agent_address = None;
        copy.output_curl_string = false;
        copy.token_file_sink_path = None;
        copy.agent_sink_name = None;

        let parsed = parse_address(&copy.address)?;
        let session = SessionState::new(state.addr.clone(), parsed.explicit_port);
        Ok(Self::from_parts(session, copy))
    }

    /// Ask the agent which sink it writes tokens to.
    ///
    /// When the agent wants an encrypted sink this also performs the key
    /// exchange, see [`Client::initiate_dh_exchange`].
    ///
    /// # Errors
    ///
    /// Fails if no agent address is configured, the address has a path, the
    /// agent is unreachable or answers with anything but `200 OK`, or the
    /// key exchange fails.
    pub async fn get_sink_path_from_agent(&self) -> Result<PathBuf, ClientError> {
        let (agent_address, sink_name, http) = {
            let config = self.inner.read_config();
            (
                config.agent_address.clone(),
                config.agent_sink_name.clone(),
                config.http_client.clone(),
            )
        };
        let agent_address = agent_address.ok_or(ClientError::MissingAgentAddress)?;

        let mut url = parse_address(&agent_address)?.url;
        if !matches!(url.path(), "" | "/") {
            return Err(ClientError::InvalidAgentAddress(url));
        }
        url.set_path(AGENT_PATH_FILE_SINKS);
        if let Some(name) = sink_name {
            url.query_pairs_mut()
                .append_pair(AGENT_SINK_NAME_PARAM, &name);
        }

        debug!("Querying agent for file sinks at {url}");
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.into()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.into()))?;

        if status != StatusCode::OK {
            return Err(ClientError::Agent {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let sink: AgentSink = serde_json::from_slice(&body)?;
        if sink.requires_exchange() {
            self.initiate_dh_exchange(&sink.dh_type, Path::new(&sink.dh_path))
                .await?;
        }
        Ok(PathBuf::from(sink.token_file_path))
    }

    /// Start a key exchange with the agent.
    ///
    /// Generates a fresh key pair, writes the public half to `dh_path`
    /// (mode `0600` on Unix) and switches the session to reading an
    /// encrypted sink. Calling it again replaces the key pair. The poller is
    /// started if it is not running yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnsupportedDhType`] for anything but
    /// `curve25519` and [`ClientError::Io`] if the key file cannot be
    /// written.
    pub async fn initiate_dh_exchange(
        &self,
        dh_type: &str,
        dh_path: &Path,
    ) -> Result<(), ClientError> {
        if dh_type != DH_TYPE_CURVE25519 {
            return Err(ClientError::UnsupportedDhType(dh_type.to_string()));
        }

        let keypair = KeyPair::generate();
        let info = PublicKeyInfo {
            curve25519_public_key: keypair.public_key().to_vec(),
        };
        let data = serde_json::to_vec(&info)?;
        write_private_file(dh_path, &data).await?;
        debug!("Published public key for key exchange to {}", dh_path.display());

        {
            let mut state = self.inner.write_state();
            state.source = CredentialSource::EncryptedSink(DhState::Keyed(keypair));
            state.use_sink_for_token = true;
        }
        self.start_sink_polling();
        Ok(())
    }

    /// Read the sink now instead of waiting for the next poll.
    ///
    /// Returns whether the token changed. Nothing is read while an explicit
    /// token is set.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::NotConfigured`] without a sink path, and the
    /// read or decrypt failure the background poller would have logged.
    pub async fn sync_token_from_sink(&self) -> Result<bool, ClientError> {
        if self.inner.read_config().token_file_sink_path.is_none() {
            return Err(SinkError::NotConfigured.into());
        }
        Ok(self.inner.poll_sink().await? == sink::Tick::Updated)
    }

    /// Stop the background poller for good.
    ///
    /// The current token stays in place. Dropping the last handle to the
    /// session has the same effect.
    pub fn stop_sink_polling(&self) {
        self.inner.poller_shutdown.cancel();
    }

    /// Whether the background poller has been started.
    #[must_use]
    pub fn sink_polling_started(&self) -> bool {
        self.inner.read_state().sink_polling_started
    }

    fn start_sink_polling(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, token sink poller not started");
            return;
        };
        {
            let mut state = self.inner.write_state();
            if state.sink_polling_started {
                return;
            }
            state.sink_polling_started = true;
        }
        sink::spawn_poller(
            &runtime,
            Arc::downgrade(&self.inner),
            self.inner.poller_shutdown.clone(),
        );
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name))
}

async fn write_private_file(path: &Path, data: &[u8]) -> Result<(), ClientError> {
    let io_error = |source| ClientError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(io_error)?;
    file.write_all(data).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)
}

/// Compare an optional token without exposing it further.
pub(crate) fn same_token(a: Option<&SecretString>, b: Option<&SecretString>) -> bool {
    a.map(ExposeSecret::expose_secret) == b.map(ExposeSecret::expose_secret)
}
