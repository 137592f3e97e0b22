//! Background token sink polling.
//!
//! Every tick reads the sink file without holding any session lock, opens it
//! (decrypting when a key exchange is in progress) and only then takes the
//! session lock to swap a changed token in.

use std::path::Path;
use std::sync::Weak;

use log::{debug, warn};
use secrecy::SecretString;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vaultwire_common::SinkEnvelope;

use crate::client::{ClientInner, CredentialSource, same_token};
use crate::config::DEFAULT_POLLING_INTERVAL;
use crate::crypto::DhState;
use crate::error::{ClientError, SinkError};

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Sink mode is off or no sink path is configured.
    Skipped,
    /// The sink holds the token already in use.
    Unchanged,
    /// A new token was swapped in.
    Updated,
}

/// A token read from the sink, plus key exchange progress to store.
#[derive(Debug)]
pub(crate) struct Opened {
    pub(crate) token: Option<SecretString>,
    pub(crate) dh_state: Option<DhState>,
}

/// Turn sink file contents into a token.
///
/// Contents shaped like an envelope are decrypted with `dh`; anything else
/// is a plaintext token. Surrounding whitespace is dropped and an empty
/// token means none.
pub(crate) fn open_sink_contents(
    path: &Path,
    contents: &str,
    dh: Option<&DhState>,
) -> Result<Opened, SinkError> {
    let Some(envelope) = SinkEnvelope::parse(contents) else {
        return Ok(Opened {
            token: token_from(contents),
            dh_state: None,
        });
    };
    let Some(dh) = dh else {
        return Err(SinkError::UnexpectedEnvelope {
            path: path.to_path_buf(),
        });
    };

    let (plaintext, dh_state) = dh.open(&envelope).map_err(|source| SinkError::Decrypt {
        path: path.to_path_buf(),
        source,
    })?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| SinkError::InvalidToken {
        path: path.to_path_buf(),
    })?;

    Ok(Opened {
        token: token_from(text),
        dh_state,
    })
}

fn token_from(text: &str) -> Option<SecretString> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| SecretString::from(trimmed.to_string()))
}

impl ClientInner {
    /// Run one poll.
    pub(crate) async fn poll_sink(&self) -> Result<Tick, ClientError> {
        let (path, dh) = {
            let state = self.read_state();
            if !state.use_sink_for_token {
                return Ok(Tick::Skipped);
            }
            let dh = match &state.source {
                CredentialSource::EncryptedSink(dh) => Some(dh.clone()),
                CredentialSource::Explicit | CredentialSource::PlainSink => None,
            };
            let Some(path) = self.read_config().token_file_sink_path.clone() else {
                return Ok(Tick::Skipped);
            };
            (path, dh)
        };

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SinkError::Read {
                path: path.clone(),
                source,
            })?;
        let opened = open_sink_contents(&path, &contents, dh.as_ref())?;

        let mut state = self.write_state();
        if let (Some(next), CredentialSource::EncryptedSink(current)) =
            (opened.dh_state, &mut state.source)
            && current.keypair().public_key() == next.keypair().public_key()
        {
            *current = next;
        }

        if !state.use_sink_for_token {
            return Ok(Tick::Skipped);
        }
        if same_token(state.token.as_ref(), opened.token.as_ref()) {
            return Ok(Tick::Unchanged);
        }
        state.token = opened.token;
        Ok(Tick::Updated)
    }
}

/// Spawn the poller for a session.
///
/// The task holds only a weak reference and exits when the session is
/// dropped or `shutdown` fires.
pub(crate) fn spawn_poller(
    runtime: &Handle,
    inner: Weak<ClientInner>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            let Some(interval) = inner.upgrade().map(|client| client.read_config().polling_interval)
            else {
                return;
            };
            let interval = if interval.is_zero() {
                DEFAULT_POLLING_INTERVAL
            } else {
                interval
            };

            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Token sink poller stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let Some(client) = inner.upgrade() else {
                return;
            };
            match client.poll_sink().await {
                Ok(Tick::Updated) => debug!("Token updated from sink"),
                Ok(Tick::Unchanged | Tick::Skipped) => {}
                Err(e) => warn!("Failed to refresh token from sink: {e}"),
            }
        }
    })
}
