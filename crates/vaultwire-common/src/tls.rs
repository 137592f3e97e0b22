//! Declarative TLS settings.
//!
//! [`TlsConfig`] only describes where trust material lives and how peer
//! verification should behave. Loading the files and building a TLS context
//! is the client crate's job.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

/// TLS descriptor applied to a client's transport.
///
/// # Examples
///
/// ```
/// use vaultwire_common::TlsConfig;
///
/// let tls = TlsConfig::builder()
///     .ca_cert("/etc/vault/ca.pem")
///     .server_name("vault.internal")
///     .build();
///
/// assert!(tls.validate().is_ok());
/// assert!(!tls.insecure);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct TlsConfig {
    /// PEM file holding one or more CA certificates to trust.
    #[builder(default, setter(into, strip_option))]
    pub ca_cert: Option<PathBuf>,
    /// Directory of PEM files holding CA certificates to trust.
    ///
    /// Ignored when `ca_cert` is also set.
    #[builder(default, setter(into, strip_option))]
    pub ca_path: Option<PathBuf>,
    /// PEM client certificate presented to the server.
    #[builder(default, setter(into, strip_option))]
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    #[builder(default, setter(into, strip_option))]
    pub client_key: Option<PathBuf>,
    /// Hostname used to verify the server certificate instead of the
    /// address host.
    #[builder(default, setter(into, strip_option))]
    pub server_name: Option<String>,
    /// Skip server certificate verification entirely.
    ///
    /// This removes every guarantee about who is on the other end of the
    /// connection. Only use it against throwaway development servers.
    #[builder(default)]
    pub insecure: bool,
}

impl TlsConfig {
    /// Check that the client certificate and key are supplied together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingClientKey`] or
    /// [`ConfigError::MissingClientCert`] when only one half is present.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        match (&self.client_cert, &self.client_key) {
            (Some(_), None) => Err(ConfigError::MissingClientKey),
            (None, Some(_)) => Err(ConfigError::MissingClientCert),
            _ => Ok(()),
        }
    }

    /// The client certificate and key paths, when both are set.
    ///
    /// # Errors
    ///
    /// Same conditions as [`TlsConfig::validate`].
    pub fn client_identity(&self) -> Result<Option<(&Path, &Path)>, ConfigError> {
        self.validate()?;
        Ok(self
            .client_cert
            .as_deref()
            .zip(self.client_key.as_deref()))
    }

    /// Whether any CA source is configured.
    #[must_use]
    pub const fn has_custom_roots(&self) -> bool {
        self.ca_cert.is_some() || self.ca_path.is_some()
    }

    /// The non-empty server name override, if any.
    #[must_use]
    pub fn server_name_override(&self) -> Option<&str> {
        self.server_name.as_deref().filter(|name| !name.is_empty())
    }
}
