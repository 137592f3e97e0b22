//! TLS context built from a [`TlsConfig`] descriptor.
//!
//! The context owns a `rustls` client configuration that the transport is
//! built from. Applying a descriptor builds a complete new configuration
//! first and only swaps it in on success, so a failed call leaves the
//! previous context untouched.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use vaultwire_common::TlsConfig;

use crate::error::ClientError;

/// The TLS half of a client's transport.
#[derive(Clone)]
pub struct TlsContext {
    settings: TlsConfig,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// A context trusting the bundled web PKI roots with no client
    /// certificate.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Tls`] if `rustls` rejects the protocol setup.
    pub fn new() -> Result<Self, ClientError> {
        let settings = TlsConfig::default();
        let config = build_client_config(&settings)?;
        Ok(Self { settings, config })
    }

    /// Apply a descriptor on top of the current settings.
    ///
    /// - A client certificate and key replace the current identity; the
    ///   certificate is presented for every handshake regardless of which
    ///   CAs the server asks for.
    /// - Any CA file or directory replaces the current trust roots. A CA
    ///   file wins over a CA directory.
    /// - `insecure` can only switch verification off. Skipping
    ///   verification gives up any assurance about the server's identity.
    /// - A non-empty server name replaces the name certificates are
    ///   verified against.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for a certificate without its key (or
    /// the reverse) and [`ClientError::Tls`] or [`ClientError::Io`] when the
    /// referenced files cannot be loaded. The context is unchanged on error.
    pub fn configure(&mut self, update: &TlsConfig) -> Result<(), ClientError> {
        update.validate()?;

        let merged = merge(&self.settings, update);
        let config = build_client_config(&merged)?;
        self.settings = merged;
        self.config = config;
        Ok(())
    }

    /// Whether server certificate verification is disabled.
    #[must_use]
    pub const fn insecure_skip_verify(&self) -> bool {
        self.settings.insecure
    }

    /// The name server certificates are verified against, when overridden.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.settings.server_name_override()
    }

    /// The descriptor currently in effect.
    #[must_use]
    pub const fn settings(&self) -> &TlsConfig {
        &self.settings
    }

    /// The `rustls` configuration for the transport.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        self.config.as_ref().clone()
    }
}

fn merge(current: &TlsConfig, update: &TlsConfig) -> TlsConfig {
    let mut merged = current.clone();
    if update.client_cert.is_some() && update.client_key.is_some() {
        merged.client_cert.clone_from(&update.client_cert);
        merged.client_key.clone_from(&update.client_key);
    }
    if update.has_custom_roots() {
        merged.ca_cert.clone_from(&update.ca_cert);
        merged.ca_path.clone_from(&update.ca_path);
    }
    merged.insecure = update.insecure;
    if let Some(name) = update.server_name_override() {
        merged.server_name = Some(name.to_string());
    }
    merged
}

fn tls_error(context: &str, err: impl fmt::Display) -> ClientError {
    ClientError::Tls(format!("{context}: {err}"))
}

fn build_client_config(settings: &TlsConfig) -> Result<Arc<ClientConfig>, ClientError> {
    let provider = Arc::new(ring::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = if settings.insecure {
        Arc::new(NoVerification {
            provider: Arc::clone(&provider),
        })
    } else {
        let roots = Arc::new(load_roots(settings)?);
        let webpki = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
            .build()
            .map_err(|e| tls_error("building certificate verifier", e))?;
        if let Some(name) = settings.server_name_override() {
            let name = ServerName::try_from(name.to_string())
                .map_err(|e| tls_error("invalid TLS server name", e))?;
            Arc::new(ServerNameOverride {
                inner: webpki,
                name,
            })
        } else {
            webpki
        }
    };

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| tls_error("configuring protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match settings.client_identity()? {
        Some((cert, key)) => {
            let resolver = SingleCertResolver::load(cert, key, &provider)?;
            builder.with_client_cert_resolver(Arc::new(resolver))
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, ClientError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!(
            "no PEM certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ClientError::Tls(format!("no private key found in {}", path.display())))
}

fn add_all(roots: &mut RootCertStore, path: &Path) -> Result<(), ClientError> {
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(&format!("adding CA from {}", path.display()), e))?;
    }
    Ok(())
}

fn load_roots(settings: &TlsConfig) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();

    if let Some(file) = &settings.ca_cert {
        add_all(&mut roots, file)?;
    } else if let Some(dir) = &settings.ca_path {
        let entries = std::fs::read_dir(dir).map_err(|source| ClientError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| ClientError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.is_file() {
                add_all(&mut roots, &path)?;
            }
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    if roots.is_empty() {
        return Err(ClientError::Tls("no CA certificates were loaded".to_string()));
    }
    Ok(roots)
}

/// Presents one client certificate for every handshake.
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl SingleCertResolver {
    fn load(cert: &Path, key: &Path, provider: &CryptoProvider) -> Result<Self, ClientError> {
        let chain = load_certs(cert)?;
        let key = provider
            .key_provider
            .load_private_key(load_private_key(key)?)
            .map_err(|e| tls_error("loading client key", e))?;
        Ok(Self(Arc::new(CertifiedKey::new(chain, key))))
    }
}

impl ResolvesClientCert for SingleCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Verifies the certificate chain against a fixed name instead of the
/// connection host.
#[derive(Debug)]
struct ServerNameOverride {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl ServerCertVerifier for ServerNameOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any server certificate. Handshake signatures are still checked
/// so the session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used)]

    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    pub(crate) const CA_CERT: &str = include_str!("../testdata/ca.pem");
    pub(crate) const CLIENT_CERT: &str = include_str!("../testdata/client.pem");
    pub(crate) const CLIENT_KEY: &str = include_str!("../testdata/client-key.pem");

    pub(crate) struct Fixtures {
        _dir: TempDir,
        pub ca_cert: PathBuf,
        pub ca_dir: PathBuf,
        pub client_cert: PathBuf,
        pub client_key: PathBuf,
    }

    pub(crate) fn fixtures() -> Fixtures {
        let dir = TempDir::new().unwrap();
        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };
        let ca_cert = write("ca.pem", CA_CERT);
        let client_cert = write("client.pem", CLIENT_CERT);
        let client_key = write("client-key.pem", CLIENT_KEY);

        let ca_dir = dir.path().join("cas");
        std::fs::create_dir(&ca_dir).unwrap();
        std::fs::write(ca_dir.join("one.pem"), CA_CERT).unwrap();

        Fixtures {
            _dir: dir,
            ca_cert,
            ca_dir,
            client_cert,
            client_key,
        }
    }

    #[test]
    fn default_context_verifies_with_web_roots() {
        let context = TlsContext::new().unwrap();
        assert!(!context.insecure_skip_verify());
        assert_eq!(context.server_name(), None);
        assert!(!context.client_config().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn valid_combinations_round_trip() {
        let f = fixtures();
        let cases = [
            TlsConfig::builder().ca_cert(f.ca_cert.clone()).build(),
            TlsConfig::builder().ca_path(f.ca_dir.clone()).build(),
            TlsConfig::builder()
                .ca_cert(f.ca_cert.clone())
                .client_cert(f.client_cert.clone())
                .client_key(f.client_key.clone())
                .server_name("vault.internal")
                .build(),
            TlsConfig::builder()
                .client_cert(f.client_cert.clone())
                .client_key(f.client_key.clone())
                .insecure(true)
                .build(),
            TlsConfig::builder()
                .insecure(true)
                .server_name("localhost")
                .build(),
        ];

        for tls in cases {
            let mut context = TlsContext::new().unwrap();
            context.configure(&tls).unwrap();
            assert_eq!(context.insecure_skip_verify(), tls.insecure, "{tls:?}");
            assert_eq!(context.server_name(), tls.server_name.as_deref(), "{tls:?}");
            assert_eq!(
                context.client_config().client_auth_cert_resolver.has_certs(),
                tls.client_cert.is_some()
            );
        }
    }

    #[test]
    fn half_an_identity_always_fails() {
        let f = fixtures();
        for tls in [
            TlsConfig::builder().client_cert(f.client_cert.clone()).build(),
            TlsConfig::builder().client_key(f.client_key.clone()).build(),
            TlsConfig::builder()
                .ca_cert(f.ca_cert.clone())
                .client_key(f.client_key.clone())
                .insecure(true)
                .build(),
        ] {
            let mut context = TlsContext::new().unwrap();
            let err = context.configure(&tls).unwrap_err();
            assert!(matches!(err, ClientError::Config(_)), "{err}");
            assert_eq!(context.settings(), &TlsConfig::default());
        }
    }

    #[test]
    fn unreadable_files_leave_context_untouched() {
        let mut context = TlsContext::new().unwrap();
        context
            .configure(&TlsConfig::builder().server_name("first").build())
            .unwrap();

        let err = context
            .configure(
                &TlsConfig::builder()
                    .ca_cert("/nonexistent/ca.pem")
                    .server_name("second")
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::Io { .. }), "{err}");
        assert_eq!(context.server_name(), Some("first"));
    }

    #[test]
    fn non_pem_ca_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.pem");
        std::fs::write(&path, "not a certificate").unwrap();

        let mut context = TlsContext::new().unwrap();
        let err = context
            .configure(&TlsConfig::builder().ca_cert(path).build())
            .unwrap_err();
        assert!(matches!(err, ClientError::Tls(_)), "{err}");
    }

    #[test]
    fn later_descriptors_layer_on_earlier_ones() {
        let f = fixtures();
        let mut context = TlsContext::new().unwrap();
        context
            .configure(&TlsConfig::builder().insecure(true).build())
            .unwrap();
        context
            .configure(
                &TlsConfig::builder()
                    .ca_cert(f.ca_cert.clone())
                    .server_name("vault.internal")
                    .build(),
            )
            .unwrap();

        assert!(!context.insecure_skip_verify());
        assert_eq!(context.server_name(), Some("vault.internal"));
        assert_eq!(context.settings().ca_cert.as_deref(), Some(f.ca_cert.as_path()));
    }

    #[test]
    fn skip_verify_follows_the_latest_descriptor() {
        let mut context = TlsContext::new().unwrap();
        context
            .configure(&TlsConfig::builder().insecure(true).build())
            .unwrap();
        assert!(context.insecure_skip_verify());

        context
            .configure(&TlsConfig::builder().insecure(false).build())
            .unwrap();
        assert!(!context.insecure_skip_verify());
        assert!(!context.settings().insecure);
    }
}
