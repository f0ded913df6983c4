//! TLS contexts for server and client roles.
//!
//! A [`TlsContext`] is created once (per listener, or per outbound endpoint)
//! and shared by every connection that uses it. Only TLS 1.2 and 1.3 are
//! enabled. Servers authenticate themselves; client certificates are not
//! requested.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Protocol versions offered: minimum TLS 1.2.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

// ============================================================================
// TlsContext
// ============================================================================

/// Role-specific TLS configuration.
#[derive(Clone)]
pub enum TlsContext {
    /// Accepts TLS sessions with a certificate and private key.
    Server(TlsAcceptor),
    /// Initiates TLS sessions, verifying the peer against a trust store.
    Client(TlsConnector),
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(_) => f.write_str("TlsContext::Server"),
            Self::Client(_) => f.write_str("TlsContext::Client"),
        }
    }
}

impl TlsContext {
    /// Builds a server context from PEM certificate chain and key files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if either file is unreadable or invalid, or if
    /// the key does not match the certificate.
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
            Error::tls(format!("failed to load key {}: {e}", key_path.display()))
        })?;

        Self::server_from_der(certs, key)
    }

    /// Builds a server context from DER certificate chain and key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the key is rejected.
    pub fn server_from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::tls(format!("unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(format!("invalid certificate or key: {e}")))?;

        debug!("TLS server context created");
        Ok(Self::Server(TlsAcceptor::from(Arc::new(config))))
    }

    /// Builds a client context.
    ///
    /// Trusts the certificates in `ca_path` when given, otherwise the
    /// bundled Mozilla root set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the CA bundle is unreadable or empty.
    pub fn client(ca_path: Option<&Path>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        match ca_path {
            Some(path) => {
                let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
                if added == 0 {
                    return Err(Error::tls(format!(
                        "no usable CA certificates in {} ({ignored} ignored)",
                        path.display()
                    )));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        Self::client_with_roots(roots)
    }

    /// Builds a client context from an explicit trust store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the provider rejects the protocol versions.
    pub fn client_with_roots(roots: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::tls(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!("TLS client context created");
        Ok(Self::Client(TlsConnector::from(Arc::new(config))))
    }

    /// Returns `true` for a server context.
    #[inline]
    #[must_use]
    pub const fn is_server(&self) -> bool {
        matches!(self, Self::Server(_))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Uses the process default provider when installed, falling back to ring.
fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::tls(format!("failed to open {}: {e}", path.display())))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("invalid certificate in {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_client_with_bundled_roots() {
        let context = TlsContext::client(None).expect("bundled roots should load");
        assert!(!context.is_server());
        assert_eq!(format!("{context:?}"), "TlsContext::Client");
    }

    #[test]
    fn test_missing_server_files() {
        let err = TlsContext::server_from_pem(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Tls { .. }));
    }

    #[test]
    fn test_empty_ca_bundle_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let err = TlsContext::client(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Tls { .. }));
    }
}
