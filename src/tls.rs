//! TLS client configuration for upstream API server connections.
//!
//! Builds a rustls `ClientConfig` from a cluster's PEM files for the
//! WebSocket stream proxy. Plain HTTP proxying goes through reqwest, which
//! loads the same files itself.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::cluster::ApiEndpoint;

/// Errors that can occur when building an upstream TLS configuration.
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read the CA bundle.
    CaRead(std::io::Error),
    /// Failed to read the client certificate.
    CertRead(std::io::Error),
    /// Failed to read the client private key.
    KeyRead(std::io::Error),
    /// No certificates found in a PEM file.
    NoCerts,
    /// A client certificate was configured without a key, or the key file
    /// holds none.
    NoKey,
    /// rustls rejected the configuration.
    Config(tokio_rustls::rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CaRead(e) => write!(f, "failed to read CA certificate file: {}", e),
            Self::CertRead(e) => write!(f, "failed to read client certificate file: {}", e),
            Self::KeyRead(e) => write!(f, "failed to read client key file: {}", e),
            Self::NoCerts => write!(f, "no certificates found in PEM file"),
            Self::NoKey => write!(f, "no private key found for client certificate"),
            Self::Config(e) => write!(f, "failed to build TLS config: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

fn load_certs(
    path: &Path,
    on_err: fn(std::io::Error) -> TlsError,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = std::fs::read(path).map_err(on_err)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(on_err)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }
    Ok(certs)
}

/// Build the client config for `api`.
///
/// Roots come from the cluster CA bundle when one is configured, otherwise
/// from the bundled web PKI roots. With `insecure_skip_tls_verify` the
/// server certificate is not checked at all.
pub fn client_config(api: &ApiEndpoint) -> Result<Arc<ClientConfig>, TlsError> {
    // Idempotent if a provider is already installed.
    let _ = crypto::aws_lc_rs::default_provider().install_default();

    let identity = match (&api.client_cert, &api.client_key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert, TlsError::CertRead)?;
            let key_data = std::fs::read(key).map_err(TlsError::KeyRead)?;
            let key = rustls_pemfile::private_key(&mut &key_data[..])
                .map_err(TlsError::KeyRead)?
                .ok_or(TlsError::NoKey)?;
            Some((certs, key))
        }
        (Some(_), None) => return Err(TlsError::NoKey),
        _ => None,
    };

    let builder = ClientConfig::builder();
    let builder = if api.insecure_skip_tls_verify {
        let provider = Arc::new(crypto::aws_lc_rs::default_provider());
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
    } else {
        let mut roots = RootCertStore::empty();
        match &api.ca_cert {
            Some(ca) => {
                for cert in load_certs(ca, TlsError::CaRead)? {
                    roots.add(cert).map_err(TlsError::Config)?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    };

    let config = match identity {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(TlsError::Config)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_endpoint_uses_web_roots() {
        let result = client_config(&ApiEndpoint::default());
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn insecure_endpoint_builds() {
        let api = ApiEndpoint {
            insecure_skip_tls_verify: true,
            ..Default::default()
        };
        assert!(client_config(&api).is_ok());
    }

    #[test]
    fn missing_ca_file_returns_error() {
        let api = ApiEndpoint {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(client_config(&api), Err(TlsError::CaRead(_))));
    }

    #[test]
    fn empty_ca_file_returns_no_certs() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "").unwrap();
        let api = ApiEndpoint {
            ca_cert: Some(ca),
            ..Default::default()
        };
        assert!(matches!(client_config(&api), Err(TlsError::NoCerts)));
    }

    #[test]
    fn client_cert_without_key_returns_no_key() {
        let api = ApiEndpoint {
            client_cert: Some(PathBuf::from("/nonexistent/client.pem")),
            ..Default::default()
        };
        assert!(matches!(client_config(&api), Err(TlsError::NoKey)));
    }

    #[test]
    fn missing_client_cert_file_returns_cert_read() {
        let api = ApiEndpoint {
            client_cert: Some(PathBuf::from("/nonexistent/client.pem")),
            client_key: Some(PathBuf::from("/nonexistent/client.key")),
            ..Default::default()
        };
        assert!(matches!(client_config(&api), Err(TlsError::CertRead(_))));
    }
}
