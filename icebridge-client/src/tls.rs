//! TLS settings and connector for outbound connections.

use crate::error::ClientError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// PEM CA certificate(s) for server verification. Web PKI roots are used
    /// when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate chain, for mutual TLS.
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key, for mutual TLS.
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (development only).
    pub insecure: bool,
    /// Server name for SNI and verification. Defaults to the dialed host.
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Builds the connector and the name to present for `host`.
    pub fn connector(&self, host: &str) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
        let builder = if self.insecure {
            tracing::warn!("Using insecure TLS (certificate verification disabled)");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyServerCert))
        } else {
            rustls::ClientConfig::builder().with_root_certificates(self.root_store()?)
        };

        let client_config = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(ClientError::TlsConfig(
                    "client certificate and key must be set together".to_string(),
                ))
            }
        };

        let name = self.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))?;

        Ok((TlsConnector::from(Arc::new(client_config)), server_name))
    }

    fn root_store(&self) -> Result<RootCertStore, ClientError> {
        let mut store = RootCertStore::empty();
        match &self.ca_cert_path {
            Some(ca_path) => {
                for cert in load_certs(ca_path)? {
                    store
                        .add(cert)
                        .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
                }
            }
            None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(store)
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyServerCert;

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _: &CertificateDer<'_>,
            _: &[CertificateDer<'_>],
            _: &ServerName<'_>,
            _: &[u8],
            _: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ClientError::TlsConfig(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_empty_pem_has_no_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();

        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
        let err = load_certs(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_web_pki_connector() {
        let (_, name) = TlsClientConfig::new().connector("example.com").unwrap();
        assert_eq!(name, ServerName::try_from("example.com").unwrap());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsClientConfig::new()
            .with_insecure()
            .with_server_name("icebridge.local");
        let (_, name) = config.connector("127.0.0.1").unwrap();
        assert_eq!(name, ServerName::try_from("icebridge.local").unwrap());
    }

    #[test]
    fn test_half_configured_client_cert() {
        let mut config = TlsClientConfig::new();
        config.client_cert_path = Some("/tmp/cert.pem".into());
        let err = config.connector("localhost").err().expect("expected error");
        assert!(err.to_string().contains("must be set together"));
    }
}
