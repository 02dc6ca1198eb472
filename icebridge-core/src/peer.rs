//! Authenticated peer information surfaced to the application.

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Transport-level facts about the remote end of a connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub identity: Option<Arc<PeerIdentity>>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }
}

/// Certificate chain presented and validated during the TLS handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    certificates: Vec<CertificateDer<'static>>,
    fingerprint: String,
}

impl PeerIdentity {
    /// Builds an identity from a chain, leaf first. Returns `None` for an
    /// empty chain.
    pub fn from_certificates(certificates: Vec<CertificateDer<'static>>) -> Option<Self> {
        let leaf = certificates.first()?;
        let fingerprint = hex::encode(Sha256::digest(leaf.as_ref()));
        Some(Self {
            certificates,
            fingerprint,
        })
    }

    /// Builds an identity from the chain of a finished TLS session.
    pub fn from_connection(connection: &rustls::CommonState) -> Option<Self> {
        let chain = connection.peer_certificates()?;
        Self::from_certificates(chain.to_vec())
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Lowercase hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("chain_len", &self.certificates.len())
            .finish()
    }
}

/// Rejects a peer after a successful TLS handshake.
pub trait PeerValidator: Send + Sync {
    fn validate(&self, peer: &PeerIdentity) -> Result<(), String>;
}

impl<F> PeerValidator for F
where
    F: Fn(&PeerIdentity) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, peer: &PeerIdentity) -> Result<(), String> {
        self(peer)
    }
}
