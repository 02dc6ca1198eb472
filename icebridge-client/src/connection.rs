//! Outbound connection setup.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::TlsClientConfig;
use icebridge_core::{
    Connection, ConnectionError, ConnectionOptions, PeerInfo, PeerValidator, Role,
};
use icebridge_protocol::{Activator, ProtocolError, ProtocolVersion, Proxy, Transport};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default invocation timeout.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection configuration.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Host name used for TLS server name when the TLS config names none.
    pub host: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Bound on each twoway invocation. `None` waits for the reply or the
    /// connection to fail.
    pub invocation_timeout: Option<Duration>,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
    /// Lifecycle settings for each connection.
    pub options: ConnectionOptions,
    /// Extra check on the server certificate chain.
    pub peer_validator: Option<Arc<dyn PeerValidator>>,
    /// Factory for user exceptions and classes in replies.
    pub activator: Option<Arc<dyn Activator>>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            host: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            invocation_timeout: Some(DEFAULT_INVOCATION_TIMEOUT),
            tls: None,
            options: ConnectionOptions::default(),
            peer_validator: None,
            activator: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_peer_validator(mut self, validator: impl PeerValidator + 'static) -> Self {
        self.peer_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_activator(mut self, activator: Arc<dyn Activator>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Resolves the first tcp or ssl endpoint of `proxy`. An ssl endpoint
    /// turns TLS on with web PKI roots.
    pub async fn from_proxy(proxy: &Proxy) -> Result<Self, ClientError> {
        if proxy.protocol != ProtocolVersion::ICE {
            return Err(ProtocolError::UnsupportedProtocol(proxy.protocol).into());
        }
        if let Some(adapter_id) = proxy.adapter_id() {
            return Err(ClientError::UnsupportedAddress(format!(
                "indirect proxy @{adapter_id}"
            )));
        }
        let endpoint = proxy
            .endpoints()
            .iter()
            .filter_map(|endpoint| endpoint.as_ip())
            .find(|ip| matches!(ip.transport, Transport::Tcp | Transport::Ssl))
            .ok_or_else(|| {
                ClientError::UnsupportedAddress(format!("{proxy}: no tcp or ssl endpoint"))
            })?;

        let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| {
                ClientError::UnsupportedAddress(format!("cannot resolve {}", endpoint.host))
            })?;

        let mut config = Self::new(addr).with_host(endpoint.host.clone());
        if endpoint.transport.is_secure() || proxy.secure {
            config = config.with_tls(TlsClientConfig::new());
        }
        Ok(config)
    }

    fn tls_enabled(&self) -> Option<&TlsClientConfig> {
        self.tls.as_ref().filter(|tls| tls.enabled)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("addr", &self.addr)
            .field("host", &self.host)
            .field("connect_timeout", &self.connect_timeout)
            .field("invocation_timeout", &self.invocation_timeout)
            .field("tls", &self.tls)
            .field("options", &self.options)
            .field("peer_validator", &self.peer_validator.is_some())
            .field("activator", &self.activator.is_some())
            .finish()
    }
}

/// Dials the server, runs TLS if configured, then the Ice handshake.
pub async fn connect(config: &ConnectionConfig) -> Result<Connection, ClientError> {
    tracing::debug!("Connecting to {}...", config.addr);

    let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
        .await
        .map_err(|_| {
            tracing::debug!("[{}] Connect timeout", config.addr);
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("[{}] Connect failed: {}", config.addr, e);
            ClientError::Io(e)
        })?;

    tcp_stream.set_nodelay(true).ok();

    let stream = match config.tls_enabled() {
        Some(tls_config) => {
            let host = config
                .host
                .clone()
                .unwrap_or_else(|| config.addr.ip().to_string());
            let (connector, server_name) = tls_config.connector(&host)?;

            tracing::debug!("[{}] Performing TLS handshake...", config.addr);
            let tls_stream = tokio::time::timeout(
                config.options.handshake_timeout,
                connector.connect(server_name, tcp_stream),
            )
            .await
            .map_err(|_| ClientError::Connection(ConnectionError::Timeout))?
            .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;
            ClientStream::Tls { stream: tls_stream }
        }
        None => ClientStream::Plain { stream: tcp_stream },
    };

    let mut peer = PeerInfo::new(config.addr);
    if let Some(identity) = stream.peer_identity() {
        tracing::debug!(
            "[{}] Server certificate {}",
            config.addr,
            identity.fingerprint()
        );
        peer = peer.with_identity(identity);
    }
    if let Some(validator) = &config.peer_validator {
        let identity = peer.identity.as_deref().ok_or_else(|| {
            ConnectionError::AuthenticationFailed("server presented no certificate".to_string())
        })?;
        validator.validate(identity).map_err(|reason| {
            tracing::warn!("[{}] Server rejected: {}", config.addr, reason);
            ConnectionError::AuthenticationFailed(reason)
        })?;
    }

    let connection = Connection::establish(
        stream,
        Role::Initiator,
        peer,
        config.options.clone(),
        None,
    )
    .await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:4061".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.invocation_timeout, Some(Duration::from_secs(30)));
        assert!(config.tls_enabled().is_none());
        assert!(config.peer_validator.is_none());
    }

    #[test]
    fn test_disabled_tls_is_plain() {
        let mut tls = TlsClientConfig::new();
        tls.enabled = false;
        let config = ConnectionConfig::new("127.0.0.1:4061".parse().unwrap()).with_tls(tls);
        assert!(config.tls_enabled().is_none());
    }

    #[tokio::test]
    async fn test_from_proxy() {
        let proxy = Proxy::parse("hello:udp -h 127.0.0.1 -p 9:tcp -h 127.0.0.1 -p 10000").unwrap();
        let config = ConnectionConfig::from_proxy(&proxy).await.unwrap();
        assert_eq!(config.addr, "127.0.0.1:10000".parse().unwrap());
        assert!(config.tls_enabled().is_none());

        let proxy = Proxy::parse("hello:ssl -h 127.0.0.1 -p 10001").unwrap();
        let config = ConnectionConfig::from_proxy(&proxy).await.unwrap();
        assert_eq!(config.host.as_deref(), Some("127.0.0.1"));
        assert!(config.tls_enabled().is_some());
    }

    #[tokio::test]
    async fn test_from_proxy_rejects_undialable() {
        let proxy = Proxy::parse("hello@HelloAdapter").unwrap();
        let err = ConnectionConfig::from_proxy(&proxy).await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedAddress(_)));

        let mut proxy = Proxy::parse("hello:tcp -h 127.0.0.1 -p 10000").unwrap();
        proxy.protocol = ProtocolVersion::ICERPC;
        let err = ConnectionConfig::from_proxy(&proxy).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&ConnectionConfig::new(addr)).await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[tokio::test]
    async fn test_validator_requires_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ConnectionConfig::new(addr).with_peer_validator(
            |_: &icebridge_core::PeerIdentity| -> Result<(), String> { Ok(()) },
        );

        let err = connect(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::AuthenticationFailed(_))
        ));
    }
}
