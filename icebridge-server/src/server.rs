//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::router::Router;
use crate::stream::MaybeTlsStream;
use crate::tls::create_tls_acceptor;
use async_trait::async_trait;
use dashmap::DashMap;
use icebridge_core::{
    Connection, ConnectionOptions, DispatchResult, Dispatcher, IncomingRequest, PeerInfo,
    PeerValidator, Role,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Settings for every accepted connection.
    pub options: ConnectionOptions,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Extra check on client certificates.
    pub peer_validator: Option<Arc<dyn PeerValidator>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("options", &self.options)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("peer_validator", &self.peer_validator.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            options: ConnectionOptions::default(),
            tls_acceptor: None,
            peer_validator: None,
        }
    }

    /// Builds the server configuration from a loaded [`Config`], creating the
    /// TLS acceptor when TLS is enabled.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;
        let mut server_config = Self::new(config.network.bind_addr)
            .with_max_connections(config.network.max_connections)
            .with_options(config.connection_options());
        if config.tls.enabled {
            server_config = server_config.with_tls(create_tls_acceptor(&config.tls)?);
        }
        Ok(server_config)
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn with_peer_validator(mut self, validator: impl PeerValidator + 'static) -> Self {
        self.peer_validator = Some(Arc::new(validator));
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Router wrapper that counts dispatches.
struct Counted {
    router: Arc<Router>,
    stats: Arc<ServerStats>,
}

#[async_trait]
impl Dispatcher for Counted {
    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        let result = self.router.dispatch(request).await;
        if result.is_err() {
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Ice server hosting the servants of one [`Router`].
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    connections: Arc<DashMap<Uuid, Connection>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, router: Arc<Router>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(ServerStats::default());
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(Counted {
            router: router.clone(),
            stats: stats.clone(),
        });
        Self {
            config,
            dispatcher,
            router,
            stats,
            connections: Arc::new(DashMap::new()),
            local_addr: Mutex::new(None),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs the server on an already bound listener until [`shutdown`](Self::shutdown).
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Server listening on {} ({})", local_addr, tls_mode);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let config = self.config.clone();
                            let dispatcher = self.dispatcher.clone();
                            let connections = self.connections.clone();
                            let stats = self.stats.clone();

                            tokio::spawn(async move {
                                match Self::accept_connection(tcp_stream, addr, &config, dispatcher).await {
                                    Ok(connection) => {
                                        let id = connection.id();
                                        connections.insert(id, connection.clone());
                                        let state = connection.closed().await;
                                        connections.remove(&id);
                                        tracing::info!("[{}] Client disconnected ({:?})", addr, state);
                                    }
                                    Err(e) => {
                                        tracing::warn!("[{}] Connection rejected: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        self.close_connections().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// TLS, peer validation and the Ice handshake for one accepted socket.
    async fn accept_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        config: &ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Connection, ServerError> {
        tcp_stream.set_nodelay(true).ok();
        let stream = Self::maybe_tls_accept(
            tcp_stream,
            config.tls_acceptor.as_deref(),
            addr,
            config.options.handshake_timeout,
        )
        .await?;

        let mut peer = PeerInfo::new(addr);
        if let Some(identity) = stream.peer_identity() {
            tracing::debug!("[{}] Client certificate {}", addr, identity.fingerprint());
            peer = peer.with_identity(identity);
        }
        if let Some(validator) = &config.peer_validator {
            let identity = peer.identity.as_deref().ok_or_else(|| {
                icebridge_core::ConnectionError::AuthenticationFailed(
                    "client presented no certificate".to_string(),
                )
            })?;
            validator
                .validate(identity)
                .map_err(icebridge_core::ConnectionError::AuthenticationFailed)?;
        }

        let connection = Connection::establish(
            stream,
            Role::Acceptor,
            peer,
            config.options.clone(),
            Some(dispatcher),
        )
        .await?;
        Ok(connection)
    }

    /// Optionally performs TLS handshake on the stream.
    async fn maybe_tls_accept(
        tcp_stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<MaybeTlsStream, ServerError> {
        match acceptor {
            Some(acceptor) => {
                tracing::debug!("[{}] Performing TLS handshake...", addr);
                let tls_stream = tokio::time::timeout(timeout, acceptor.accept(tcp_stream))
                    .await
                    .map_err(|_| icebridge_core::ConnectionError::Timeout)?
                    .map_err(|e| icebridge_core::ConnectionError::AuthenticationFailed(e.to_string()))?;
                tracing::debug!("[{}] TLS handshake completed", addr);
                Ok(MaybeTlsStream::Tls { stream: tls_stream })
            }
            None => Ok(MaybeTlsStream::Plain { stream: tcp_stream }),
        }
    }

    /// Gracefully shuts down every tracked connection.
    async fn close_connections(&self) {
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if connections.is_empty() {
            return;
        }

        tracing::info!("Closing {} connection(s)", connections.len());
        let mut closing = JoinSet::new();
        for connection in connections {
            closing.spawn(async move { connection.shutdown().await });
        }
        while closing.join_next().await.is_some() {}
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address of the bound listener, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
