//! High-level client API.

use crate::connection::{connect, ConnectionConfig};
use crate::error::ClientError;
use icebridge_core::{into_result, Connection};
use icebridge_protocol::{
    Context, Encapsulation, Identity, InvocationMode, OperationMode, Proxy, ReplyBody, Request,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Client handle for one server.
///
/// Holds at most one connection. [`Client::connection`] hands it out while it
/// is active and dials a new one once it has shut down or failed.
pub struct Client {
    config: ConnectionConfig,
    current: Mutex<Option<Connection>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a new connection, replacing the current one.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let mut current = self.current.lock().await;
        self.replace(&mut current).await
    }

    /// Returns the current connection, connecting if it is gone.
    pub async fn connection(&self) -> Result<Connection, ClientError> {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.as_ref().filter(|c| c.is_active()) {
            return Ok(connection.clone());
        }
        self.replace(&mut current).await
    }

    async fn replace(&self, current: &mut Option<Connection>) -> Result<Connection, ClientError> {
        let connection = connect(&self.config).await?;
        tracing::info!(
            "[{}] Connected (connection {})",
            self.config.addr,
            connection.id()
        );
        if let Some(previous) = current.replace(connection.clone()) {
            if previous.is_active() {
                tokio::spawn(async move { previous.shutdown().await });
            }
        }
        Ok(connection)
    }

    /// Returns whether the current connection is active.
    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_active())
    }

    /// Gracefully closes the current connection.
    pub async fn close(&self) {
        let connection = self.current.lock().await.take();
        if let Some(connection) = connection {
            tracing::debug!("[{}] Closing connection...", self.config.addr);
            connection.shutdown().await;
        }
    }

    /// Sends a twoway request on the current connection.
    pub async fn invoke(&self, request: Request) -> Result<ReplyBody, ClientError> {
        let connection = self.connection().await?;
        Ok(connection
            .invoke(request, self.config.invocation_timeout)
            .await?)
    }

    /// Sends a oneway request on the current connection.
    pub async fn invoke_oneway(&self, request: Request) -> Result<(), ClientError> {
        let connection = self.connection().await?;
        Ok(connection.invoke_oneway(request).await?)
    }
}

/// Typed invocations on one target object.
#[derive(Clone)]
pub struct ServiceProxy {
    client: Arc<Client>,
    identity: Identity,
    facet: String,
    context: Context,
    oneway: bool,
}

impl ServiceProxy {
    pub fn new(client: Arc<Client>, identity: Identity) -> Self {
        Self {
            client,
            identity,
            facet: String::new(),
            context: Context::new(),
            oneway: false,
        }
    }

    /// Targets the identity and facet of `proxy`. A oneway proxy sends
    /// [`invoke`](Self::invoke) calls as oneways.
    pub fn from_proxy(client: Arc<Client>, proxy: &Proxy) -> Self {
        let mut service = Self::new(client, proxy.identity.clone()).with_facet(proxy.facet.clone());
        service.oneway = matches!(proxy.mode, InvocationMode::Oneway | InvocationMode::Datagram);
        service
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    /// Context sent with every request.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    fn request(&self, operation: &str, mode: OperationMode, params: Encapsulation) -> Request {
        Request::new(self.identity.clone(), operation, params)
            .with_facet(self.facet.clone())
            .with_mode(mode)
            .with_context(self.context.clone())
    }

    /// Invokes `operation` and returns its result encapsulation.
    ///
    /// `declared` lists the user exceptions the operation may raise. Any other
    /// user exception arrives as an unhandled exception.
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Encapsulation,
        declared: &[&str],
    ) -> Result<Encapsulation, ClientError> {
        let request = self.request(operation, mode, params);
        if self.oneway {
            self.client.invoke_oneway(request).await?;
            return Ok(Encapsulation::empty());
        }

        let body = self.client.invoke(request).await?;
        let activator = self.client.config().activator.as_deref();
        Ok(into_result(body, activator, declared)?)
    }

    /// Invokes `operation` as a oneway.
    pub async fn invoke_oneway(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Encapsulation,
    ) -> Result<(), ClientError> {
        self.client
            .invoke_oneway(self.request(operation, mode, params))
            .await
    }

    async fn invoke_builtin(
        &self,
        operation: &str,
        params: Encapsulation,
    ) -> Result<Encapsulation, ClientError> {
        let request = self.request(operation, OperationMode::Idempotent, params);
        let body = self.client.invoke(request).await?;
        Ok(into_result(body, None, &[])?)
    }

    /// Checks that the target object exists.
    pub async fn ice_ping(&self) -> Result<(), ClientError> {
        self.invoke_builtin("ice_ping", Encapsulation::empty())
            .await?;
        Ok(())
    }

    /// Returns whether the target implements `type_id`.
    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool, ClientError> {
        let params = Encapsulation::build(|encoder| {
            encoder.encode_string(type_id);
            Ok(())
        })?;
        let result = self.invoke_builtin("ice_isA", params).await?;
        Ok(result.decoder().decode_bool()?)
    }

    /// Most-derived type id of the target.
    pub async fn ice_id(&self) -> Result<String, ClientError> {
        let result = self
            .invoke_builtin("ice_id", Encapsulation::empty())
            .await?;
        Ok(result.decoder().decode_string()?)
    }

    /// Every type id the target implements.
    pub async fn ice_ids(&self) -> Result<Vec<String>, ClientError> {
        let result = self
            .invoke_builtin("ice_ids", Encapsulation::empty())
            .await?;
        Ok(result
            .decoder()
            .decode_sequence(1, |decoder| decoder.decode_string())?)
    }
}
