//! Connection driver.
//!
//! A [`Connection`] owns two background tasks: a read loop that parses frames
//! strictly in order, and a driver that runs the [`Lifecycle`] timers and
//! carries out its actions. Writers share the transport through an async
//! mutex so frames never interleave.

use crate::dispatch::{reply_body, request_target, Dispatcher, IncomingRequest};
use crate::error::{handshake_error, ConnectionError};
use crate::lifecycle::{CloseReason, ConnectionState, Lifecycle, LifecycleAction, Role};
use crate::options::ConnectionOptions;
use crate::peer::{PeerIdentity, PeerInfo};
use icebridge_protocol::{
    Decoder, Encoder, Frame, Message, MessageType, Reply, ReplyBody, Request,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Notify};
use uuid::Uuid;

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingReply = oneshot::Sender<Result<ReplyBody, ConnectionError>>;

struct Inner {
    id: Uuid,
    role: Role,
    peer: PeerInfo,
    options: ConnectionOptions,
    lifecycle: Mutex<Lifecycle>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<i32, PendingReply>>,
    next_request_id: AtomicI32,
    state: watch::Sender<ConnectionState>,
    wake: Notify,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// An established Ice connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Runs the Ice handshake over `stream` and starts the connection tasks.
    ///
    /// The acceptor sends ValidateConnection; the initiator waits for it.
    /// Requests arriving on the connection go to `dispatcher`, or are
    /// answered with "object not exist" when there is none.
    pub async fn establish<S>(
        stream: S,
        role: Role,
        peer: PeerInfo,
        options: ConnectionOptions,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader: BoxedReader = Box::new(reader);
        let mut writer: BoxedWriter = Box::new(writer);
        let mut decoder = Decoder::with_max_frame_size(options.max_frame_size);

        let handshake = handshake(role, &mut reader, &mut writer, &mut decoder);
        match tokio::time::timeout(options.handshake_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("[{}] Handshake failed: {}", peer.addr, e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("[{}] Handshake timed out", peer.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(role, &options, now);
        lifecycle.on_connected(now);
        let (state, _) = watch::channel(lifecycle.state());

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            role,
            peer,
            options,
            lifecycle: Mutex::new(lifecycle),
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI32::new(1),
            state,
            wake: Notify::new(),
            dispatcher,
        });

        tracing::info!(
            "[{}] Connection {} established ({:?})",
            inner.peer.addr,
            inner.id,
            role
        );

        tokio::spawn(read_loop(inner.clone(), reader, decoder));
        tokio::spawn(drive(inner.clone()));

        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// Certificate chain the peer presented, if the transport is TLS.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.inner.peer.identity.as_deref()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lifecycle.lock().close_reason().cloned()
    }

    /// Number of twoway invocations waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Sends a twoway request and waits for its reply.
    ///
    /// Dropping the returned future retires the request id; a reply arriving
    /// afterwards is discarded.
    pub async fn invoke(
        &self,
        mut request: Request,
        timeout: Option<Duration>,
    ) -> Result<ReplyBody, ConnectionError> {
        let inner = &self.inner;
        let id = inner.next_request_id();
        request.request_id = id;

        let (tx, rx) = oneshot::channel();
        {
            let mut lifecycle = inner.lifecycle.lock();
            if !lifecycle.accepts_invocations() {
                return Err(closed_error(&lifecycle));
            }
            lifecycle.invocation_started(Instant::now());
            inner.pending.lock().insert(id, tx);
        }
        let _guard = PendingGuard { inner, id };

        tracing::debug!(
            "[{}] Invoking {} on '{}' (request #{})",
            inner.peer.addr,
            request.operation,
            request.identity,
            id
        );
        inner.write_frame(&Message::Request(request).to_frame()).await?;

        let reply = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| ConnectionError::Timeout)?,
            None => rx.await,
        };
        reply.map_err(|_| ConnectionError::ConnectionClosed)?
    }

    /// Sends a oneway request. Returns once the frame is written.
    pub async fn invoke_oneway(&self, mut request: Request) -> Result<(), ConnectionError> {
        request.request_id = 0;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.accepts_invocations() {
                return Err(closed_error(&lifecycle));
            }
            lifecycle.on_activity(Instant::now());
        }
        self.inner
            .write_frame(&Message::Request(request).to_frame())
            .await
    }

    /// Starts a graceful shutdown and waits for the connection to close.
    pub async fn shutdown(&self) -> ConnectionState {
        if self
            .inner
            .lifecycle
            .lock()
            .request_shutdown(Instant::now(), CloseReason::Requested)
        {
            tracing::debug!("[{}] Shutdown requested", self.inner.peer.addr);
            self.inner.wake.notify_one();
        }
        self.closed().await
    }

    /// Drops the transport without the close handshake.
    pub fn abort(&self) {
        self.inner
            .fail(CloseReason::Failure("connection aborted".to_string()));
    }

    /// Waits until the connection is closed or failed.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Failed,
        };
        state
    }
}

/// Retires a request id when the invocation ends, however it ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
        self.inner
            .lifecycle
            .lock()
            .invocation_finished(Instant::now());
        self.inner.wake.notify_one();
    }
}

fn closed_error(lifecycle: &Lifecycle) -> ConnectionError {
    match (lifecycle.state(), lifecycle.close_reason()) {
        (ConnectionState::Failed, Some(reason)) => ConnectionError::ConnectionLost(reason.to_string()),
        _ => ConnectionError::ConnectionClosed,
    }
}

async fn handshake(
    role: Role,
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    decoder: &mut Decoder,
) -> Result<(), ConnectionError> {
    match role {
        Role::Acceptor => {
            let bytes = Encoder::encode_frame(&Frame::validate_connection())?;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            Ok(())
        }
        Role::Initiator => {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                if let Some(frame) = decoder.decode_frame().map_err(handshake_error)? {
                    return match frame.message_type {
                        MessageType::ValidateConnection => Ok(()),
                        other => Err(ConnectionError::IncompatibleProtocol(format!(
                            "expected ValidateConnection, received {other:?}"
                        ))),
                    };
                }
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Err(ConnectionError::ConnectionLost(
                        "closed during handshake".to_string(),
                    ));
                }
                decoder.extend(&buf[..n]);
            }
        }
    }
}

impl Inner {
    fn next_request_id(&self) -> i32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id > 0 {
                return id;
            }
            // Wrapped past i32::MAX; 0 is reserved for oneways.
            let _ = self.next_request_id.compare_exchange(
                id.wrapping_add(1),
                1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = Encoder::encode_frame(frame)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::ConnectionClosed)?;
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        drop(guard);

        match result {
            Ok(()) => {
                self.lifecycle.lock().on_frame_sent(Instant::now());
                tracing::debug!(
                    "[{}] Sent {:?} frame ({} bytes)",
                    self.peer.addr,
                    frame.message_type,
                    bytes.len()
                );
                Ok(())
            }
            Err(e) => {
                self.fail(CloseReason::Failure(e.to_string()));
                Err(ConnectionError::Io(e))
            }
        }
    }

    fn fail(&self, reason: CloseReason) {
        if self.lifecycle.lock().fail(reason) {
            self.wake.notify_one();
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let now = Instant::now();
        self.lifecycle.lock().on_frame_received(now);
        tracing::debug!(
            "[{}] Received {:?} frame ({} bytes)",
            self.peer.addr,
            frame.message_type,
            frame.wire_size()
        );

        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.reject_malformed(&frame, e);
                return;
            }
        };

        match message {
            Message::ValidateConnection => {}
            Message::CloseConnection => {
                tracing::debug!("[{}] Peer sent CloseConnection", self.peer.addr);
                self.lifecycle.lock().on_peer_close(now);
            }
            Message::Request(request) => self.accept_request(request, now),
            Message::BatchRequest(requests) => {
                for request in requests {
                    self.accept_request(request, now);
                }
            }
            Message::Reply(reply) => {
                self.lifecycle.lock().on_activity(now);
                let sender = self.pending.lock().remove(&reply.request_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply.body));
                    }
                    None => tracing::debug!(
                        "[{}] Discarding reply for retired request #{}",
                        self.peer.addr,
                        reply.request_id
                    ),
                }
            }
        }
        self.wake.notify_one();
    }

    /// A frame whose body failed to decode. Framing is still intact, so a
    /// request with a readable id gets an error reply and a reply is failed
    /// back to its caller.
    fn reject_malformed(self: &Arc<Self>, frame: &Frame, error: icebridge_protocol::ProtocolError) {
        let request_id = (frame.body.len() >= 4)
            .then(|| i32::from_le_bytes([frame.body[0], frame.body[1], frame.body[2], frame.body[3]]));
        tracing::warn!(
            "[{}] Malformed {:?} message: {}",
            self.peer.addr,
            frame.message_type,
            error
        );

        match (frame.message_type, request_id) {
            (MessageType::Request, Some(id)) if id > 0 => {
                let inner = self.clone();
                let body = ReplyBody::UnknownException(error.to_string());
                tokio::spawn(async move {
                    let reply = Message::Reply(Reply::new(id, body));
                    if let Err(e) = inner.write_frame(&reply.to_frame()).await {
                        tracing::debug!("[{}] Failed to send error reply: {}", inner.peer.addr, e);
                    }
                });
            }
            (MessageType::Reply, Some(id)) => {
                let sender = self.pending.lock().remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(Err(ConnectionError::Protocol(error)));
                }
            }
            (MessageType::Request, _) => {}
            _ => self.fail(CloseReason::Failure(error.to_string())),
        }
    }

    fn accept_request(self: &Arc<Self>, request: Request, now: Instant) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.accepts_requests() {
                tracing::debug!(
                    "[{}] Ignoring request received during shutdown",
                    self.peer.addr
                );
                return;
            }
            lifecycle.on_activity(now);
            lifecycle.dispatch_started(now);
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.dispatch(request).await });
    }

    async fn dispatch(self: Arc<Self>, request: Request) {
        let request_id = request.request_id;
        let target = request_target(&request);

        let result = match &self.dispatcher {
            Some(dispatcher) => {
                let incoming = IncomingRequest {
                    request,
                    peer: self.peer.clone(),
                    connection_id: self.id,
                    class_format: self.options.class_format,
                    class_graph_depth_max: self.options.class_graph_depth_max,
                };
                let dispatcher = dispatcher.clone();
                // A panicking servant must still produce a reply.
                match tokio::spawn(async move { dispatcher.dispatch(incoming).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(crate::dispatch::DispatchError::unhandled(format!(
                        "dispatch failed: {e}"
                    ))),
                }
            }
            None => Err(crate::dispatch::DispatchError::ServiceNotFound),
        };

        if request_id != 0 {
            let reply = Message::Reply(Reply::new(request_id, reply_body(target, result)));
            match self.write_frame(&reply.to_frame()).await {
                Ok(()) => self.lifecycle.lock().on_activity(Instant::now()),
                Err(e) => tracing::debug!(
                    "[{}] Failed to send reply #{}: {}",
                    self.peer.addr,
                    request_id,
                    e
                ),
            }
        }

        self.lifecycle.lock().dispatch_finished(Instant::now());
        self.wake.notify_one();
    }

    async fn perform(&self, action: LifecycleAction) {
        match action {
            LifecycleAction::SendValidate => {
                tracing::debug!("[{}] Sending heartbeat", self.peer.addr);
                let _ = self.write_frame(&Frame::validate_connection()).await;
            }
            LifecycleAction::SendClose => {
                if self.write_frame(&Frame::close_connection()).await.is_ok() {
                    self.lifecycle.lock().on_close_sent(Instant::now());
                }
            }
            LifecycleAction::CloseTransport => {
                tracing::debug!("[{}] Close handshake complete", self.peer.addr);
            }
            LifecycleAction::Abort(reason) => {
                tracing::debug!("[{}] Aborting connection: {}", self.peer.addr, reason);
            }
            LifecycleAction::WarnIdle(idle) => {
                tracing::warn!(
                    "[{}] Nothing received for {:?} (idle timeout {:?})",
                    self.peer.addr,
                    idle,
                    self.options.idle_timeout
                );
            }
        }
    }

    /// Closes the transport and fails every outstanding invocation.
    async fn release(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let (state, reason) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.state(), lifecycle.close_reason().cloned())
        };
        let pending: Vec<PendingReply> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let error = match (state, &reason) {
                (ConnectionState::Failed, Some(reason)) => {
                    ConnectionError::ConnectionLost(reason.to_string())
                }
                _ => ConnectionError::ConnectionClosed,
            };
            let _ = tx.send(Err(error));
        }

        let reason = reason.map(|r| r.to_string()).unwrap_or_default();
        tracing::info!(
            "[{}] Connection {} {} ({})",
            self.peer.addr,
            self.id,
            state,
            reason
        );
    }

    fn publish_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: BoxedReader, mut decoder: Decoder) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut state = inner.state.subscribe();

    loop {
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => inner.handle_frame(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[{}] Frame error: {}", inner.peer.addr, e);
                    inner.fail(CloseReason::Failure(e.to_string()));
                    return;
                }
            }
        }

        let result = tokio::select! {
            result = reader.read(&mut buf) => result,
            _ = state.wait_for(|s| s.is_terminal()) => return,
        };

        match result {
            Ok(0) => {
                tracing::debug!("[{}] Transport closed by peer", inner.peer.addr);
                inner.lifecycle.lock().on_transport_closed(Instant::now());
                inner.wake.notify_one();
                return;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                tracing::debug!("[{}] Read error: {}", inner.peer.addr, e);
                inner.fail(CloseReason::Failure(e.to_string()));
                return;
            }
        }
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        let actions = inner.lifecycle.lock().poll(Instant::now());
        let acted = !actions.is_empty();
        for action in actions {
            inner.perform(action).await;
        }

        let state = inner.lifecycle.lock().state();
        if state.is_terminal() {
            inner.release().await;
            inner.publish_state(state);
            return;
        }
        inner.publish_state(state);
        if acted {
            continue;
        }

        let deadline = inner.lifecycle.lock().next_deadline(Instant::now());
        let sleep = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = sleep => {}
            _ = inner.wake.notified() => {}
        }
    }
}
