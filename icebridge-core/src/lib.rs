//! # icebridge-core
//!
//! Connection lifecycle for icebridge.
//!
//! This crate provides:
//! - The Ice 1.0 handshake and request/reply multiplexing over any byte stream
//! - Idle heartbeats, inactivity shutdown and the graceful close handshake
//! - The [`Dispatcher`] seam servers implement and client-side reply handling
//! - TLS peer identities surfaced to dispatch

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod lifecycle;
pub mod options;
pub mod peer;

pub use connection::Connection;
pub use dispatch::{
    reply_body, request_target, DispatchError, DispatchResult, Dispatcher, ExceptionEnforcement,
    IncomingRequest,
};
pub use error::ConnectionError;
pub use invocation::{into_result, InvocationError};
pub use lifecycle::{CloseReason, ConnectionState, Lifecycle, LifecycleAction, Role};
pub use options::{ConnectionOptions, IdleCheckMode, IdlePolicy};
pub use peer::{PeerIdentity, PeerInfo, PeerValidator};
