//! # icebridge-client
//!
//! Client library for icebridge.
//!
//! This crate provides:
//! - TCP and TLS dialing with optional server certificate checks
//! - A client handle that reconnects once its connection shuts down
//! - [`ServiceProxy`] for typed invocations and the built-in object operations

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tls;

pub use client::{Client, ServiceProxy};
pub use connection::{connect, ConnectionConfig};
pub use error::ClientError;
pub use tls::TlsClientConfig;
