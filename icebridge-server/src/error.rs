//! Server error types.

use crate::config::ConfigError;
use icebridge_core::ConnectionError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] icebridge_protocol::ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(_) => true,
            ServerError::Connection(err) => err.is_retryable(),
            _ => false,
        }
    }
}
