//! Connection error types.

use icebridge_protocol::{ProtocolError, StatusCode};
use thiserror::Error;

/// Errors raised by connections and invocations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("incompatible protocol: {0}")]
    IncompatibleProtocol(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invocation timed out")]
    Timeout,
}

impl ConnectionError {
    /// Returns whether the invocation may succeed on a new connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionClosed
                | ConnectionError::ConnectionLost(_)
                | ConnectionError::Timeout
        )
    }

    /// Returns whether this error happened while establishing the connection.
    pub fn is_establishment_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::IncompatibleProtocol(_) | ConnectionError::AuthenticationFailed(_)
        )
    }

    /// Protocol-neutral status for an invocation that failed with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::Timeout => StatusCode::DeadlineExpired,
            _ => StatusCode::UnhandledException,
        }
    }
}

/// Classifies a frame error seen during the handshake.
pub(crate) fn handshake_error(err: ProtocolError) -> ConnectionError {
    match err {
        ProtocolError::InvalidMagic(_)
        | ProtocolError::UnsupportedProtocol(_)
        | ProtocolError::UnsupportedEncoding(_)
        | ProtocolError::CompressionNotSupported
        | ProtocolError::UnknownMessageType(_) => {
            ConnectionError::IncompatibleProtocol(err.to_string())
        }
        other => ConnectionError::Protocol(other),
    }
}
