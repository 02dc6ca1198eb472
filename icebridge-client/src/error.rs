//! Client error types.

use icebridge_core::{ConnectionError, InvocationError};
use icebridge_protocol::{ProtocolError, SliceException, StatusCode};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("connect timeout")]
    Timeout,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("cannot dial {0}")]
    UnsupportedAddress(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::Connection(err) => err.is_retryable(),
            ClientError::Invocation(InvocationError::Connection(err)) => err.is_retryable(),
            ClientError::Invocation(err) => err.status_code().is_retryable(),
            _ => false,
        }
    }

    /// Protocol-neutral status of the failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClientError::Connection(err) => err.status_code(),
            ClientError::Invocation(err) => err.status_code(),
            ClientError::Timeout => StatusCode::DeadlineExpired,
            _ => StatusCode::UnhandledException,
        }
    }

    /// The declared user exception raised by the operation, if that is what
    /// failed.
    pub fn user_exception(&self) -> Option<&dyn SliceException> {
        match self {
            ClientError::Invocation(InvocationError::UserException(exception)) => {
                Some(exception.as_ref())
            }
            _ => None,
        }
    }

    /// Message carried by a remote failure.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            ClientError::Invocation(err) => err.message(),
            _ => None,
        }
    }
}
