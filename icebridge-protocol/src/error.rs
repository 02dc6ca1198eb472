//! Protocol error types and status codes.

use crate::encoding::{EncodingVersion, ProtocolVersion};
use crate::tag::TagFormat;
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding, decoding or framing Slice data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated data: need {needed} bytes, {remaining} remaining")]
    TruncatedData { needed: usize, remaining: usize },

    #[error("invalid tag format for tag {tag}: expected {expected:?}, found {found:?}")]
    InvalidTagFormat {
        tag: i32,
        expected: TagFormat,
        found: TagFormat,
    },

    #[error("unresolved class reference: {0}")]
    UnresolvedReference(i32),

    #[error("unknown class type: {0}")]
    UnknownClass(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid magic bytes: expected 'IceP', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(ProtocolVersion),

    #[error("unsupported encoding version: {0}")]
    UnsupportedEncoding(EncodingVersion),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid message size: {0}")]
    InvalidMessageSize(i32),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("compressed messages are not supported")]
    CompressionNotSupported,

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("invalid service address: {0}")]
    InvalidServiceAddress(String),
}

impl ProtocolError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidData(msg.into())
    }

    /// Returns whether this error means the byte stream itself is corrupt.
    pub fn is_stream_corruption(&self) -> bool {
        matches!(
            self,
            ProtocolError::TruncatedData { .. }
                | ProtocolError::InvalidTagFormat { .. }
                | ProtocolError::UnresolvedReference(_)
                | ProtocolError::InvalidData(_)
                | ProtocolError::InvalidUtf8
        )
    }
}

/// Protocol-neutral outcome of a request.
///
/// Both reply encodings map onto this set. Values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    ApplicationError,
    ServiceNotFound,
    OperationNotFound,
    UnhandledException,
    DeadlineExpired,
}

impl StatusCode {
    /// Returns whether the request completed successfully.
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    /// Returns whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StatusCode::DeadlineExpired)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::ApplicationError => write!(f, "APPLICATION_ERROR"),
            StatusCode::ServiceNotFound => write!(f, "SERVICE_NOT_FOUND"),
            StatusCode::OperationNotFound => write!(f, "OPERATION_NOT_FOUND"),
            StatusCode::UnhandledException => write!(f, "UNHANDLED_EXCEPTION"),
            StatusCode::DeadlineExpired => write!(f, "DEADLINE_EXPIRED"),
        }
    }
}
