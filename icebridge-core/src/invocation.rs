//! Client-side interpretation of replies.

use crate::error::ConnectionError;
use icebridge_protocol::{
    Activator, DecodedException, Encapsulation, ProtocolError, ReplyBody, SliceException,
    SlicingPolicy, StatusCode,
};
use thiserror::Error;

/// Failure of a twoway invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// A user exception the operation declares.
    #[error("user exception: {0}")]
    UserException(Box<dyn SliceException>),

    /// The peer answered with a failure status.
    #[error("{status}: {message}")]
    Remote { status: StatusCode, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The reply could not be decoded.
    #[error("reply decode failed: {0}")]
    Protocol(#[from] ProtocolError),
}

impl InvocationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InvocationError::UserException(_) => StatusCode::ApplicationError,
            InvocationError::Remote { status, .. } => *status,
            InvocationError::Connection(err) => err.status_code(),
            InvocationError::Protocol(_) => StatusCode::UnhandledException,
        }
    }

    /// Message carried by a remote failure.
    pub fn message(&self) -> Option<&str> {
        match self {
            InvocationError::Remote { message, .. } => Some(message),
            _ => None,
        }
    }

    fn unknown_user_exception(type_id: &str) -> Self {
        InvocationError::Remote {
            status: StatusCode::UnhandledException,
            message: format!("unknown user exception: {type_id}"),
        }
    }
}

/// Turns a reply into the operation's result encapsulation.
///
/// User exceptions are decoded with `activator` and kept only when they are
/// one of `declared`; anything else becomes an unhandled exception.
pub fn into_result(
    body: ReplyBody,
    activator: Option<&dyn Activator>,
    declared: &[&str],
) -> Result<Encapsulation, InvocationError> {
    let status = body.status_code();
    match body {
        ReplyBody::Ok(encapsulation) => Ok(encapsulation),
        ReplyBody::UserException(encapsulation) => {
            let mut decoder = encapsulation
                .decoder()
                .with_slicing_policy(SlicingPolicy::Slice);
            if let Some(activator) = activator {
                decoder = decoder.with_activator(activator);
            }
            match decoder.decode_exception()? {
                DecodedException::Known(exception) => {
                    if declared.iter().any(|type_id| exception.is_a(type_id)) {
                        Err(InvocationError::UserException(exception))
                    } else {
                        Err(InvocationError::unknown_user_exception(
                            exception.slice_type_id(),
                        ))
                    }
                }
                DecodedException::Unknown { type_id } => {
                    Err(InvocationError::unknown_user_exception(&type_id))
                }
            }
        }
        ReplyBody::ObjectNotExist(failed)
        | ReplyBody::FacetNotExist(failed)
        | ReplyBody::OperationNotExist(failed) => Err(InvocationError::Remote {
            status,
            message: format!(
                "{} not found: identity '{}' facet '{}' operation '{}'",
                if status == StatusCode::OperationNotFound {
                    "operation"
                } else {
                    "service"
                },
                failed.identity,
                failed.facet,
                failed.operation
            ),
        }),
        ReplyBody::UnknownLocalException(message)
        | ReplyBody::UnknownUserException(message)
        | ReplyBody::UnknownException(message) => {
            Err(InvocationError::Remote { status, message })
        }
    }
}
