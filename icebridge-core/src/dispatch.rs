//! Server-side request dispatch.

use crate::peer::PeerInfo;
use async_trait::async_trait;
use icebridge_protocol::message::RequestFailed;
use icebridge_protocol::{
    ClassFormat, Context, Encapsulation, Identity, OperationMode, ProtocolError, ReplyBody,
    Request, SliceDecoder, SliceEncoder, SliceException, StatusCode,
};
use thiserror::Error;
use uuid::Uuid;

/// A request handed to a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub request: Request,
    pub peer: PeerInfo,
    pub connection_id: Uuid,
    pub class_format: ClassFormat,
    pub class_graph_depth_max: usize,
}

impl IncomingRequest {
    pub fn identity(&self) -> &Identity {
        &self.request.identity
    }

    pub fn facet(&self) -> &str {
        &self.request.facet
    }

    pub fn operation(&self) -> &str {
        &self.request.operation
    }

    pub fn mode(&self) -> OperationMode {
        self.request.mode
    }

    pub fn context(&self) -> &Context {
        &self.request.context
    }

    pub fn is_oneway(&self) -> bool {
        self.request.is_oneway()
    }

    /// Decoder over the argument encapsulation.
    pub fn params_decoder(&self) -> SliceDecoder<'_> {
        self.request
            .params
            .decoder()
            .with_class_graph_depth_max(self.class_graph_depth_max)
    }

    /// Encodes a return value in the connection's class format.
    pub fn encode_result<F>(&self, f: F) -> Result<Encapsulation, DispatchError>
    where
        F: FnOnce(&mut SliceEncoder) -> Result<(), ProtocolError>,
    {
        Ok(Encapsulation::build_with(self.class_format, f)?)
    }
}

/// Failure outcome of a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("service not found")]
    ServiceNotFound,

    #[error("facet not found")]
    FacetNotFound,

    #[error("operation not found")]
    OperationNotFound,

    #[error("user exception: {0}")]
    UserException(Box<dyn SliceException>),

    #[error("{0}")]
    Unhandled(String),

    #[error("deadline expired: {0}")]
    DeadlineExpired(String),
}

impl DispatchError {
    pub fn unhandled(message: impl Into<String>) -> Self {
        DispatchError::Unhandled(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::ServiceNotFound | DispatchError::FacetNotFound => {
                StatusCode::ServiceNotFound
            }
            DispatchError::OperationNotFound => StatusCode::OperationNotFound,
            DispatchError::UserException(_) => StatusCode::ApplicationError,
            DispatchError::Unhandled(_) => StatusCode::UnhandledException,
            DispatchError::DeadlineExpired(_) => StatusCode::DeadlineExpired,
        }
    }
}

impl From<ProtocolError> for DispatchError {
    fn from(err: ProtocolError) -> Self {
        DispatchError::Unhandled(err.to_string())
    }
}

pub type DispatchResult = Result<Encapsulation, DispatchError>;

/// Where a user exception outside an operation's declared set is downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionEnforcement {
    /// The dispatching side replaces it with an unhandled exception.
    #[default]
    Dispatch,
    /// It is sent as-is; the invoking side downgrades it.
    Invoke,
}

impl ExceptionEnforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionEnforcement::Dispatch => "dispatch",
            ExceptionEnforcement::Invoke => "invoke",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dispatch" => Some(ExceptionEnforcement::Dispatch),
            "invoke" => Some(ExceptionEnforcement::Invoke),
            _ => None,
        }
    }

    /// Applies the enforcement to a user exception thrown by a servant.
    pub fn check(
        &self,
        exception: Box<dyn SliceException>,
        declared: &[&str],
    ) -> DispatchError {
        match self {
            ExceptionEnforcement::Invoke => DispatchError::UserException(exception),
            ExceptionEnforcement::Dispatch => {
                if declared.iter().any(|type_id| exception.is_a(type_id)) {
                    DispatchError::UserException(exception)
                } else {
                    DispatchError::Unhandled(exception.to_string())
                }
            }
        }
    }
}

/// Handles requests arriving on a connection.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult;
}

/// Converts a dispatch outcome into the reply sent to the caller.
pub fn reply_body(target: RequestFailed, result: DispatchResult) -> ReplyBody {
    match result {
        Ok(encapsulation) => ReplyBody::Ok(encapsulation),
        Err(DispatchError::ServiceNotFound) => ReplyBody::ObjectNotExist(target),
        Err(DispatchError::FacetNotFound) => ReplyBody::FacetNotExist(target),
        Err(DispatchError::OperationNotFound) => ReplyBody::OperationNotExist(target),
        Err(DispatchError::UserException(exception)) => {
            match Encapsulation::build_with(ClassFormat::Sliced, |encoder| {
                encoder.encode_exception(exception.as_ref())
            }) {
                Ok(encapsulation) => ReplyBody::UserException(encapsulation),
                Err(err) => ReplyBody::UnknownUserException(format!(
                    "failed to encode {}: {err}",
                    exception.slice_type_id()
                )),
            }
        }
        Err(DispatchError::Unhandled(message)) => ReplyBody::UnknownException(message),
        // Ice 1.0 has no deadline status.
        Err(DispatchError::DeadlineExpired(message)) => ReplyBody::UnknownLocalException(message),
    }
}

/// Identifies the target of `request` for not-found replies.
pub fn request_target(request: &Request) -> RequestFailed {
    RequestFailed {
        identity: request.identity.clone(),
        facet: request.facet.clone(),
        operation: request.operation.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use icebridge_protocol::{
        Activator, DecodedException, EncodingVersion, TypeRegistry,
    };
    use std::any::Any;
    use std::fmt;

    #[derive(Debug, Default)]
    pub struct CustomFailure {
        pub message: String,
    }

    impl fmt::Display for CustomFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.message)
        }
    }

    impl SliceException for CustomFailure {
        fn slice_type_id(&self) -> &str {
            "::Test::CustomFailure"
        }

        fn type_ids(&self) -> &'static [&'static str] {
            &["::Test::CustomFailure"]
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::CustomFailure", None, true);
            encoder.encode_string(&self.message);
            encoder.end_slice()
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.message = decoder.decode_string()?;
            decoder.end_slice()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn failure(message: &str) -> Box<dyn SliceException> {
        Box::new(CustomFailure {
            message: message.to_string(),
        })
    }

    fn target() -> RequestFailed {
        request_target(&Request::new(
            Identity::new("test"),
            "op",
            Encapsulation::empty(),
        ))
    }

    #[test]
    fn test_dispatch_enforcement_downgrades_undeclared() {
        let err = ExceptionEnforcement::Dispatch.check(failure("super custom error message"), &[]);
        assert_eq!(err.status_code(), StatusCode::UnhandledException);
        assert_eq!(
            reply_body(target(), Err(err)),
            ReplyBody::UnknownException("super custom error message".into())
        );
    }

    #[test]
    fn test_dispatch_enforcement_keeps_declared() {
        let err = ExceptionEnforcement::Dispatch
            .check(failure("declared"), &["::Test::CustomFailure"]);
        assert!(matches!(err, DispatchError::UserException(_)));
    }

    #[test]
    fn test_invoke_enforcement_sends_as_is() {
        let err = ExceptionEnforcement::Invoke.check(failure("anything"), &[]);
        let body = reply_body(target(), Err(err));
        let ReplyBody::UserException(encapsulation) = body else {
            panic!("expected a user exception reply");
        };
        assert_eq!(encapsulation.encoding, EncodingVersion::V1_1);

        let registry = TypeRegistry::new().with_exception("::Test::CustomFailure", || {
            Box::new(CustomFailure::default()) as Box<dyn SliceException>
        });
        let activator: &dyn Activator = &registry;
        let mut decoder = encapsulation.decoder().with_activator(activator);
        match decoder.decode_exception().unwrap() {
            DecodedException::Known(exception) => assert_eq!(exception.to_string(), "anything"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_found_replies() {
        assert!(matches!(
            reply_body(target(), Err(DispatchError::ServiceNotFound)),
            ReplyBody::ObjectNotExist(_)
        ));
        assert!(matches!(
            reply_body(target(), Err(DispatchError::FacetNotFound)),
            ReplyBody::FacetNotExist(_)
        ));
        let body = reply_body(target(), Err(DispatchError::OperationNotFound));
        assert_eq!(body.status_code(), StatusCode::OperationNotFound);
    }

    #[test]
    fn test_deadline_expired_is_lossy() {
        let body = reply_body(
            target(),
            Err(DispatchError::DeadlineExpired("too slow".into())),
        );
        assert_eq!(body, ReplyBody::UnknownLocalException("too slow".into()));
        assert_eq!(body.status_code(), StatusCode::UnhandledException);
    }

    #[test]
    fn test_decode_failure_is_unhandled() {
        let err: DispatchError = ProtocolError::InvalidUtf8.into();
        assert_eq!(err.status_code(), StatusCode::UnhandledException);
    }

    #[test]
    fn test_enforcement_names() {
        assert_eq!(
            ExceptionEnforcement::parse("invoke"),
            Some(ExceptionEnforcement::Invoke)
        );
        assert_eq!(ExceptionEnforcement::Dispatch.as_str(), "dispatch");
        assert_eq!(ExceptionEnforcement::parse("server"), None);
    }
}
