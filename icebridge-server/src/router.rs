//! Servant registry and request routing.
//!
//! Requests are routed by identity, then facet. The built-in `ice_*`
//! operations are answered here for every registered servant; everything
//! else is handed to the servant.

use async_trait::async_trait;
use dashmap::DashMap;
use icebridge_core::{
    DispatchError, DispatchResult, Dispatcher, ExceptionEnforcement, IncomingRequest,
};
use icebridge_protocol::{Encapsulation, Identity};
use std::collections::HashMap;
use std::sync::Arc;

/// Type id every object implements.
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// An object implementation.
#[async_trait]
pub trait Servant: Send + Sync {
    /// Type ids implemented by this servant, most-derived first.
    fn type_ids(&self) -> &[&'static str];

    /// User exceptions `operation` may raise.
    fn declared_exceptions(&self, _operation: &str) -> &[&'static str] {
        &[]
    }

    /// Handles an application operation.
    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult;
}

/// Routes requests to servants by identity and facet.
pub struct Router {
    servants: DashMap<Identity, HashMap<String, Arc<dyn Servant>>>,
    enforcement: ExceptionEnforcement,
}

impl Router {
    pub fn new(enforcement: ExceptionEnforcement) -> Self {
        Self {
            servants: DashMap::new(),
            enforcement,
        }
    }

    pub fn enforcement(&self) -> ExceptionEnforcement {
        self.enforcement
    }

    /// Registers `servant` as the default facet of `identity`, replacing any
    /// previous one.
    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) {
        self.add_facet(identity, "", servant);
    }

    pub fn add_facet(&self, identity: Identity, facet: impl Into<String>, servant: Arc<dyn Servant>) {
        let facet = facet.into();
        tracing::debug!("Registered servant {} facet {:?}", identity, facet);
        self.servants
            .entry(identity)
            .or_default()
            .insert(facet, servant);
    }

    /// Removes every facet of `identity`. Returns whether it was registered.
    pub fn remove(&self, identity: &Identity) -> bool {
        self.servants.remove(identity).is_some()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.servants.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.servants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servants.is_empty()
    }

    fn lookup(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>, DispatchError> {
        let facets = self
            .servants
            .get(identity)
            .ok_or(DispatchError::ServiceNotFound)?;
        facets
            .get(facet)
            .cloned()
            .ok_or(DispatchError::FacetNotFound)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(ExceptionEnforcement::default())
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
        let servant = self.lookup(request.identity(), request.facet())?;

        match request.operation() {
            "ice_ping" => Ok(Encapsulation::empty()),
            "ice_isA" => {
                let type_id = request.params_decoder().decode_string()?;
                let is_a = type_id == OBJECT_TYPE_ID || servant.type_ids().contains(&type_id.as_str());
                request.encode_result(|encoder| {
                    encoder.encode_bool(is_a);
                    Ok(())
                })
            }
            "ice_id" => {
                let type_id = servant.type_ids().first().copied().unwrap_or(OBJECT_TYPE_ID);
                request.encode_result(|encoder| {
                    encoder.encode_string(type_id);
                    Ok(())
                })
            }
            "ice_ids" => {
                let mut type_ids = servant.type_ids().to_vec();
                type_ids.push(OBJECT_TYPE_ID);
                type_ids.sort_unstable();
                type_ids.dedup();
                request.encode_result(|encoder| {
                    encoder.encode_sequence(&type_ids, |encoder, id| encoder.encode_string(id));
                    Ok(())
                })
            }
            _ => {
                let operation = request.operation().to_string();
                match servant.dispatch(request).await {
                    Err(DispatchError::UserException(exception)) => Err(self
                        .enforcement
                        .check(exception, servant.declared_exceptions(&operation))),
                    result => result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icebridge_core::PeerInfo;
    use icebridge_protocol::{
        ClassFormat, ProtocolError, Request, SliceDecoder, SliceEncoder, SliceException,
    };
    use std::any::Any;
    use std::fmt;

    #[derive(Debug, Default)]
    struct Refused {
        reason: String,
    }

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "refused: {}", self.reason)
        }
    }

    impl SliceException for Refused {
        fn slice_type_id(&self) -> &str {
            "::Demo::Refused"
        }

        fn type_ids(&self) -> &'static [&'static str] {
            &["::Demo::Refused"]
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Demo::Refused", None, true);
            encoder.encode_string(&self.reason);
            encoder.end_slice()
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.reason = decoder.decode_string()?;
            decoder.end_slice()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Door;

    #[async_trait]
    impl Servant for Door {
        fn type_ids(&self) -> &[&'static str] {
            &["::Demo::Door"]
        }

        fn declared_exceptions(&self, operation: &str) -> &[&'static str] {
            match operation {
                "open" => &["::Demo::Refused"],
                _ => &[],
            }
        }

        async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
            match request.operation() {
                "open" | "knock" => Err(DispatchError::UserException(Box::new(Refused {
                    reason: "locked".to_string(),
                }))),
                _ => Err(DispatchError::OperationNotFound),
            }
        }
    }

    fn incoming(identity: &str, facet: &str, operation: &str, params: Encapsulation) -> IncomingRequest {
        IncomingRequest {
            request: Request::new(Identity::new(identity), operation, params).with_facet(facet),
            peer: PeerInfo::new("127.0.0.1:5000".parse().unwrap()),
            connection_id: uuid::Uuid::new_v4(),
            class_format: ClassFormat::Compact,
            class_graph_depth_max: 100,
        }
    }

    fn router(enforcement: ExceptionEnforcement) -> Router {
        let router = Router::new(enforcement);
        router.add(Identity::new("door"), Arc::new(Door));
        router
    }

    #[tokio::test]
    async fn test_builtins() {
        let router = router(ExceptionEnforcement::Dispatch);

        let result = router
            .dispatch(incoming("door", "", "ice_ping", Encapsulation::empty()))
            .await
            .unwrap();
        assert!(result.is_empty());

        let params = Encapsulation::build(|e| {
            e.encode_string(OBJECT_TYPE_ID);
            Ok(())
        })
        .unwrap();
        let result = router
            .dispatch(incoming("door", "", "ice_isA", params))
            .await
            .unwrap();
        assert!(result.decoder().decode_bool().unwrap());

        let result = router
            .dispatch(incoming("door", "", "ice_id", Encapsulation::empty()))
            .await
            .unwrap();
        assert_eq!(result.decoder().decode_string().unwrap(), "::Demo::Door");

        let result = router
            .dispatch(incoming("door", "", "ice_ids", Encapsulation::empty()))
            .await
            .unwrap();
        let ids = result
            .decoder()
            .decode_sequence(1, |d| d.decode_string())
            .unwrap();
        assert_eq!(ids, vec!["::Demo::Door", "::Ice::Object"]);
    }

    #[tokio::test]
    async fn test_not_found() {
        let router = router(ExceptionEnforcement::Dispatch);

        let err = router
            .dispatch(incoming("window", "", "ice_ping", Encapsulation::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ServiceNotFound));

        let err = router
            .dispatch(incoming("door", "admin", "ice_ping", Encapsulation::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::FacetNotFound));

        let err = router
            .dispatch(incoming("door", "", "paint", Encapsulation::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::OperationNotFound));
    }

    #[tokio::test]
    async fn test_dispatch_enforcement() {
        let router = router(ExceptionEnforcement::Dispatch);

        let err = router
            .dispatch(incoming("door", "", "open", Encapsulation::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserException(_)));

        let err = router
            .dispatch(incoming("door", "", "knock", Encapsulation::empty()))
            .await
            .unwrap_err();
        match err {
            DispatchError::Unhandled(message) => assert_eq!(message, "refused: locked"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_enforcement_passes_through() {
        let router = router(ExceptionEnforcement::Invoke);
        let err = router
            .dispatch(incoming("door", "", "knock", Encapsulation::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserException(_)));
    }

    #[tokio::test]
    async fn test_facets_and_removal() {
        let router = router(ExceptionEnforcement::Dispatch);
        router.add_facet(Identity::new("door"), "admin", Arc::new(Door));
        router
            .dispatch(incoming("door", "admin", "ice_ping", Encapsulation::empty()))
            .await
            .unwrap();
        assert_eq!(router.len(), 1);

        assert!(router.remove(&Identity::new("door")));
        assert!(!router.contains(&Identity::new("door")));
        assert!(!router.remove(&Identity::new("door")));
        assert!(router.is_empty());
    }
}
