//! Ice request and reply messages.

use crate::address::Identity;
use crate::decoder::SliceDecoder;
use crate::encoder::SliceEncoder;
use crate::encoding::{ClassFormat, EncodingVersion};
use crate::error::{ProtocolError, StatusCode};
use crate::frame::{Frame, MessageType};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Request context: string key/value pairs sent with every request.
pub type Context = HashMap<String, String>;

/// Operation mode declared by the invoked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(ProtocolError::invalid(format!(
                "invalid operation mode {other}"
            ))),
        }
    }
}

/// Encapsulated operation arguments or results.
///
/// `payload` excludes the six-byte encapsulation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub encoding: EncodingVersion,
    pub payload: Bytes,
}

impl Encapsulation {
    pub fn new(encoding: EncodingVersion, payload: impl Into<Bytes>) -> Self {
        Self {
            encoding,
            payload: payload.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(EncodingVersion::V1_1, Bytes::new())
    }

    /// Encodes a payload with `f` in encoding 1.1.
    pub fn build<F>(f: F) -> Result<Self, ProtocolError>
    where
        F: FnOnce(&mut SliceEncoder) -> Result<(), ProtocolError>,
    {
        Self::build_with(ClassFormat::Compact, f)
    }

    /// Like [`build`](Self::build) with an explicit class format.
    pub fn build_with<F>(format: ClassFormat, f: F) -> Result<Self, ProtocolError>
    where
        F: FnOnce(&mut SliceEncoder) -> Result<(), ProtocolError>,
    {
        let mut encoder =
            SliceEncoder::with_encoding(EncodingVersion::V1_1).with_class_format(format);
        f(&mut encoder)?;
        Ok(Self::new(EncodingVersion::V1_1, encoder.freeze()))
    }

    /// Decoder over the payload in the payload's encoding.
    pub fn decoder(&self) -> SliceDecoder<'_> {
        SliceDecoder::with_encoding(&self.payload, self.encoding)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    fn encode(&self, encoder: &mut SliceEncoder) {
        encoder.encode_encapsulation(self.encoding, &self.payload);
    }

    fn decode(decoder: &mut SliceDecoder<'_>) -> Result<Self, ProtocolError> {
        let (encoding, payload) = decoder.decode_encapsulation()?;
        Ok(Self::new(encoding, Bytes::copy_from_slice(payload)))
    }
}

impl Default for Encapsulation {
    fn default() -> Self {
        Self::empty()
    }
}

fn encode_facet(encoder: &mut SliceEncoder, facet: &str) {
    if facet.is_empty() {
        encoder.encode_size(0);
    } else {
        encoder.encode_size(1);
        encoder.encode_string(facet);
    }
}

fn decode_facet(decoder: &mut SliceDecoder<'_>) -> Result<String, ProtocolError> {
    let mut facets = decoder.decode_sequence(1, |d| d.decode_string())?;
    match facets.len() {
        0 => Ok(String::new()),
        1 => Ok(facets.pop().unwrap_or_default()),
        n => Err(ProtocolError::invalid(format!("facet path has {n} elements"))),
    }
}

fn encode_identity(encoder: &mut SliceEncoder, identity: &Identity) {
    encoder.encode_string(&identity.name);
    encoder.encode_string(&identity.category);
}

fn decode_identity(decoder: &mut SliceDecoder<'_>) -> Result<Identity, ProtocolError> {
    let name = decoder.decode_string()?;
    let category = decoder.decode_string()?;
    Ok(Identity { name, category })
}

/// An operation invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 0 for oneway requests.
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub params: Encapsulation,
}

impl Request {
    pub fn new(identity: Identity, operation: impl Into<String>, params: Encapsulation) -> Self {
        Self {
            request_id: 0,
            identity,
            facet: String::new(),
            operation: operation.into(),
            mode: OperationMode::Normal,
            context: Context::new(),
            params,
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    fn encode_body(&self, encoder: &mut SliceEncoder) {
        encode_identity(encoder, &self.identity);
        encode_facet(encoder, &self.facet);
        encoder.encode_string(&self.operation);
        encoder.encode_u8(self.mode as u8);
        encoder.encode_dictionary(
            &self.context,
            |e, k| e.encode_string(k),
            |e, v| e.encode_string(v),
        );
        self.params.encode(encoder);
    }

    fn decode_body(decoder: &mut SliceDecoder<'_>, request_id: i32) -> Result<Self, ProtocolError> {
        let identity = decode_identity(decoder)?;
        if identity.is_null() {
            return Err(ProtocolError::invalid("request identity has an empty name"));
        }
        let facet = decode_facet(decoder)?;
        let operation = decoder.decode_string()?;
        let mode = OperationMode::from_u8(decoder.decode_u8()?)?;
        let context = decoder.decode_dictionary(2, |d| d.decode_string(), |d| d.decode_string())?;
        let params = Encapsulation::decode(decoder)?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }
}

/// Target of a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailed {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

/// Ice reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

/// Body of a reply, by status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ok(Encapsulation),
    UserException(Encapsulation),
    ObjectNotExist(RequestFailed),
    FacetNotExist(RequestFailed),
    OperationNotExist(RequestFailed),
    UnknownLocalException(String),
    UnknownUserException(String),
    UnknownException(String),
}

impl ReplyBody {
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            ReplyBody::UnknownLocalException(_) => ReplyStatus::UnknownLocalException,
            ReplyBody::UnknownUserException(_) => ReplyStatus::UnknownUserException,
            ReplyBody::UnknownException(_) => ReplyStatus::UnknownException,
        }
    }

    /// Protocol-neutral status of this reply.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReplyBody::Ok(_) => StatusCode::Ok,
            ReplyBody::UserException(_) => StatusCode::ApplicationError,
            ReplyBody::ObjectNotExist(_) | ReplyBody::FacetNotExist(_) => {
                StatusCode::ServiceNotFound
            }
            ReplyBody::OperationNotExist(_) => StatusCode::OperationNotFound,
            ReplyBody::UnknownLocalException(_)
            | ReplyBody::UnknownUserException(_)
            | ReplyBody::UnknownException(_) => StatusCode::UnhandledException,
        }
    }

    /// Human-readable message of the failure statuses.
    pub fn message(&self) -> Option<&str> {
        match self {
            ReplyBody::UnknownLocalException(m)
            | ReplyBody::UnknownUserException(m)
            | ReplyBody::UnknownException(m) => Some(m),
            _ => None,
        }
    }
}

/// Response to a twoway request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: i32,
    pub body: ReplyBody,
}

impl Reply {
    pub fn new(request_id: i32, body: ReplyBody) -> Self {
        Self { request_id, body }
    }

    fn encode_body(&self, encoder: &mut SliceEncoder) {
        encoder.encode_i32(self.request_id);
        encoder.encode_u8(self.body.status() as u8);
        match &self.body {
            ReplyBody::Ok(encaps) | ReplyBody::UserException(encaps) => encaps.encode(encoder),
            ReplyBody::ObjectNotExist(failed)
            | ReplyBody::FacetNotExist(failed)
            | ReplyBody::OperationNotExist(failed) => {
                encode_identity(encoder, &failed.identity);
                encode_facet(encoder, &failed.facet);
                encoder.encode_string(&failed.operation);
            }
            ReplyBody::UnknownLocalException(message)
            | ReplyBody::UnknownUserException(message)
            | ReplyBody::UnknownException(message) => encoder.encode_string(message),
        }
    }

    fn decode_body(decoder: &mut SliceDecoder<'_>) -> Result<Self, ProtocolError> {
        let request_id = decoder.decode_i32()?;
        let status = decoder.decode_u8()?;
        let body = match status {
            0 => ReplyBody::Ok(Encapsulation::decode(decoder)?),
            1 => ReplyBody::UserException(Encapsulation::decode(decoder)?),
            2..=4 => {
                let failed = RequestFailed {
                    identity: decode_identity(decoder)?,
                    facet: decode_facet(decoder)?,
                    operation: decoder.decode_string()?,
                };
                match status {
                    2 => ReplyBody::ObjectNotExist(failed),
                    3 => ReplyBody::FacetNotExist(failed),
                    _ => ReplyBody::OperationNotExist(failed),
                }
            }
            5 => ReplyBody::UnknownLocalException(decoder.decode_string()?),
            6 => ReplyBody::UnknownUserException(decoder.decode_string()?),
            7 => ReplyBody::UnknownException(decoder.decode_string()?),
            other => {
                tracing::debug!(status = other, "reply with unknown status");
                // The body layout is unknown; skip it.
                let rest = decoder.remaining();
                decoder.skip(rest)?;
                ReplyBody::UnknownException(format!("unknown reply status {other}"))
            }
        };
        Ok(Self { request_id, body })
    }
}

/// A complete Ice protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    BatchRequest(Vec<Request>),
    Reply(Reply),
    ValidateConnection,
    CloseConnection,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::BatchRequest(_) => MessageType::BatchRequest,
            Message::Reply(_) => MessageType::Reply,
            Message::ValidateConnection => MessageType::ValidateConnection,
            Message::CloseConnection => MessageType::CloseConnection,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut encoder = SliceEncoder::with_encoding(EncodingVersion::V1_0);
        match self {
            Message::Request(request) => {
                encoder.encode_i32(request.request_id);
                request.encode_body(&mut encoder);
            }
            Message::BatchRequest(requests) => {
                encoder.encode_i32(requests.len() as i32);
                for request in requests {
                    request.encode_body(&mut encoder);
                }
            }
            Message::Reply(reply) => reply.encode_body(&mut encoder),
            Message::ValidateConnection | Message::CloseConnection => {}
        }
        Frame::new(self.message_type(), encoder.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut decoder = SliceDecoder::with_encoding(&frame.body, EncodingVersion::V1_0);
        let message = match frame.message_type {
            MessageType::Request => {
                let request_id = decoder.decode_i32()?;
                if request_id < 0 {
                    return Err(ProtocolError::invalid(format!(
                        "negative request id {request_id}"
                    )));
                }
                Message::Request(Request::decode_body(&mut decoder, request_id)?)
            }
            MessageType::BatchRequest => {
                let count = decoder.decode_i32()?;
                if count < 0 {
                    return Err(ProtocolError::invalid(format!("negative batch count {count}")));
                }
                let mut requests = Vec::with_capacity((count as usize).min(decoder.remaining()));
                for _ in 0..count {
                    requests.push(Request::decode_body(&mut decoder, 0)?);
                }
                Message::BatchRequest(requests)
            }
            MessageType::Reply => Message::Reply(Reply::decode_body(&mut decoder)?),
            MessageType::ValidateConnection => Message::ValidateConnection,
            MessageType::CloseConnection => Message::CloseConnection,
        };
        if !decoder.is_at_end() {
            return Err(ProtocolError::invalid(format!(
                "{} trailing bytes in {:?} message",
                decoder.remaining(),
                frame.message_type
            )));
        }
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => write!(
                f,
                "request #{} {}:{}",
                r.request_id, r.identity, r.operation
            ),
            Message::BatchRequest(rs) => write!(f, "batch of {} requests", rs.len()),
            Message::Reply(r) => write!(f, "reply #{} {}", r.request_id, r.body.status_code()),
            Message::ValidateConnection => write!(f, "validate connection"),
            Message::CloseConnection => write!(f, "close connection"),
        }
    }
}
