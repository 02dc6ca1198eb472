//! # icebridge-protocol
//!
//! Slice encoding and Ice protocol framing for icebridge.
//!
//! This crate provides:
//! - Slice primitives, sizes, strings, enums and containers
//! - Encapsulations and tagged (optional) fields
//! - Class graphs with reference sharing and exceptions with slicing
//! - Service addresses in structured, stringified and URI forms
//! - Ice 1.0 message frames and a buffering frame codec

pub mod address;
pub mod class;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod message;
pub mod tag;

pub use address::{
    Endpoint, Identity, InvocationMode, IpEndpoint, Location, OpaqueEndpoint, Proxy,
    ServerAddress, ServiceAddress, Transport,
};
pub use class::{
    downcast, new_class, same_instance, Activator, ClassRef, DecodedException, SliceClass,
    SliceException, SlicingPolicy, TypeRegistry, UnknownSlicedValue,
};
pub use codec::{Decoder, Encoder};
pub use decoder::{SliceDecoder, DEFAULT_CLASS_GRAPH_DEPTH_MAX};
pub use encoder::SliceEncoder;
pub use encoding::{ClassFormat, EncodingVersion, ProtocolVersion};
pub use error::{ProtocolError, StatusCode};
pub use frame::{Frame, MessageType, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    Context, Encapsulation, Message, OperationMode, Reply, ReplyBody, ReplyStatus, Request,
    RequestFailed,
};
pub use tag::TagFormat;

/// Protocol spoken on the wire.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::ICE;

/// Encoding used for every encapsulation this crate writes.
pub const ENCODING_VERSION: EncodingVersion = EncodingVersion::V1_1;

/// Default port for icebridge servers.
pub const DEFAULT_PORT: u16 = 4061;

/// Default maximum incoming frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
