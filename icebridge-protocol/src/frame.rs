//! Ice protocol message framing.
//!
//! Frame layout (14 bytes header + body), all integers little-endian:
//!
//! ```text
//! +--------+----------+----------+------+-------------+---------+
//! | magic  | protocol | encoding | type | compression |  size   |
//! | 4 bytes| 2 bytes  | 2 bytes  |  1   |      1      | 4 bytes |
//! +--------+----------+----------+------+-------------+---------+
//! | body (size - 14 bytes)                                      |
//! +-------------------------------------------------------------+
//! ```
//!
//! `size` counts the header. ValidateConnection and CloseConnection frames
//! have no body.

use crate::encoding::{EncodingVersion, ProtocolVersion};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying Ice frames: "IceP"
pub const MAGIC: [u8; 4] = *b"IceP";

/// Size of the fixed frame header in bytes (4+2+2+1+1+4 = 14).
pub const FRAME_HEADER_SIZE: usize = 14;

/// Encoding of the message header fields themselves.
const HEADER_ENCODING: EncodingVersion = EncodingVersion::V1_0;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_SUPPORTED: u8 = 1;
const COMPRESSION_APPLIED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    BatchRequest = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::BatchRequest),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Control frames carry no body.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::ValidateConnection | MessageType::CloseConnection
        )
    }
}

/// A parsed Ice frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub body: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, body: Bytes) -> Self {
        Self { message_type, body }
    }

    pub fn validate_connection() -> Self {
        Self::new(MessageType::ValidateConnection, Bytes::new())
    }

    pub fn close_connection() -> Self {
        Self::new(MessageType::CloseConnection, Bytes::new())
    }

    /// Total size on the wire, header included.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let total_size = self.wire_size();
        if total_size > i32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: i32::MAX as usize,
            });
        }
        if self.message_type.is_control() && !self.body.is_empty() {
            return Err(ProtocolError::invalid(format!(
                "{:?} frame cannot carry a body",
                self.message_type
            )));
        }

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_slice(&MAGIC);
        buf.put_u8(crate::PROTOCOL_VERSION.major);
        buf.put_u8(crate::PROTOCOL_VERSION.minor);
        buf.put_u8(HEADER_ENCODING.major);
        buf.put_u8(HEADER_ENCODING.minor);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(COMPRESSION_NONE);
        buf.put_i32_le(total_size as i32);
        buf.put_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let protocol = ProtocolVersion::new(buf[4], buf[5]);
        if protocol != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProtocol(protocol));
        }

        let encoding = EncodingVersion::new(buf[6], buf[7]);
        if encoding != HEADER_ENCODING {
            return Err(ProtocolError::UnsupportedEncoding(encoding));
        }

        let message_type = MessageType::from_u8(buf[8])?;
        match buf[9] {
            COMPRESSION_NONE | COMPRESSION_SUPPORTED => {}
            COMPRESSION_APPLIED => return Err(ProtocolError::CompressionNotSupported),
            other => {
                return Err(ProtocolError::invalid(format!(
                    "invalid compression status {other}"
                )))
            }
        }

        let size = i32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if size < FRAME_HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidMessageSize(size));
        }
        let size = size as usize;
        if size > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }
        if message_type.is_control() && size != FRAME_HEADER_SIZE {
            return Err(ProtocolError::InvalidMessageSize(size as i32));
        }

        if buf.len() < size {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(size - FRAME_HEADER_SIZE).freeze();

        Ok(Some(Self { message_type, body }))
    }
}
