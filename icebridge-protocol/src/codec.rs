//! Encoder and decoder for Ice frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Encodes messages into wire frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        message.to_frame().encode()
    }

    pub fn encode_frame(frame: &Frame) -> Result<BytesMut, ProtocolError> {
        frame.encode()
    }
}

/// Buffers incoming bytes and decodes complete frames.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(crate::MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Message::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
