//! Slice encoder.
//!
//! Writes little-endian primitives, sizes, strings, encapsulations, tagged
//! members and class/exception slices into a growable buffer. Class reference
//! ids and the type-id index table are scoped to the innermost open
//! encapsulation.

use crate::class::{flags, instance_key, ClassRef, SliceException};
use crate::encoding::{ClassFormat, EncodingVersion};
use crate::error::ProtocolError;
use crate::tag::{TagFormat, TAG_END_MARKER, TAG_SPILL};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Largest size the wire can carry.
pub const MAX_SIZE: usize = i32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceKind {
    Class,
    Exception,
}

struct InstanceFrame {
    kind: SliceKind,
    first_slice: bool,
    flags: u8,
    flags_pos: usize,
    size_pos: Option<usize>,
    table: Vec<ClassRef>,
    table_index: HashMap<usize, usize>,
}

impl InstanceFrame {
    fn new(kind: SliceKind) -> Self {
        Self {
            kind,
            first_slice: true,
            flags: 0,
            flags_pos: 0,
            size_pos: None,
            table: Vec::new(),
            table_index: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ClassEncodingState {
    instances: HashMap<usize, i32>,
    type_ids: HashMap<String, usize>,
    frames: Vec<InstanceFrame>,
    // Holds encoded instances so their addresses stay unique until the
    // encapsulation ends.
    retained: Vec<ClassRef>,
}

struct EncapsulationFrame {
    start: usize,
    encoding: EncodingVersion,
    format: ClassFormat,
    classes: ClassEncodingState,
}

/// Appends Slice-encoded data to a buffer.
pub struct SliceEncoder {
    buf: BytesMut,
    encoding: EncodingVersion,
    format: ClassFormat,
    classes: ClassEncodingState,
    encapsulations: Vec<EncapsulationFrame>,
}

impl SliceEncoder {
    pub fn new() -> Self {
        Self::with_encoding(EncodingVersion::V1_1)
    }

    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            encoding,
            format: ClassFormat::default(),
            classes: ClassEncodingState::default(),
            encapsulations: Vec::new(),
        }
    }

    /// Sets the class format used outside explicit encapsulations.
    pub fn with_class_format(mut self, format: ClassFormat) -> Self {
        self.format = format;
        self
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    pub fn class_format(&self) -> ClassFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    pub fn encode_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn encode_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn encode_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn encode_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn encode_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn encode_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn encode_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Writes a size: one byte up to 254, otherwise 255 then an int32.
    ///
    /// Sizes above `i32::MAX` have no wire form; use
    /// [`try_encode_size`](Self::try_encode_size) when the size is not
    /// already bounded by an in-memory buffer.
    pub fn encode_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_SIZE, "size {size} exceeds i32::MAX");
        if let Err(e) = self.try_encode_size(size) {
            tracing::error!("{}, writing i32::MAX", e);
            self.buf.put_u8(255);
            self.buf.put_i32_le(i32::MAX);
        }
    }

    /// Writes a size, failing if it does not fit in an int32.
    pub fn try_encode_size(&mut self, size: usize) -> Result<(), ProtocolError> {
        if size < 255 {
            self.buf.put_u8(size as u8);
            return Ok(());
        }
        let size = i32::try_from(size)
            .map_err(|_| ProtocolError::invalid(format!("size {size} exceeds i32::MAX")))?;
        self.buf.put_u8(255);
        self.buf.put_i32_le(size);
        Ok(())
    }

    pub fn encode_string(&mut self, value: &str) {
        self.encode_size(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    /// Writes a size-prefixed byte sequence.
    pub fn encode_bytes(&mut self, value: &[u8]) {
        self.encode_size(value.len());
        self.buf.put_slice(value);
    }

    /// Appends bytes with no prefix.
    pub fn encode_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Writes an enumerator as a size.
    pub fn encode_enum(&mut self, value: i32) -> Result<(), ProtocolError> {
        if value < 0 {
            return Err(ProtocolError::invalid(format!(
                "enumerator value {value} is negative"
            )));
        }
        self.encode_size(value as usize);
        Ok(())
    }

    pub(crate) fn reserve_i32(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.put_i32_le(0);
        pos
    }

    pub(crate) fn rewrite_i32(&mut self, pos: usize, value: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Writes a size-prefixed sequence with an infallible element encoder.
    pub fn encode_sequence<T, F>(&mut self, items: &[T], mut encode: F)
    where
        F: FnMut(&mut Self, &T),
    {
        self.encode_size(items.len());
        for item in items {
            encode(self, item);
        }
    }

    /// Writes a size-prefixed sequence with a fallible element encoder.
    pub fn try_encode_sequence<T, F>(&mut self, items: &[T], mut encode: F) -> Result<(), ProtocolError>
    where
        F: FnMut(&mut Self, &T) -> Result<(), ProtocolError>,
    {
        self.encode_size(items.len());
        for item in items {
            encode(self, item)?;
        }
        Ok(())
    }

    /// Writes a sequence of fixed-size elements, reserving its full length up
    /// front.
    pub fn encode_fixed_sequence<T, F>(&mut self, items: &[T], element_size: usize, mut encode: F)
    where
        F: FnMut(&mut Self, &T),
    {
        self.encode_size(items.len());
        self.buf.reserve(items.len().saturating_mul(element_size));
        for item in items {
            encode(self, item);
        }
    }

    /// Writes a size-prefixed list of key/value pairs.
    pub fn encode_dictionary<'a, K, V, I, FK, FV>(
        &mut self,
        entries: I,
        mut encode_key: FK,
        mut encode_value: FV,
    ) where
        K: 'a,
        V: 'a,
        I: IntoIterator<Item = (&'a K, &'a V)>,
        I::IntoIter: ExactSizeIterator,
        FK: FnMut(&mut Self, &K),
        FV: FnMut(&mut Self, &V),
    {
        let entries = entries.into_iter();
        self.encode_size(entries.len());
        for (key, value) in entries {
            encode_key(self, key);
            encode_value(self, value);
        }
    }

    // =========================================================================
    // Encapsulations
    // =========================================================================

    /// Opens an encapsulation using the current encoding and class format.
    pub fn start_encapsulation(&mut self) {
        self.start_encapsulation_with(self.encoding, self.format);
    }

    /// Opens an encapsulation. The size is backpatched by
    /// [`end_encapsulation`](Self::end_encapsulation).
    pub fn start_encapsulation_with(&mut self, encoding: EncodingVersion, format: ClassFormat) {
        let start = self.reserve_i32();
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.encapsulations.push(EncapsulationFrame {
            start,
            encoding: self.encoding,
            format: self.format,
            classes: std::mem::take(&mut self.classes),
        });
        self.encoding = encoding;
        self.format = format;
    }

    pub fn end_encapsulation(&mut self) -> Result<(), ProtocolError> {
        let frame = self
            .encapsulations
            .pop()
            .ok_or_else(|| ProtocolError::invalid("end_encapsulation without start_encapsulation"))?;
        let size = self.buf.len() - frame.start;
        self.rewrite_i32(frame.start, size as i32);
        self.encoding = frame.encoding;
        self.format = frame.format;
        self.classes = frame.classes;
        Ok(())
    }

    /// Writes an encapsulation holding no data.
    pub fn encode_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.encode_encapsulation(encoding, &[]);
    }

    /// Writes an encapsulation around already-encoded bytes.
    pub fn encode_encapsulation(&mut self, encoding: EncodingVersion, payload: &[u8]) {
        self.encode_i32((payload.len() + 6) as i32);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.buf.put_slice(payload);
    }

    // =========================================================================
    // Tagged members
    // =========================================================================

    /// Writes a tagged member. Nothing is written when `value` is `None` or
    /// when the encoding predates tags.
    pub fn encode_tagged<T, F>(
        &mut self,
        tag: i32,
        format: TagFormat,
        value: Option<&T>,
        encode: F,
    ) -> Result<(), ProtocolError>
    where
        T: ?Sized,
        F: FnOnce(&mut Self, &T) -> Result<(), ProtocolError>,
    {
        let Some(value) = value else {
            return Ok(());
        };
        if !self.encoding.supports_tags() {
            return Ok(());
        }
        if format == TagFormat::Class {
            return Err(ProtocolError::invalid(format!(
                "tag {tag}: tagged class members are not supported"
            )));
        }
        if tag < 0 {
            return Err(ProtocolError::invalid(format!("invalid tag {tag}")));
        }

        self.encode_tag_marker(tag, format);
        match format {
            TagFormat::VSize => {
                let mut scratch = SliceEncoder::with_encoding(self.encoding);
                encode(&mut scratch, value)?;
                self.try_encode_size(scratch.len())?;
                self.buf.put_slice(scratch.as_bytes());
            }
            TagFormat::FSize => {
                let pos = self.reserve_i32();
                encode(self, value)?;
                let size = self.buf.len() - pos - 4;
                self.rewrite_i32(pos, size as i32);
            }
            _ => encode(self, value)?,
        }

        if let Some(frame) = self.classes.frames.last_mut() {
            frame.flags |= flags::HAS_OPTIONAL_MEMBERS;
        }
        Ok(())
    }

    /// Writes the marker closing the tagged members of a slice.
    pub fn encode_tag_end(&mut self) {
        self.buf.put_u8(TAG_END_MARKER);
    }

    fn encode_tag_marker(&mut self, tag: i32, format: TagFormat) {
        if tag < TAG_SPILL {
            self.buf.put_u8(((tag as u8) << 3) | format.wire_bits());
        } else {
            self.buf.put_u8(((TAG_SPILL as u8) << 3) | format.wire_bits());
            self.encode_size(tag as usize);
        }
    }

    // =========================================================================
    // Classes and exceptions
    // =========================================================================

    /// Writes a class reference. `None` encodes null.
    ///
    /// Inside a slice in sliced format the reference is an index into the
    /// slice's indirection table, written after the slice body.
    pub fn encode_class(&mut self, value: Option<&ClassRef>) -> Result<(), ProtocolError> {
        if !self.encoding.supports_tags() {
            return Err(ProtocolError::UnsupportedEncoding(self.encoding));
        }
        let Some(value) = value else {
            self.encode_size(0);
            return Ok(());
        };

        if self.format == ClassFormat::Sliced {
            if let Some(frame) = self.classes.frames.last_mut() {
                let key = instance_key(value);
                let index = match frame.table_index.get(&key) {
                    Some(index) => *index,
                    None => {
                        frame.table.push(value.clone());
                        let index = frame.table.len();
                        frame.table_index.insert(key, index);
                        index
                    }
                };
                self.encode_size(index);
                return Ok(());
            }
        }

        self.encode_instance(value)
    }

    fn encode_instance(&mut self, value: &ClassRef) -> Result<(), ProtocolError> {
        let key = instance_key(value);
        if let Some(id) = self.classes.instances.get(&key) {
            self.encode_size(*id as usize);
            return Ok(());
        }

        // Ids start at 2; 1 announces an inline instance.
        let id = self.classes.instances.len() as i32 + 2;
        self.classes.instances.insert(key, id);
        self.classes.retained.push(value.clone());
        self.encode_size(1);

        self.classes.frames.push(InstanceFrame::new(SliceKind::Class));
        let result = value.lock().encode(self);
        self.classes.frames.pop();
        result
    }

    /// Writes a user exception. Exceptions always use the sliced format.
    pub fn encode_exception(&mut self, exception: &dyn SliceException) -> Result<(), ProtocolError> {
        if !self.encoding.supports_tags() {
            return Err(ProtocolError::UnsupportedEncoding(self.encoding));
        }
        let saved = self.format;
        self.format = ClassFormat::Sliced;
        self.classes
            .frames
            .push(InstanceFrame::new(SliceKind::Exception));
        let result = exception.encode(self);
        self.classes.frames.pop();
        self.format = saved;
        result
    }

    /// Opens the next slice of the instance being encoded.
    ///
    /// Class slices carry their type id only on the first slice in compact
    /// format and on every slice in sliced format. `compact_id` replaces the
    /// type id string when the type declares one.
    pub fn start_slice(&mut self, type_id: &str, compact_id: Option<i32>, last: bool) {
        let sliced = self.format == ClassFormat::Sliced;
        let Some((kind, first_slice)) = self
            .classes
            .frames
            .last()
            .map(|frame| (frame.kind, frame.first_slice))
        else {
            return;
        };

        let mut slice_flags = 0u8;
        if sliced {
            slice_flags |= flags::HAS_SLICE_SIZE;
        }
        if last {
            slice_flags |= flags::IS_LAST_SLICE;
        }

        let flags_pos = self.buf.len();
        self.buf.put_u8(0);

        match kind {
            SliceKind::Class if sliced || first_slice => {
                if let Some(compact_id) = compact_id {
                    slice_flags |= flags::TYPE_ID_COMPACT;
                    self.encode_size(compact_id.max(0) as usize);
                } else if let Some(index) = self.classes.type_ids.get(type_id).copied() {
                    slice_flags |= flags::TYPE_ID_INDEX;
                    self.encode_size(index);
                } else {
                    let index = self.classes.type_ids.len() + 1;
                    self.classes.type_ids.insert(type_id.to_string(), index);
                    slice_flags |= flags::TYPE_ID_STRING;
                    self.encode_string(type_id);
                }
            }
            SliceKind::Class => {}
            SliceKind::Exception => self.encode_string(type_id),
        }

        let size_pos = if slice_flags & flags::HAS_SLICE_SIZE != 0 {
            Some(self.reserve_i32())
        } else {
            None
        };

        if let Some(frame) = self.classes.frames.last_mut() {
            frame.first_slice = false;
            frame.flags = slice_flags;
            frame.flags_pos = flags_pos;
            frame.size_pos = size_pos;
        }
    }

    /// Closes the current slice: tagged-member end marker, slice size,
    /// indirection table and the final flags byte.
    pub fn end_slice(&mut self) -> Result<(), ProtocolError> {
        let frame = self
            .classes
            .frames
            .last_mut()
            .ok_or_else(|| ProtocolError::invalid("end_slice outside of an instance"))?;
        let mut slice_flags = frame.flags;
        let flags_pos = frame.flags_pos;
        let size_pos = frame.size_pos;
        let table = std::mem::take(&mut frame.table);
        frame.table_index.clear();

        if slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            self.encode_tag_end();
        }

        if let Some(pos) = size_pos {
            let size = self.buf.len() - pos;
            self.rewrite_i32(pos, size as i32);
        }

        if !table.is_empty() {
            slice_flags |= flags::HAS_INDIRECTION_TABLE;
            self.encode_size(table.len());
            for value in &table {
                self.encode_instance(value)?;
            }
        }

        self.buf[flags_pos] = slice_flags;
        Ok(())
    }
}

impl Default for SliceEncoder {
    fn default() -> Self {
        Self::new()
    }
}
