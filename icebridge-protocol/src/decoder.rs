//! Slice decoder.
//!
//! Reads from a borrowed buffer. Every read is bounds-checked against the
//! innermost open encapsulation, so a corrupt size can never read past the
//! data it was declared in.
//!
//! Class slices in sliced format carry their indirection table after the
//! slice body. When a slice is opened the decoder jumps ahead, decodes the
//! table, and returns to the body, so references in the body resolve
//! immediately.

use crate::class::{
    flags, new_class, Activator, ClassRef, DecodedException, SlicingPolicy, UnknownSlicedValue,
};
use crate::encoder::SliceKind;
use crate::encoding::EncodingVersion;
use crate::error::ProtocolError;
use crate::tag::{TagFormat, TAG_END_MARKER, TAG_SPILL};
use std::collections::HashMap;
use std::hash::Hash;

/// Default bound on nested class instances.
pub const DEFAULT_CLASS_GRAPH_DEPTH_MAX: usize = 100;

struct InstanceFrame {
    kind: SliceKind,
    flags: u8,
    type_id: Option<String>,
    slice_end: Option<usize>,
    table: Vec<Option<ClassRef>>,
    table_end: Option<usize>,
    skip_first_slice: bool,
}

impl InstanceFrame {
    fn new(kind: SliceKind) -> Self {
        Self {
            kind,
            flags: 0,
            type_id: None,
            slice_end: None,
            table: Vec::new(),
            table_end: None,
            skip_first_slice: false,
        }
    }
}

struct ClassDecodingState {
    instances: HashMap<i32, ClassRef>,
    last_id: i32,
    type_ids: Vec<String>,
    frames: Vec<InstanceFrame>,
    depth: usize,
}

impl Default for ClassDecodingState {
    fn default() -> Self {
        Self {
            instances: HashMap::new(),
            last_id: 1,
            type_ids: Vec::new(),
            frames: Vec::new(),
            depth: 0,
        }
    }
}

struct EncapsulationFrame {
    end: usize,
    encoding: EncodingVersion,
    classes: ClassDecodingState,
}

/// Reads Slice-encoded data from a byte slice.
pub struct SliceDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    encoding: EncodingVersion,
    activator: Option<&'a dyn Activator>,
    policy: SlicingPolicy,
    depth_max: usize,
    classes: ClassDecodingState,
    encapsulations: Vec<EncapsulationFrame>,
}

impl<'a> SliceDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_encoding(data, EncodingVersion::V1_1)
    }

    pub fn with_encoding(data: &'a [u8], encoding: EncodingVersion) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
            encoding,
            activator: None,
            policy: SlicingPolicy::default(),
            depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            classes: ClassDecodingState::default(),
            encapsulations: Vec::new(),
        }
    }

    pub fn with_activator(mut self, activator: &'a dyn Activator) -> Self {
        self.activator = Some(activator);
        self
    }

    pub fn with_slicing_policy(mut self, policy: SlicingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_class_graph_depth_max(mut self, depth_max: usize) -> Self {
        self.depth_max = depth_max;
        self
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the end of the current encapsulation.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if n > self.remaining() {
            return Err(ProtocolError::TruncatedData {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    pub fn decode_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.decode_u8()? != 0)
    }

    pub fn decode_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn decode_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn decode_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn decode_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn decode_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn decode_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn decode_size(&mut self) -> Result<usize, ProtocolError> {
        let first = self.decode_u8()?;
        if first < 255 {
            return Ok(first as usize);
        }
        let size = self.decode_i32()?;
        if size < 0 {
            return Err(ProtocolError::invalid(format!("negative size {size}")));
        }
        Ok(size as usize)
    }

    pub fn decode_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.decode_size()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a size-prefixed byte sequence without copying.
    pub fn decode_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.decode_size()?;
        self.take(len)
    }

    pub fn decode_raw(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(n)
    }

    /// Reads an enumerator and checks it against the largest declared value.
    pub fn decode_enum(&mut self, max_value: i32) -> Result<i32, ProtocolError> {
        let value = self.decode_size()?;
        if value > max_value.max(0) as usize {
            return Err(ProtocolError::invalid(format!(
                "enumerator value {value} out of range"
            )));
        }
        Ok(value as i32)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    fn check_count(&self, count: usize, min_element_size: usize) -> Result<(), ProtocolError> {
        let needed = count.saturating_mul(min_element_size);
        if needed > self.remaining() {
            return Err(ProtocolError::TruncatedData {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Reads a size-prefixed sequence. `min_element_size` bounds the count
    /// against the bytes left before allocating.
    pub fn decode_sequence<T, F>(
        &mut self,
        min_element_size: usize,
        mut decode: F,
    ) -> Result<Vec<T>, ProtocolError>
    where
        F: FnMut(&mut Self) -> Result<T, ProtocolError>,
    {
        let count = self.decode_size()?;
        self.check_count(count, min_element_size)?;
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(decode(self)?);
        }
        Ok(items)
    }

    /// Reads a sequence whose elements all take `element_size` bytes.
    pub fn decode_fixed_sequence<T, F>(
        &mut self,
        element_size: usize,
        decode: F,
    ) -> Result<Vec<T>, ProtocolError>
    where
        F: FnMut(&mut Self) -> Result<T, ProtocolError>,
    {
        self.decode_sequence(element_size, decode)
    }

    /// Reads a size-prefixed dictionary. Later duplicates replace earlier
    /// entries.
    pub fn decode_dictionary<K, V, FK, FV>(
        &mut self,
        min_entry_size: usize,
        mut decode_key: FK,
        mut decode_value: FV,
    ) -> Result<HashMap<K, V>, ProtocolError>
    where
        K: Eq + Hash,
        FK: FnMut(&mut Self) -> Result<K, ProtocolError>,
        FV: FnMut(&mut Self) -> Result<V, ProtocolError>,
    {
        let count = self.decode_size()?;
        self.check_count(count, min_entry_size)?;
        let mut entries = HashMap::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let key = decode_key(self)?;
            let value = decode_value(self)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    // =========================================================================
    // Encapsulations
    // =========================================================================

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion), ProtocolError> {
        let start = self.pos;
        let size = self.decode_i32()?;
        if size < 6 {
            return Err(ProtocolError::invalid(format!(
                "encapsulation size {size} is smaller than its header"
            )));
        }
        let end = start + size as usize;
        if end > self.end {
            return Err(ProtocolError::TruncatedData {
                needed: size as usize,
                remaining: self.end - start,
            });
        }
        let encoding = EncodingVersion::new(self.decode_u8()?, self.decode_u8()?);
        Ok((end, encoding))
    }

    /// Opens an encapsulation and switches to its encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion, ProtocolError> {
        let (end, encoding) = self.read_encapsulation_header()?;
        if !encoding.is_supported() {
            return Err(ProtocolError::UnsupportedEncoding(encoding));
        }
        self.encapsulations.push(EncapsulationFrame {
            end: self.end,
            encoding: self.encoding,
            classes: std::mem::take(&mut self.classes),
        });
        self.end = end;
        self.encoding = encoding;
        Ok(encoding)
    }

    /// Skips trailing tagged members and requires the encapsulation to be
    /// fully consumed.
    pub fn end_encapsulation(&mut self) -> Result<(), ProtocolError> {
        if self.encapsulations.is_empty() {
            return Err(ProtocolError::invalid(
                "end_encapsulation without start_encapsulation",
            ));
        }
        if self.encoding.supports_tags() {
            self.skip_tagged_members()?;
        }
        if self.pos != self.end {
            return Err(ProtocolError::invalid(format!(
                "{} bytes left in encapsulation",
                self.end - self.pos
            )));
        }
        if let Some(frame) = self.encapsulations.pop() {
            self.end = frame.end;
            self.encoding = frame.encoding;
            self.classes = frame.classes;
        }
        Ok(())
    }

    /// Reads an encapsulation and returns its encoding and payload without
    /// interpreting it.
    pub fn decode_encapsulation(&mut self) -> Result<(EncodingVersion, &'a [u8]), ProtocolError> {
        let (end, encoding) = self.read_encapsulation_header()?;
        let payload = self.take(end - self.pos)?;
        Ok((encoding, payload))
    }

    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion, ProtocolError> {
        self.decode_encapsulation().map(|(encoding, _)| encoding)
    }

    // =========================================================================
    // Tagged members
    // =========================================================================

    /// Reads the tagged member `tag` if present.
    ///
    /// Members with lower tags are skipped. A member with a higher tag, the
    /// end marker or the end of the data means the tag is absent and nothing
    /// is consumed.
    pub fn decode_tagged<T, F>(
        &mut self,
        tag: i32,
        format: TagFormat,
        decode: F,
    ) -> Result<Option<T>, ProtocolError>
    where
        F: FnOnce(&mut Self) -> Result<T, ProtocolError>,
    {
        if !self.find_tag(tag, format)? {
            return Ok(None);
        }
        match format {
            TagFormat::VSize => {
                self.decode_size()?;
            }
            TagFormat::FSize => {
                self.decode_i32()?;
            }
            _ => {}
        }
        decode(self).map(Some)
    }

    fn find_tag(&mut self, tag: i32, format: TagFormat) -> Result<bool, ProtocolError> {
        if !self.encoding.supports_tags() {
            return Ok(false);
        }
        if let Some(frame) = self.classes.frames.last() {
            if frame.flags & flags::HAS_OPTIONAL_MEMBERS == 0 {
                return Ok(false);
            }
        }

        loop {
            if self.is_at_end() {
                return Ok(false);
            }
            let start = self.pos;
            let marker = self.decode_u8()?;
            if marker == TAG_END_MARKER {
                self.pos = start;
                return Ok(false);
            }
            let found = TagFormat::from_bits(marker);
            let mut found_tag = (marker >> 3) as i32;
            if found_tag == TAG_SPILL {
                let spilled = self.decode_size()?;
                found_tag = i32::try_from(spilled)
                    .map_err(|_| ProtocolError::invalid(format!("tag {spilled} out of range")))?;
            }

            if found_tag > tag {
                self.pos = start;
                return Ok(false);
            }
            if found_tag < tag {
                self.skip_tagged(found)?;
                continue;
            }
            if found.wire_bits() != format.wire_bits() {
                return Err(ProtocolError::InvalidTagFormat {
                    tag,
                    expected: format,
                    found,
                });
            }
            return Ok(true);
        }
    }

    fn skip_tagged(&mut self, format: TagFormat) -> Result<(), ProtocolError> {
        match format {
            TagFormat::F1 => self.skip(1),
            TagFormat::F2 => self.skip(2),
            TagFormat::F4 => self.skip(4),
            TagFormat::F8 => self.skip(8),
            TagFormat::Size => self.decode_size().map(|_| ()),
            TagFormat::VSize | TagFormat::OVSize => {
                let n = self.decode_size()?;
                self.skip(n)
            }
            TagFormat::FSize => {
                let n = self.decode_i32()?;
                if n < 0 {
                    return Err(ProtocolError::invalid(format!("negative tagged size {n}")));
                }
                self.skip(n as usize)
            }
            TagFormat::Class => self.decode_class().map(|_| ()),
        }
    }

    /// Skips tagged members up to the end marker. Outside a slice the end of
    /// the encapsulation also terminates the list.
    pub fn skip_tagged_members(&mut self) -> Result<(), ProtocolError> {
        let in_slice = !self.classes.frames.is_empty();
        loop {
            if !in_slice && self.is_at_end() {
                return Ok(());
            }
            let marker = self.decode_u8()?;
            if marker == TAG_END_MARKER {
                return Ok(());
            }
            if (marker >> 3) as i32 == TAG_SPILL {
                self.decode_size()?;
            }
            self.skip_tagged(TagFormat::from_bits(marker))?;
        }
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Reads a class reference. Returns `None` for null.
    pub fn decode_class(&mut self) -> Result<Option<ClassRef>, ProtocolError> {
        if !self.encoding.supports_tags() {
            return Err(ProtocolError::UnsupportedEncoding(self.encoding));
        }
        let value = self.decode_size()?;

        if let Some(frame) = self.classes.frames.last() {
            if frame.flags & flags::HAS_INDIRECTION_TABLE != 0 {
                if value == 0 {
                    return Ok(None);
                }
                return match frame.table.get(value - 1) {
                    Some(Some(instance)) => Ok(Some(instance.clone())),
                    Some(None) => Err(ProtocolError::UnresolvedReference(value as i32)),
                    None => Err(ProtocolError::invalid(format!(
                        "indirection index {value} out of range"
                    ))),
                };
            }
        }

        let id = i32::try_from(value)
            .map_err(|_| ProtocolError::invalid(format!("instance id {value} out of range")))?;
        self.decode_instance(id)
    }

    fn decode_instance(&mut self, id: i32) -> Result<Option<ClassRef>, ProtocolError> {
        match id {
            0 => return Ok(None),
            1 => {}
            _ => {
                return self
                    .classes
                    .instances
                    .get(&id)
                    .cloned()
                    .map(Some)
                    .ok_or(ProtocolError::UnresolvedReference(id));
            }
        }

        if self.classes.depth >= self.depth_max {
            return Err(ProtocolError::invalid(format!(
                "class graph depth exceeds {}",
                self.depth_max
            )));
        }

        self.classes.last_id += 1;
        let id = self.classes.last_id;
        self.classes.depth += 1;
        self.classes.frames.push(InstanceFrame::new(SliceKind::Class));
        let result = self.decode_instance_slices(id);
        self.classes.frames.pop();
        self.classes.depth -= 1;
        result.map(Some)
    }

    fn decode_instance_slices(&mut self, id: i32) -> Result<ClassRef, ProtocolError> {
        self.read_slice_header()?;
        let most_derived = self.current_frame()?.type_id.clone().unwrap_or_default();

        loop {
            let frame = self.current_frame()?;
            let last = frame.flags & flags::IS_LAST_SLICE != 0;
            let created = match (&frame.type_id, self.activator) {
                (Some(type_id), Some(activator)) => activator.create_class(type_id),
                _ => None,
            };

            if let Some(instance) = created {
                self.current_frame_mut()?.skip_first_slice = true;
                self.classes.instances.insert(id, instance.clone());
                instance.lock().decode(self)?;
                return Ok(instance);
            }

            if self.policy == SlicingPolicy::Strict {
                return Err(ProtocolError::UnknownClass(most_derived));
            }

            tracing::trace!(most_derived = %most_derived, "slicing off unknown class slice");
            self.skip_slice(&most_derived)?;
            if last {
                break;
            }
            self.read_slice_header()?;
        }

        let placeholder = new_class(UnknownSlicedValue::new(most_derived));
        self.classes.instances.insert(id, placeholder.clone());
        Ok(placeholder)
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Reads a user exception, slicing it down to the most-derived type the
    /// activator knows.
    pub fn decode_exception(&mut self) -> Result<DecodedException, ProtocolError> {
        if !self.encoding.supports_tags() {
            return Err(ProtocolError::UnsupportedEncoding(self.encoding));
        }
        self.classes
            .frames
            .push(InstanceFrame::new(SliceKind::Exception));
        let result = self.decode_exception_slices();
        self.classes.frames.pop();
        result
    }

    fn decode_exception_slices(&mut self) -> Result<DecodedException, ProtocolError> {
        self.read_slice_header()?;
        let most_derived = self.current_frame()?.type_id.clone().unwrap_or_default();

        loop {
            let frame = self.current_frame()?;
            let last = frame.flags & flags::IS_LAST_SLICE != 0;
            let created = match (&frame.type_id, self.activator) {
                (Some(type_id), Some(activator)) => activator.create_exception(type_id),
                _ => None,
            };

            if let Some(mut exception) = created {
                self.current_frame_mut()?.skip_first_slice = true;
                exception.decode(self)?;
                return Ok(DecodedException::Known(exception));
            }

            self.skip_slice(&most_derived)?;
            if last {
                return Ok(DecodedException::Unknown {
                    type_id: most_derived,
                });
            }
            self.read_slice_header()?;
        }
    }

    // =========================================================================
    // Slices
    // =========================================================================

    fn current_frame(&self) -> Result<&InstanceFrame, ProtocolError> {
        self.classes
            .frames
            .last()
            .ok_or_else(|| ProtocolError::invalid("slice access outside of an instance"))
    }

    fn current_frame_mut(&mut self) -> Result<&mut InstanceFrame, ProtocolError> {
        self.classes
            .frames
            .last_mut()
            .ok_or_else(|| ProtocolError::invalid("slice access outside of an instance"))
    }

    fn read_slice_header(&mut self) -> Result<(), ProtocolError> {
        let kind = self.current_frame()?.kind;
        let slice_flags = self.decode_u8()?;

        let type_id = match kind {
            SliceKind::Exception => Some(self.decode_string()?),
            SliceKind::Class => match slice_flags & flags::TYPE_ID_MASK {
                flags::TYPE_ID_STRING => {
                    let type_id = self.decode_string()?;
                    self.classes.type_ids.push(type_id.clone());
                    Some(type_id)
                }
                flags::TYPE_ID_INDEX => {
                    let index = self.decode_size()?;
                    let type_id = index
                        .checked_sub(1)
                        .and_then(|i| self.classes.type_ids.get(i))
                        .cloned()
                        .ok_or_else(|| {
                            ProtocolError::invalid(format!("unknown type id index {index}"))
                        })?;
                    Some(type_id)
                }
                flags::TYPE_ID_COMPACT => {
                    let compact_id = self.decode_size()? as i32;
                    let resolved = self
                        .activator
                        .and_then(|activator| activator.resolve_compact_id(compact_id));
                    Some(resolved.unwrap_or_else(|| compact_id.to_string()))
                }
                _ => None,
            },
        };

        let slice_end = if slice_flags & flags::HAS_SLICE_SIZE != 0 {
            let size_pos = self.pos;
            let size = self.decode_i32()?;
            if size < 4 {
                return Err(ProtocolError::invalid(format!("invalid slice size {size}")));
            }
            let end = size_pos + size as usize;
            if end > self.end {
                return Err(ProtocolError::TruncatedData {
                    needed: size as usize,
                    remaining: self.end - size_pos,
                });
            }
            Some(end)
        } else {
            None
        };

        if slice_flags & flags::HAS_INDIRECTION_TABLE != 0 && slice_end.is_none() {
            return Err(ProtocolError::invalid(
                "indirection table in a slice without a size",
            ));
        }

        let frame = self.current_frame_mut()?;
        frame.flags = slice_flags;
        frame.type_id = type_id;
        frame.slice_end = slice_end;
        frame.table.clear();
        frame.table_end = None;
        Ok(())
    }

    /// Decodes the indirection table that follows the current slice body and
    /// returns to the body. References that cannot be resolved yet are kept
    /// as holes and fail only if the body uses them.
    fn read_indirection_table(&mut self) -> Result<(), ProtocolError> {
        let slice_end = self
            .current_frame()?
            .slice_end
            .ok_or_else(|| ProtocolError::invalid("indirection table in a slice without a size"))?;
        let body = self.pos;
        self.pos = slice_end;

        let count = self.decode_size()?;
        self.check_count(count, 1)?;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.decode_size()?;
            let id = i32::try_from(id)
                .map_err(|_| ProtocolError::invalid(format!("instance id {id} out of range")))?;
            match self.decode_instance(id) {
                Ok(instance) => table.push(instance),
                Err(ProtocolError::UnresolvedReference(_)) => table.push(None),
                Err(e) => return Err(e),
            }
        }

        let table_end = self.pos;
        self.pos = body;
        let frame = self.current_frame_mut()?;
        frame.table = table;
        frame.table_end = Some(table_end);
        Ok(())
    }

    fn skip_slice(&mut self, most_derived: &str) -> Result<(), ProtocolError> {
        let frame = self.current_frame()?;
        let Some(slice_end) = frame.slice_end else {
            return Err(ProtocolError::UnknownClass(most_derived.to_string()));
        };
        if frame.flags & flags::HAS_INDIRECTION_TABLE != 0 {
            self.read_indirection_table()?;
            self.pos = self.current_frame()?.table_end.unwrap_or(slice_end);
        } else {
            self.pos = slice_end;
        }
        Ok(())
    }

    /// Opens the next slice of the instance being decoded.
    pub fn start_slice(&mut self) -> Result<(), ProtocolError> {
        let frame = self.current_frame_mut()?;
        if frame.skip_first_slice {
            frame.skip_first_slice = false;
        } else {
            self.read_slice_header()?;
        }
        if self.current_frame()?.flags & flags::HAS_INDIRECTION_TABLE != 0 {
            self.read_indirection_table()?;
        }
        Ok(())
    }

    /// Closes the current slice, skipping unread tagged members, and moves
    /// past its indirection table.
    pub fn end_slice(&mut self) -> Result<(), ProtocolError> {
        let frame = self.current_frame()?;
        let slice_flags = frame.flags;
        let next = frame.table_end.or(frame.slice_end);

        if slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            self.skip_tagged_members()?;
        }
        if let Some(next) = next {
            if self.pos > next {
                return Err(ProtocolError::invalid("slice body overran its size"));
            }
            self.pos = next;
        }

        let frame = self.current_frame_mut()?;
        frame.table.clear();
        frame.table_end = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{downcast, same_instance, SliceClass, SliceException, TypeRegistry};
    use crate::encoder::SliceEncoder;
    use crate::encoding::ClassFormat;
    use std::any::Any;
    use std::fmt;

    // Base <- Middle <- Leaf. Leaf is never registered on the reading side in
    // slicing tests.
    #[derive(Debug, Default)]
    struct Base {
        name: String,
        next: Option<ClassRef>,
    }

    impl Base {
        fn encode_slice(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::Base", None, true);
            encoder.encode_string(&self.name);
            encoder.encode_class(self.next.as_ref())?;
            encoder.end_slice()
        }

        fn decode_slice(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.name = decoder.decode_string()?;
            self.next = decoder.decode_class()?;
            decoder.end_slice()
        }
    }

    impl SliceClass for Base {
        fn slice_type_id(&self) -> &str {
            "::Test::Base"
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            self.encode_slice(encoder)
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            self.decode_slice(decoder)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct Leaf {
        base: Base,
        extra: i32,
        peer: Option<ClassRef>,
    }

    impl SliceClass for Leaf {
        fn slice_type_id(&self) -> &str {
            "::Test::Leaf"
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::Leaf", None, false);
            encoder.encode_i32(self.extra);
            encoder.encode_class(self.peer.as_ref())?;
            encoder.end_slice()?;
            self.base.encode_slice(encoder)
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.extra = decoder.decode_i32()?;
            self.peer = decoder.decode_class()?;
            decoder.end_slice()?;
            self.base.decode_slice(decoder)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn registry_with_leaf() -> TypeRegistry {
        TypeRegistry::new()
            .with_class("::Test::Base", || new_class(Base::default()))
            .with_class("::Test::Leaf", || new_class(Leaf::default()))
    }

    fn base_only_registry() -> TypeRegistry {
        TypeRegistry::new().with_class("::Test::Base", || new_class(Base::default()))
    }

    fn encode_root(root: &ClassRef, format: ClassFormat) -> Vec<u8> {
        let mut encoder = SliceEncoder::new().with_class_format(format);
        encoder.encode_class(Some(root)).unwrap();
        encoder.as_bytes().to_vec()
    }

    #[derive(Debug, Default)]
    struct Failure {
        reason: String,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "failure: {}", self.reason)
        }
    }

    impl SliceException for Failure {
        fn slice_type_id(&self) -> &str {
            "::Test::Failure"
        }

        fn type_ids(&self) -> &'static [&'static str] {
            &["::Test::Failure"]
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::Failure", None, true);
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

    #[derive(Debug, Default)]
    struct DerivedFailure {
        base: Failure,
        code: i32,
    }

    impl fmt::Display for DerivedFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "derived failure {}: {}", self.code, self.base.reason)
        }
    }

    impl SliceException for DerivedFailure {
        fn slice_type_id(&self) -> &str {
            "::Test::DerivedFailure"
        }

        fn type_ids(&self) -> &'static [&'static str] {
            &["::Test::DerivedFailure", "::Test::Failure"]
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::DerivedFailure", None, false);
            encoder.encode_i32(self.code);
            encoder.end_slice()?;
            self.base.encode(encoder)
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.code = decoder.decode_i32()?;
            decoder.end_slice()?;
            self.base.decode(decoder)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_truncated_primitive() {
        let data = [1u8, 2];
        let mut decoder = SliceDecoder::new(&data);
        let err = decoder.decode_i32().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedData {
                needed: 4,
                remaining: 2
            }
        ));
    }

    #[test]
    fn test_decode_size_forms() {
        let data = [254u8, 255, 0x00, 0x01, 0, 0];
        let mut decoder = SliceDecoder::new(&data);
        assert_eq!(decoder.decode_size().unwrap(), 254);
        assert_eq!(decoder.decode_size().unwrap(), 256);
        assert!(decoder.is_at_end());

        let data = [255u8, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(SliceDecoder::new(&data).decode_size().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [2u8, 0xC3, 0x28];
        let err = SliceDecoder::new(&data).decode_string().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_sequence_count_bounded() {
        // Claims 1000 ints with four bytes available.
        let data = [255u8, 0xE8, 0x03, 0, 0, 1, 2, 3, 4];
        let err = SliceDecoder::new(&data)
            .decode_sequence(4, |d| d.decode_i32())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedData { .. }));
    }

    #[test]
    fn test_dictionary_roundtrip() {
        let mut context = HashMap::new();
        context.insert("a".to_string(), "1".to_string());
        context.insert("b".to_string(), "2".to_string());

        let mut encoder = SliceEncoder::new();
        encoder.encode_dictionary(&context, |e, k| e.encode_string(k), |e, v| e.encode_string(v));
        let bytes = encoder.freeze();

        let decoded = SliceDecoder::new(&bytes)
            .decode_dictionary(2, |d| d.decode_string(), |d| d.decode_string())
            .unwrap();
        assert_eq!(decoded, context);
    }

    #[test]
    fn test_encapsulation_bounds_reads() {
        // Encapsulation of size 7 holding one byte, followed by more data.
        let data = [7u8, 0, 0, 0, 1, 1, 9, 1, 2, 3, 4];
        let mut decoder = SliceDecoder::new(&data);
        decoder.start_encapsulation().unwrap();
        assert_eq!(decoder.decode_u8().unwrap(), 9);
        assert!(decoder.decode_u8().is_err());
        decoder.end_encapsulation().unwrap();
        assert_eq!(decoder.decode_i32().unwrap(), 0x04030201);
    }

    #[test]
    fn test_encapsulation_errors() {
        let data = [6u8, 0, 0, 0, 2, 0];
        let err = SliceDecoder::new(&data).start_encapsulation().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEncoding(_)));

        let data = [20u8, 0, 0, 0, 1, 1];
        let err = SliceDecoder::new(&data).start_encapsulation().unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedData { .. }));

        let data = [8u8, 0, 0, 0, 1, 0, 1, 2];
        let mut decoder = SliceDecoder::new(&data);
        decoder.start_encapsulation().unwrap();
        decoder.decode_u8().unwrap();
        assert!(decoder.end_encapsulation().is_err());
    }

    #[test]
    fn test_end_encapsulation_skips_trailing_tags() {
        let mut encoder = SliceEncoder::new();
        encoder.start_encapsulation();
        encoder.encode_i32(5);
        encoder
            .encode_tagged(7, TagFormat::F8, Some(&1i64), |e, v| {
                e.encode_i64(*v);
                Ok(())
            })
            .unwrap();
        encoder.end_encapsulation().unwrap();
        let bytes = encoder.freeze();

        let mut decoder = SliceDecoder::new(&bytes);
        decoder.start_encapsulation().unwrap();
        assert_eq!(decoder.decode_i32().unwrap(), 5);
        decoder.end_encapsulation().unwrap();
        assert!(decoder.is_at_end());
    }

    #[test]
    fn test_tagged_skip_unknown_and_absent() {
        let mut encoder = SliceEncoder::new();
        encoder
            .encode_tagged(1, TagFormat::OVSize, Some("skipped"), |e, v| {
                e.encode_string(v);
                Ok(())
            })
            .unwrap();
        encoder
            .encode_tagged(3, TagFormat::F4, Some(&42i32), |e, v| {
                e.encode_i32(*v);
                Ok(())
            })
            .unwrap();
        encoder
            .encode_tagged(35, TagFormat::Size, Some(&2i32), |e, v| e.encode_enum(*v))
            .unwrap();
        let bytes = encoder.freeze();

        let mut decoder = SliceDecoder::new(&bytes);
        assert_eq!(
            decoder
                .decode_tagged(2, TagFormat::F4, |d| d.decode_i32())
                .unwrap(),
            None
        );
        assert_eq!(
            decoder
                .decode_tagged(3, TagFormat::F4, |d| d.decode_i32())
                .unwrap(),
            Some(42)
        );
        assert_eq!(
            decoder
                .decode_tagged(20, TagFormat::F1, |d| d.decode_bool())
                .unwrap(),
            None
        );
        assert_eq!(
            decoder
                .decode_tagged(35, TagFormat::Size, |d| d.decode_enum(5))
                .unwrap(),
            Some(2)
        );
        assert!(decoder.is_at_end());
    }

    #[test]
    fn test_spilled_tags() {
        let mut encoder = SliceEncoder::new();
        encoder
            .encode_tagged(300, TagFormat::F4, Some(&7i32), |e, v| {
                e.encode_i32(*v);
                Ok(())
            })
            .unwrap();
        let bytes = encoder.freeze();
        assert_eq!(&bytes[..6], &[(30 << 3) | 2, 255, 0x2C, 0x01, 0, 0]);

        let mut decoder = SliceDecoder::new(&bytes);
        assert_eq!(
            decoder
                .decode_tagged(299, TagFormat::F4, |d| d.decode_i32())
                .unwrap(),
            None
        );
        assert_eq!(
            decoder
                .decode_tagged(300, TagFormat::F4, |d| d.decode_i32())
                .unwrap(),
            Some(7)
        );
        assert!(decoder.is_at_end());

        // A spilled tag whose size is negative
        let data = [(30u8 << 3) | 2, 255, 0xFF, 0xFF, 0xFF, 0xFF];
        let err = SliceDecoder::new(&data)
            .decode_tagged(40, TagFormat::F4, |d| d.decode_i32())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidData(_)));
    }

    #[test]
    fn test_tagged_format_mismatch() {
        let mut encoder = SliceEncoder::new();
        encoder
            .encode_tagged(1, TagFormat::F8, Some(&1i64), |e, v| {
                e.encode_i64(*v);
                Ok(())
            })
            .unwrap();
        let bytes = encoder.freeze();

        let err = SliceDecoder::new(&bytes)
            .decode_tagged(1, TagFormat::F4, |d| d.decode_i32())
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidTagFormat {
                tag: 1,
                expected: TagFormat::F4,
                found: TagFormat::F8
            }
        ));
    }

    #[test]
    fn test_tagged_vsize_and_fsize() {
        let values = vec![1i32, 2, 3];
        let mut encoder = SliceEncoder::new();
        encoder
            .encode_tagged(1, TagFormat::VSize, Some(&values), |e, v| {
                e.encode_sequence(v, |e, x| e.encode_i32(*x));
                Ok(())
            })
            .unwrap();
        encoder
            .encode_tagged(2, TagFormat::FSize, Some(&values), |e, v| {
                e.encode_sequence(v, |e, x| e.encode_i32(*x));
                Ok(())
            })
            .unwrap();
        let bytes = encoder.freeze();

        let mut decoder = SliceDecoder::new(&bytes);
        let first = decoder
            .decode_tagged(1, TagFormat::VSize, |d| d.decode_sequence(4, |d| d.decode_i32()))
            .unwrap();
        let second = decoder
            .decode_tagged(2, TagFormat::FSize, |d| d.decode_sequence(4, |d| d.decode_i32()))
            .unwrap();
        assert_eq!(first.as_deref(), Some(&[1, 2, 3][..]));
        assert_eq!(second.as_deref(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_no_tags_under_1_0() {
        let data = [(1u8 << 3) | 2, 1, 0, 0, 0];
        let mut decoder = SliceDecoder::with_encoding(&data, EncodingVersion::V1_0);
        assert_eq!(
            decoder
                .decode_tagged(1, TagFormat::F4, |d| d.decode_i32())
                .unwrap(),
            None
        );
        assert_eq!(decoder.position(), 0);
    }

    #[test]
    fn test_shared_and_cyclic_graph() {
        for format in [ClassFormat::Compact, ClassFormat::Sliced] {
            let a = new_class(Base {
                name: "a".into(),
                next: None,
            });
            let b = new_class(Base {
                name: "b".into(),
                next: Some(a.clone()),
            });
            downcast::<Base>(&a).unwrap().next = Some(b.clone());

            let bytes = encode_root(&a, format);
            // Break the cycle so the source graph is freed.
            downcast::<Base>(&a).unwrap().next = None;

            let registry = registry_with_leaf();
            let mut decoder = SliceDecoder::new(&bytes).with_activator(&registry);
            let root = decoder.decode_class().unwrap().unwrap();
            assert!(decoder.is_at_end(), "{format:?}");

            let second = downcast::<Base>(&root).unwrap().next.clone().unwrap();
            let back = downcast::<Base>(&second).unwrap().next.clone().unwrap();
            assert!(same_instance(&root, &back), "{format:?}");
            assert_eq!(downcast::<Base>(&second).unwrap().name, "b");

            downcast::<Base>(&root).unwrap().next = None;
        }
    }

    #[test]
    fn test_self_reference() {
        for format in [ClassFormat::Compact, ClassFormat::Sliced] {
            let a = new_class(Base {
                name: "self".into(),
                next: None,
            });
            downcast::<Base>(&a).unwrap().next = Some(a.clone());
            let bytes = encode_root(&a, format);
            downcast::<Base>(&a).unwrap().next = None;

            let registry = base_only_registry();
            let root = SliceDecoder::new(&bytes)
                .with_activator(&registry)
                .decode_class()
                .unwrap()
                .unwrap();
            let next = downcast::<Base>(&root).unwrap().next.clone().unwrap();
            assert!(same_instance(&root, &next));
            downcast::<Base>(&root).unwrap().next = None;
        }
    }

    #[test]
    fn test_sliced_format_slices_unknown_derived() {
        let peer = new_class(Base {
            name: "peer".into(),
            next: None,
        });
        let leaf = new_class(Leaf {
            base: Base {
                name: "leaf".into(),
                next: Some(peer.clone()),
            },
            extra: 9,
            peer: Some(peer.clone()),
        });
        let bytes = encode_root(&leaf, ClassFormat::Sliced);

        let registry = base_only_registry();
        let mut decoder = SliceDecoder::new(&bytes).with_activator(&registry);
        let root = decoder.decode_class().unwrap().unwrap();
        assert!(decoder.is_at_end());

        let base = downcast::<Base>(&root).unwrap();
        assert_eq!(base.name, "leaf");
        let next = base.next.clone().unwrap();
        assert_eq!(downcast::<Base>(&next).unwrap().name, "peer");
    }

    #[test]
    fn test_sliced_known_derived_preserves_sharing() {
        let peer = new_class(Base {
            name: "peer".into(),
            next: None,
        });
        let leaf = new_class(Leaf {
            base: Base {
                name: "leaf".into(),
                next: Some(peer.clone()),
            },
            extra: 9,
            peer: Some(peer),
        });
        let bytes = encode_root(&leaf, ClassFormat::Sliced);

        let registry = registry_with_leaf();
        let root = SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .decode_class()
            .unwrap()
            .unwrap();
        let decoded = downcast::<Leaf>(&root).unwrap();
        assert_eq!(decoded.extra, 9);
        assert!(same_instance(
            decoded.peer.as_ref().unwrap(),
            decoded.base.next.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_compact_format_cannot_slice() {
        let leaf = new_class(Leaf {
            base: Base::default(),
            extra: 1,
            peer: None,
        });
        let bytes = encode_root(&leaf, ClassFormat::Compact);

        let registry = base_only_registry();
        let err = SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .decode_class()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownClass(id) if id == "::Test::Leaf"));
    }

    #[test]
    fn test_unknown_class_placeholder_and_strict() {
        let bytes = encode_root(
            &new_class(Base {
                name: "x".into(),
                next: None,
            }),
            ClassFormat::Sliced,
        );
        let registry = TypeRegistry::new();

        let value = SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .decode_class()
            .unwrap()
            .unwrap();
        assert_eq!(value.lock().slice_type_id(), "::Test::Base");
        assert!(downcast::<UnknownSlicedValue>(&value).is_some());

        let err = SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .with_slicing_policy(SlicingPolicy::Strict)
            .decode_class()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownClass(_)));
    }

    #[test]
    fn test_type_id_index_reuse() {
        let first = new_class(Base {
            name: "1".into(),
            next: None,
        });
        let second = new_class(Base {
            name: "2".into(),
            next: None,
        });
        let mut encoder = SliceEncoder::new();
        encoder.encode_class(Some(&first)).unwrap();
        let after_first = encoder.len();
        encoder.encode_class(Some(&second)).unwrap();
        // Second instance refers to the type id by index.
        assert_eq!(encoder.as_bytes()[after_first + 1] & flags::TYPE_ID_MASK, flags::TYPE_ID_INDEX);

        let bytes = encoder.freeze();
        let registry = base_only_registry();
        let mut decoder = SliceDecoder::new(&bytes).with_activator(&registry);
        let a = decoder.decode_class().unwrap().unwrap();
        let b = decoder.decode_class().unwrap().unwrap();
        assert_eq!(downcast::<Base>(&a).unwrap().name, "1");
        assert_eq!(downcast::<Base>(&b).unwrap().name, "2");
    }

    #[test]
    fn test_depth_limit() {
        let mut head: Option<ClassRef> = None;
        for i in 0..10 {
            head = Some(new_class(Base {
                name: i.to_string(),
                next: head,
            }));
        }
        let bytes = encode_root(head.as_ref().unwrap(), ClassFormat::Compact);
        let registry = base_only_registry();

        let err = SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .with_class_graph_depth_max(5)
            .decode_class()
            .unwrap_err();
        assert!(err.to_string().contains("depth"));

        assert!(SliceDecoder::new(&bytes)
            .with_activator(&registry)
            .with_class_graph_depth_max(10)
            .decode_class()
            .is_ok());
    }

    #[test]
    fn test_exception_slicing() {
        let mut encoder = SliceEncoder::new();
        encoder
            .encode_exception(&DerivedFailure {
                base: Failure {
                    reason: "boom".into(),
                },
                code: 3,
            })
            .unwrap();
        let bytes = encoder.freeze();

        let full = TypeRegistry::new()
            .with_exception("::Test::Failure", || Box::new(Failure::default()))
            .with_exception("::Test::DerivedFailure", || {
                Box::new(DerivedFailure::default())
            });
        match SliceDecoder::new(&bytes)
            .with_activator(&full)
            .decode_exception()
            .unwrap()
        {
            DecodedException::Known(ex) => {
                let derived = ex.as_any().downcast_ref::<DerivedFailure>().unwrap();
                assert_eq!(derived.code, 3);
                assert_eq!(derived.base.reason, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }

        let base_only =
            TypeRegistry::new().with_exception("::Test::Failure", || Box::new(Failure::default()));
        let mut decoder = SliceDecoder::new(&bytes).with_activator(&base_only);
        match decoder.decode_exception().unwrap() {
            DecodedException::Known(ex) => {
                assert_eq!(ex.slice_type_id(), "::Test::Failure");
                assert_eq!(ex.to_string(), "failure: boom");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decoder.is_at_end());

        let empty = TypeRegistry::new();
        match SliceDecoder::new(&bytes)
            .with_activator(&empty)
            .decode_exception()
            .unwrap()
        {
            DecodedException::Unknown { type_id } => {
                assert_eq!(type_id, "::Test::DerivedFailure")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classes_require_1_1() {
        let data = [0u8];
        let err = SliceDecoder::with_encoding(&data, EncodingVersion::V1_0)
            .decode_class()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEncoding(_)));
    }
}
