//! Tag markers for optional members.
//!
//! A tagged value is preceded by one marker byte `(tag << 3) | format`. Tags
//! of 30 and above store 30 in the marker and follow it with the real tag
//! encoded as a size. The format tells a reader how to skip a value it does
//! not recognize.

/// Marks the end of the tagged members of a class or exception slice.
pub const TAG_END_MARKER: u8 = 0xFF;

/// Tags at or above this value spill into a trailing size.
pub(crate) const TAG_SPILL: i32 = 30;

/// Wire layout of a tagged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFormat {
    /// One fixed byte (bool, byte).
    F1,
    /// Two fixed bytes (short).
    F2,
    /// Four fixed bytes (int, float).
    F4,
    /// Eight fixed bytes (long, double).
    F8,
    /// A single size (enums).
    Size,
    /// A size giving the byte count, then the value.
    VSize,
    /// A four-byte byte count, then the value.
    FSize,
    /// A class instance.
    Class,
    /// VSize where the value carries its own size prefix (strings, byte
    /// sequences). Same marker bits as `VSize`.
    OVSize,
}

impl TagFormat {
    /// The three format bits written in the marker.
    pub fn wire_bits(self) -> u8 {
        match self {
            TagFormat::F1 => 0,
            TagFormat::F2 => 1,
            TagFormat::F4 => 2,
            TagFormat::F8 => 3,
            TagFormat::Size => 4,
            TagFormat::VSize | TagFormat::OVSize => 5,
            TagFormat::FSize => 6,
            TagFormat::Class => 7,
        }
    }

    /// Every 3-bit value names a format.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => TagFormat::F1,
            1 => TagFormat::F2,
            2 => TagFormat::F4,
            3 => TagFormat::F8,
            4 => TagFormat::Size,
            5 => TagFormat::VSize,
            6 => TagFormat::FSize,
            _ => TagFormat::Class,
        }
    }

    /// Format for a fixed-size value of `size` bytes, if one exists.
    pub fn for_fixed_size(size: usize) -> TagFormat {
        match size {
            1 => TagFormat::F1,
            2 => TagFormat::F2,
            4 => TagFormat::F4,
            8 => TagFormat::F8,
            _ => TagFormat::VSize,
        }
    }
}
