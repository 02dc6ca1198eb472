//! Protocol and encoding version identifiers.

use crate::error::ProtocolError;
use std::fmt;

/// Version of the Slice encoding used inside an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl EncodingVersion {
    pub const V1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
    pub const V1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Returns whether this engine can read and write the encoding.
    pub fn is_supported(&self) -> bool {
        self.major == 1 && self.minor <= 1
    }

    /// Classes, exceptions and tagged members need 1.1 or later.
    pub fn supports_tags(&self) -> bool {
        *self != Self::V1_0
    }

    /// Parses `major.minor`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (major, minor) = parse_version(s)
            .ok_or_else(|| ProtocolError::InvalidServiceAddress(format!("invalid version '{s}'")))?;
        Ok(Self { major, minor })
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self::V1_1
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version of the RPC protocol.
///
/// 1.0 is the `ice` protocol, 2.0 is `icerpc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const ICE: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
    pub const ICERPC: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parses `major.minor`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (major, minor) = parse_version(s)
            .ok_or_else(|| ProtocolError::InvalidServiceAddress(format!("invalid version '{s}'")))?;
        Ok(Self { major, minor })
    }

    /// URI scheme naming this protocol.
    pub fn scheme(&self) -> Option<&'static str> {
        match (self.major, self.minor) {
            (1, 0) => Some("ice"),
            (2, 0) => Some("icerpc"),
            _ => None,
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ice" => Some(Self::ICE),
            "icerpc" => Some(Self::ICERPC),
            _ => None,
        }
    }

    /// Default server port for addresses that omit one.
    pub fn default_port(&self) -> u16 {
        if *self == Self::ICERPC {
            4062
        } else {
            crate::DEFAULT_PORT
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::ICE
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn parse_version(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Layout used when encoding class instances.
///
/// `Compact` omits slice sizes and base type ids and cannot be sliced by a
/// reader that does not know the most-derived type. `Sliced` carries enough
/// framing for any reader to skip unknown slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassFormat {
    #[default]
    Compact,
    Sliced,
}
