//! Service addresses.
//!
//! A [`Proxy`] is the structured form carried on the wire: identity, facet,
//! invocation options and either a list of endpoints or an adapter id. A
//! [`ServiceAddress`] is the URI form. The two convert into each other with a
//! fixed loss: proxy options (mode, secure, encoding, endpoint timeout and
//! compression) do not survive the trip through a URI.

mod proxy_string;
mod uri;

pub use uri::{ServerAddress, ServiceAddress};

use crate::decoder::SliceDecoder;
use crate::encoder::SliceEncoder;
use crate::encoding::{ClassFormat, EncodingVersion, ProtocolVersion};
use crate::error::ProtocolError;
use crate::tag::TagFormat;
use std::fmt;

/// Endpoint timeout used when none is given.
pub const DEFAULT_ENDPOINT_TIMEOUT: i32 = 60_000;

/// Name and category of a target object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// An identity with an empty name denotes a null proxy on the wire.
    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }

    /// Parses `name` or `category/name`, honoring backslash escapes.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        proxy_string::parse_identity(s)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&proxy_string::format_identity(self))
    }
}

/// How invocations on a proxy are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InvocationMode {
    #[default]
    Twoway = 0,
    Oneway = 1,
    BatchOneway = 2,
    Datagram = 3,
    BatchDatagram = 4,
}

impl InvocationMode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(InvocationMode::Twoway),
            1 => Ok(InvocationMode::Oneway),
            2 => Ok(InvocationMode::BatchOneway),
            3 => Ok(InvocationMode::Datagram),
            4 => Ok(InvocationMode::BatchDatagram),
            other => Err(ProtocolError::invalid(format!(
                "invalid invocation mode {other}"
            ))),
        }
    }

    pub fn is_oneway(&self) -> bool {
        !matches!(self, InvocationMode::Twoway)
    }
}

/// Endpoint transports with a known payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Ssl,
    Udp,
    Ws,
    Wss,
}

impl Transport {
    pub fn type_id(&self) -> i16 {
        match self {
            Transport::Tcp => 1,
            Transport::Ssl => 2,
            Transport::Udp => 3,
            Transport::Ws => 4,
            Transport::Wss => 5,
        }
    }

    pub fn from_type_id(type_id: i16) -> Option<Self> {
        match type_id {
            1 => Some(Transport::Tcp),
            2 => Some(Transport::Ssl),
            3 => Some(Transport::Udp),
            4 => Some(Transport::Ws),
            5 => Some(Transport::Wss),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
            Transport::Udp => "udp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Transport::Tcp),
            "ssl" => Some(Transport::Ssl),
            "udp" => Some(Transport::Udp),
            "ws" => Some(Transport::Ws),
            "wss" => Some(Transport::Wss),
            _ => None,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Ssl | Transport::Wss)
    }
}

/// An IP endpoint of a known transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpEndpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    /// Milliseconds; -1 means infinite.
    pub timeout: i32,
    pub compress: bool,
    /// WebSocket resource path; empty for other transports.
    pub resource: String,
}

impl IpEndpoint {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            timeout: DEFAULT_ENDPOINT_TIMEOUT,
            compress: false,
            resource: String::new(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Transport::Tcp, host, port)
    }

    fn encode_payload(&self, encoder: &mut SliceEncoder) {
        encoder.encode_string(&self.host);
        encoder.encode_i32(self.port as i32);
        if self.transport != Transport::Udp {
            encoder.encode_i32(self.timeout);
        }
        encoder.encode_bool(self.compress);
        if matches!(self.transport, Transport::Ws | Transport::Wss) {
            encoder.encode_string(&self.resource);
        }
    }

    fn decode_payload(
        transport: Transport,
        decoder: &mut SliceDecoder<'_>,
    ) -> Result<Self, ProtocolError> {
        let host = decoder.decode_string()?;
        let port = decoder.decode_i32()?;
        let port = u16::try_from(port)
            .map_err(|_| ProtocolError::invalid(format!("invalid endpoint port {port}")))?;
        let timeout = if transport == Transport::Udp {
            DEFAULT_ENDPOINT_TIMEOUT
        } else {
            decoder.decode_i32()?
        };
        let compress = decoder.decode_bool()?;
        let resource = if matches!(transport, Transport::Ws | Transport::Wss) {
            decoder.decode_string()?
        } else {
            String::new()
        };
        Ok(Self {
            transport,
            host,
            port,
            timeout,
            compress,
            resource,
        })
    }

    /// Encodes the transport payload on its own, without type or
    /// encapsulation header.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut encoder = SliceEncoder::new();
        self.encode_payload(&mut encoder);
        encoder.as_bytes().to_vec()
    }

    /// Decodes a payload produced by [`payload_bytes`](Self::payload_bytes).
    pub fn from_payload(transport: Transport, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = SliceDecoder::new(bytes);
        let endpoint = Self::decode_payload(transport, &mut decoder)?;
        if !decoder.is_at_end() {
            return Err(ProtocolError::invalid(format!(
                "{} bytes left after {} endpoint",
                decoder.remaining(),
                transport.name()
            )));
        }
        Ok(endpoint)
    }
}

/// An endpoint whose transport is not understood; kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpaqueEndpoint {
    pub type_id: i16,
    pub encoding: EncodingVersion,
    pub bytes: Vec<u8>,
}

/// Transport type of endpoints that carry a server-address URI string.
pub const URI_ENDPOINT_TYPE: i16 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(IpEndpoint),
    Opaque(OpaqueEndpoint),
}

impl Endpoint {
    pub fn type_id(&self) -> i16 {
        match self {
            Endpoint::Ip(ip) => ip.transport.type_id(),
            Endpoint::Opaque(opaque) => opaque.type_id,
        }
    }

    pub fn as_ip(&self) -> Option<&IpEndpoint> {
        match self {
            Endpoint::Ip(ip) => Some(ip),
            Endpoint::Opaque(_) => None,
        }
    }
}

/// Where a proxy's target lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Endpoints(Vec<Endpoint>),
    /// Indirect proxy; resolved by a locator. Empty for well-known proxies.
    Adapter(String),
}

/// Structured service address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    pub identity: Identity,
    pub facet: String,
    pub mode: InvocationMode,
    pub secure: bool,
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub location: Location,
}

impl Proxy {
    pub fn new(identity: Identity, location: Location) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            protocol: ProtocolVersion::ICE,
            encoding: EncodingVersion::V1_1,
            location,
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses the stringified form, e.g. `hello -t:tcp -h localhost -p 4061`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        proxy_string::parse_proxy(s)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.location {
            Location::Endpoints(endpoints) => endpoints,
            Location::Adapter(_) => &[],
        }
    }

    pub fn adapter_id(&self) -> Option<&str> {
        match &self.location {
            Location::Adapter(id) => Some(id),
            Location::Endpoints(_) => None,
        }
    }

    /// Converts to the URI form. Mode, secure, encoding, timeouts and
    /// compression are dropped.
    pub fn to_service_address(&self) -> Result<ServiceAddress, ProtocolError> {
        uri::from_proxy(self)
    }

    /// Converts from the URI form, filling in defaults for everything the URI
    /// does not carry.
    pub fn from_service_address(address: &ServiceAddress) -> Result<Self, ProtocolError> {
        uri::to_proxy(address)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&proxy_string::format_proxy(self))
    }
}

// =============================================================================
// Wire codec
// =============================================================================

impl SliceEncoder {
    /// Writes a proxy. `None` is written as a null identity.
    pub fn encode_proxy(&mut self, proxy: Option<&Proxy>) -> Result<(), ProtocolError> {
        let Some(proxy) = proxy else {
            self.encode_string("");
            self.encode_string("");
            return Ok(());
        };
        if proxy.identity.is_null() {
            return Err(ProtocolError::invalid("proxy identity has an empty name"));
        }

        self.encode_string(&proxy.identity.name);
        self.encode_string(&proxy.identity.category);
        if proxy.facet.is_empty() {
            self.encode_size(0);
        } else {
            self.encode_size(1);
            self.encode_string(&proxy.facet);
        }
        self.encode_u8(proxy.mode as u8);
        self.encode_bool(proxy.secure);
        if self.encoding().supports_tags() {
            self.encode_u8(proxy.protocol.major);
            self.encode_u8(proxy.protocol.minor);
            self.encode_u8(proxy.encoding.major);
            self.encode_u8(proxy.encoding.minor);
        }

        match &proxy.location {
            Location::Endpoints(endpoints) if !endpoints.is_empty() => {
                self.encode_size(endpoints.len());
                for endpoint in endpoints {
                    self.encode_endpoint(endpoint)?;
                }
            }
            Location::Endpoints(_) => {
                self.encode_size(0);
                self.encode_string("");
            }
            Location::Adapter(adapter_id) => {
                self.encode_size(0);
                self.encode_string(adapter_id);
            }
        }
        Ok(())
    }

    /// Writes one endpoint: transport type then an encapsulation holding the
    /// transport payload.
    pub fn encode_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), ProtocolError> {
        match endpoint {
            Endpoint::Ip(ip) => {
                self.encode_i16(ip.transport.type_id());
                self.start_encapsulation_with(EncodingVersion::V1_1, ClassFormat::Compact);
                ip.encode_payload(self);
                self.end_encapsulation()
            }
            Endpoint::Opaque(opaque) => {
                self.encode_i16(opaque.type_id);
                self.encode_encapsulation(opaque.encoding, &opaque.bytes);
                Ok(())
            }
        }
    }

    /// Writes a tagged proxy member. Absent writes nothing.
    pub fn encode_tagged_proxy(
        &mut self,
        tag: i32,
        proxy: Option<&Proxy>,
    ) -> Result<(), ProtocolError> {
        self.encode_tagged(tag, TagFormat::FSize, proxy, |encoder, proxy| {
            encoder.encode_proxy(Some(proxy))
        })
    }
}

impl<'a> SliceDecoder<'a> {
    /// Reads a proxy. A null identity yields `None`.
    pub fn decode_proxy(&mut self) -> Result<Option<Proxy>, ProtocolError> {
        let name = self.decode_string()?;
        let category = self.decode_string()?;
        if name.is_empty() {
            if !category.is_empty() {
                return Err(ProtocolError::invalid(
                    "proxy identity has a category but no name",
                ));
            }
            return Ok(None);
        }

        let facets = self.decode_sequence(1, |d| d.decode_string())?;
        let facet = match facets.len() {
            0 => String::new(),
            1 => facets.into_iter().next().unwrap_or_default(),
            n => {
                return Err(ProtocolError::invalid(format!(
                    "facet path has {n} elements"
                )))
            }
        };
        let mode = InvocationMode::from_u8(self.decode_u8()?)?;
        let secure = self.decode_bool()?;
        let (protocol, encoding) = if self.encoding().supports_tags() {
            let protocol = ProtocolVersion::new(self.decode_u8()?, self.decode_u8()?);
            let encoding = EncodingVersion::new(self.decode_u8()?, self.decode_u8()?);
            (protocol, encoding)
        } else {
            (ProtocolVersion::ICE, EncodingVersion::V1_0)
        };

        let count = self.decode_size()?;
        let location = if count == 0 {
            Location::Adapter(self.decode_string()?)
        } else {
            let mut endpoints = Vec::with_capacity(count.min(self.remaining()));
            for _ in 0..count {
                endpoints.push(self.decode_endpoint()?);
            }
            Location::Endpoints(endpoints)
        };

        Ok(Some(Proxy {
            identity: Identity { name, category },
            facet,
            mode,
            secure,
            protocol,
            encoding,
            location,
        }))
    }

    pub fn decode_endpoint(&mut self) -> Result<Endpoint, ProtocolError> {
        let type_id = self.decode_i16()?;
        match Transport::from_type_id(type_id) {
            Some(transport) => {
                self.start_encapsulation()?;
                let ip = IpEndpoint::decode_payload(transport, self)?;
                self.end_encapsulation()?;
                Ok(Endpoint::Ip(ip))
            }
            None => {
                let (encoding, bytes) = self.decode_encapsulation()?;
                Ok(Endpoint::Opaque(OpaqueEndpoint {
                    type_id,
                    encoding,
                    bytes: bytes.to_vec(),
                }))
            }
        }
    }

    /// Reads a tagged proxy member. Present-but-null collapses to absent.
    pub fn decode_tagged_proxy(&mut self, tag: i32) -> Result<Option<Proxy>, ProtocolError> {
        Ok(self
            .decode_tagged(tag, TagFormat::FSize, |decoder| decoder.decode_proxy())?
            .flatten())
    }
}
