//! URI form of service addresses.
//!
//! ```text
//! ice://host:port/category/name?transport=tcp&alt-server=host2:port2?transport=ssl#facet
//! ice:/name?adapter-id=Adapter1
//! ```
//!
//! With a server address, every query parameter other than `alt-server`
//! belongs to that server address. Without one, parameters belong to the
//! service address itself. Parameters of an alt server follow its own `?`
//! and are separated by `$`.

use super::{
    Endpoint, Identity, InvocationMode, IpEndpoint, Location, OpaqueEndpoint, Proxy, Transport,
    DEFAULT_ENDPOINT_TIMEOUT, URI_ENDPOINT_TYPE,
};
use crate::decoder::SliceDecoder;
use crate::encoder::SliceEncoder;
use crate::encoding::{EncodingVersion, ProtocolVersion};
use crate::error::ProtocolError;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A server address inside a service address URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub transport: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    fn write_authority(&self, out: &mut String, default_port: u16) {
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        if self.port != default_port {
            out.push(':');
            out.push_str(&self.port.to_string());
        }
    }

    fn query_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::with_capacity(self.params.len() + 1);
        if let Some(transport) = &self.transport {
            pairs.push(("transport", transport.as_str()));
        }
        pairs.extend(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        pairs
    }
}

/// URI form of a service address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    pub protocol: ProtocolVersion,
    /// Percent-escaped absolute path, e.g. `/category/name`.
    pub path: String,
    pub server_address: Option<ServerAddress>,
    pub alt_server_addresses: Vec<ServerAddress>,
    /// Parameters of an address without a server address (e.g. `adapter-id`).
    pub params: BTreeMap<String, String>,
    /// Unescaped facet.
    pub fragment: String,
}

impl ServiceAddress {
    pub fn new(protocol: ProtocolVersion, path: impl Into<String>) -> Self {
        Self {
            protocol,
            path: path.into(),
            server_address: None,
            alt_server_addresses: Vec::new(),
            params: BTreeMap::new(),
            fragment: String::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (rest, fragment) = match s.split_once('#') {
            Some((rest, fragment)) => (rest, percent_decode(fragment)?),
            None => (s, String::new()),
        };

        let (scheme, rest) = rest
            .split_once(':')
            .ok_or_else(|| invalid_address(s, "missing scheme"))?;
        let protocol = ProtocolVersion::from_scheme(scheme)
            .ok_or_else(|| invalid_address(s, "unknown scheme"))?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = if let Some(hier) = rest.strip_prefix("//") {
            match hier.find('/') {
                Some(i) => (Some(&hier[..i]), &hier[i..]),
                None => (Some(hier), "/"),
            }
        } else {
            (None, rest)
        };
        if !path.starts_with('/') {
            return Err(invalid_address(s, "path must be absolute"));
        }
        // Validate escaping now so later conversions cannot fail on it.
        percent_decode(path)?;

        let default_port = protocol.default_port();
        let mut server_address = match authority {
            Some(authority) => Some(parse_authority(authority, default_port)?),
            None => None,
        };

        let mut params = BTreeMap::new();
        let mut alt_server_addresses = Vec::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == "alt-server" {
                for alt in value.split(',').filter(|a| !a.is_empty()) {
                    alt_server_addresses.push(parse_alt_server(alt, default_port)?);
                }
                continue;
            }
            match server_address.as_mut() {
                Some(server) if key == "transport" => server.transport = Some(value.to_string()),
                Some(server) => {
                    server.params.insert(key.to_string(), value.to_string());
                }
                None => {
                    params.insert(key.to_string(), value.to_string());
                }
            }
        }

        if server_address.is_none() && !alt_server_addresses.is_empty() {
            return Err(invalid_address(s, "alt-server without a server address"));
        }

        Ok(Self {
            protocol,
            path: path.to_string(),
            server_address,
            alt_server_addresses,
            params,
            fragment,
        })
    }

    /// Identity named by the path.
    pub fn identity(&self) -> Result<Identity, ProtocolError> {
        let trimmed = self.path.strip_prefix('/').unwrap_or(&self.path);
        let segments: Vec<&str> = trimmed.split('/').collect();
        let identity = match segments.as_slice() {
            [name] => Identity::new(percent_decode(name)?),
            [category, name] => {
                Identity::new(percent_decode(name)?).with_category(percent_decode(category)?)
            }
            _ => {
                return Err(invalid_address(
                    &self.path,
                    "path must have one or two segments",
                ))
            }
        };
        if identity.is_null() {
            return Err(invalid_address(&self.path, "empty identity name"));
        }
        Ok(identity)
    }

    /// Path naming `identity`.
    pub fn path_for(identity: &Identity) -> String {
        if identity.category.is_empty() {
            format!("/{}", percent_encode(&identity.name))
        } else {
            format!(
                "/{}/{}",
                percent_encode(&identity.category),
                percent_encode(&identity.name)
            )
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_port = self.protocol.default_port();
        let mut out = String::new();
        out.push_str(self.protocol.scheme().unwrap_or("ice"));
        out.push(':');

        let mut query: Vec<String> = Vec::new();
        if let Some(server) = &self.server_address {
            out.push_str("//");
            server.write_authority(&mut out, default_port);
            query.extend(server.query_pairs().iter().map(|(k, v)| format!("{k}={v}")));
        }
        out.push_str(&self.path);
        query.extend(self.params.iter().map(|(k, v)| format!("{k}={v}")));

        if !self.alt_server_addresses.is_empty() {
            let alts: Vec<String> = self
                .alt_server_addresses
                .iter()
                .map(|alt| {
                    let mut s = String::new();
                    alt.write_authority(&mut s, default_port);
                    let pairs = alt.query_pairs();
                    if !pairs.is_empty() {
                        s.push('?');
                        let joined: Vec<String> =
                            pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
                        s.push_str(&joined.join("$"));
                    }
                    s
                })
                .collect();
            query.push(format!("alt-server={}", alts.join(",")));
        }

        if !query.is_empty() {
            out.push('?');
            out.push_str(&query.join("&"));
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&percent_encode(&self.fragment));
        }
        f.write_str(&out)
    }
}

impl FromStr for ServiceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid_address(s: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidServiceAddress(format!("'{s}': {reason}"))
}

fn parse_authority(authority: &str, default_port: u16) -> Result<ServerAddress, ProtocolError> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid_address(authority, "unterminated IPv6 host"))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(invalid_address(authority, "junk after IPv6 host")),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid_address(authority, "empty host"));
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| invalid_address(authority, "invalid port"))?,
        None => default_port,
    };
    Ok(ServerAddress::new(host, port))
}

fn parse_alt_server(s: &str, default_port: u16) -> Result<ServerAddress, ProtocolError> {
    let (authority, params) = match s.split_once('?') {
        Some((authority, params)) => (authority, Some(params)),
        None => (s, None),
    };
    let mut server = parse_authority(authority, default_port)?;
    for pair in params.into_iter().flat_map(|p| p.split('$')).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == "transport" {
            server.transport = Some(value.to_string());
        } else {
            server.params.insert(key.to_string(), value.to_string());
        }
    }
    Ok(server)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub(crate) fn percent_decode(s: &str) -> Result<String, ProtocolError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| invalid_address(s, "truncated percent escape"))?;
            let value = u8::from_str_radix(hex, 16)
                .map_err(|_| invalid_address(s, "invalid percent escape"))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ProtocolError::InvalidUtf8)
}

// =============================================================================
// Conversions
// =============================================================================

pub(super) fn from_proxy(proxy: &Proxy) -> Result<ServiceAddress, ProtocolError> {
    if proxy.protocol.scheme().is_none() {
        return Err(ProtocolError::UnsupportedProtocol(proxy.protocol));
    }
    let mut address = ServiceAddress::new(proxy.protocol, ServiceAddress::path_for(&proxy.identity));
    address.fragment = proxy.facet.clone();

    match &proxy.location {
        Location::Adapter(adapter_id) => {
            if !adapter_id.is_empty() {
                address
                    .params
                    .insert("adapter-id".to_string(), adapter_id.clone());
            }
        }
        Location::Endpoints(endpoints) => {
            let mut servers = endpoints
                .iter()
                .map(endpoint_to_server_address)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter();
            address.server_address = servers.next();
            address.alt_server_addresses = servers.collect();
        }
    }
    Ok(address)
}

fn endpoint_to_server_address(endpoint: &Endpoint) -> Result<ServerAddress, ProtocolError> {
    match endpoint {
        Endpoint::Ip(ip) if matches!(ip.transport, Transport::Tcp | Transport::Ssl) => {
            Ok(ServerAddress::new(ip.host.clone(), ip.port).with_transport(ip.transport.name()))
        }
        Endpoint::Ip(ip) => Ok(opaque_server_address(
            ip.transport.type_id(),
            EncodingVersion::V1_1,
            &ip.payload_bytes(),
        )),
        Endpoint::Opaque(opaque) if opaque.type_id == URI_ENDPOINT_TYPE => {
            let uri = SliceDecoder::new(&opaque.bytes).decode_string()?;
            ServiceAddress::parse(&uri)?
                .server_address
                .ok_or_else(|| invalid_address(&uri, "endpoint URI has no server address"))
        }
        Endpoint::Opaque(opaque) => Ok(opaque_server_address(
            opaque.type_id,
            opaque.encoding,
            &opaque.bytes,
        )),
    }
}

fn opaque_server_address(type_id: i16, encoding: EncodingVersion, bytes: &[u8]) -> ServerAddress {
    let mut server = ServerAddress::new("opaque", 0).with_transport("opaque");
    server.params.insert("t".to_string(), type_id.to_string());
    server.params.insert("e".to_string(), encoding.to_string());
    server.params.insert("v".to_string(), STANDARD.encode(bytes));
    server
}

pub(super) fn to_proxy(address: &ServiceAddress) -> Result<Proxy, ProtocolError> {
    let identity = address.identity()?;
    let location = match &address.server_address {
        Some(server) => {
            let mut endpoints = Vec::with_capacity(1 + address.alt_server_addresses.len());
            endpoints.push(server_address_to_endpoint(address.protocol, server)?);
            for alt in &address.alt_server_addresses {
                endpoints.push(server_address_to_endpoint(address.protocol, alt)?);
            }
            Location::Endpoints(endpoints)
        }
        None => Location::Adapter(address.params.get("adapter-id").cloned().unwrap_or_default()),
    };

    Ok(Proxy {
        identity,
        facet: address.fragment.clone(),
        mode: InvocationMode::Twoway,
        secure: false,
        protocol: address.protocol,
        encoding: EncodingVersion::V1_1,
        location,
    })
}

fn server_address_to_endpoint(
    protocol: ProtocolVersion,
    server: &ServerAddress,
) -> Result<Endpoint, ProtocolError> {
    match server.transport.as_deref() {
        None | Some("tcp") | Some("ssl") => {
            let transport = if server.transport.as_deref() == Some("ssl") {
                Transport::Ssl
            } else {
                Transport::Tcp
            };
            let mut ip = IpEndpoint::new(transport, server.host.clone(), server.port);
            ip.timeout = DEFAULT_ENDPOINT_TIMEOUT;
            Ok(Endpoint::Ip(ip))
        }
        Some("opaque") => {
            let param = |key: &str| {
                server
                    .params
                    .get(key)
                    .ok_or_else(|| invalid_address(&server.host, "opaque server address is incomplete"))
            };
            let type_id: i16 = param("t")?
                .parse()
                .map_err(|_| invalid_address(&server.host, "invalid opaque type"))?;
            let encoding = match server.params.get("e") {
                Some(e) => EncodingVersion::parse(e)?,
                None => EncodingVersion::V1_1,
            };
            let bytes = STANDARD
                .decode(param("v")?)
                .map_err(|_| invalid_address(&server.host, "invalid opaque value"))?;
            match Transport::from_type_id(type_id) {
                Some(transport) => Ok(Endpoint::Ip(IpEndpoint::from_payload(transport, &bytes)?)),
                None => Ok(Endpoint::Opaque(OpaqueEndpoint {
                    type_id,
                    encoding,
                    bytes,
                })),
            }
        }
        Some(_) => {
            let mut uri = ServiceAddress::new(protocol, "/");
            uri.server_address = Some(server.clone());
            let mut encoder = SliceEncoder::new();
            encoder.encode_string(&uri.to_string());
            Ok(Endpoint::Opaque(OpaqueEndpoint {
                type_id: URI_ENDPOINT_TYPE,
                encoding: EncodingVersion::V1_1,
                bytes: encoder.as_bytes().to_vec(),
            }))
        }
    }
}
