//! Stringified proxies.
//!
//! `identity [-f facet] [-t|-o|-O|-d|-D] [-s] [-e x.y] [-p x.y]` followed by
//! `:endpoint[:endpoint...]` or `@adapter-id`.

use super::{
    Endpoint, Identity, InvocationMode, IpEndpoint, Location, OpaqueEndpoint, Proxy, Transport,
};
use crate::encoding::{EncodingVersion, ProtocolVersion};
use crate::error::ProtocolError;
use base64::{engine::general_purpose::STANDARD, Engine};

fn invalid(s: &str, reason: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::InvalidServiceAddress(format!("'{s}': {reason}"))
}

/// Splits on whitespace. Double or single quotes group, and are removed.
fn tokenize(s: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), '\\') => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, '\\') => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(invalid(s, "unterminated quote"));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Index of the first `:` or `@` that is neither quoted nor escaped.
fn find_location_separator(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, ':') | (None, '@') => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_endpoints(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(i) = find_location_separator(rest).filter(|&i| rest.as_bytes()[i] == b':') {
        parts.push(&rest[..i]);
        rest = &rest[i + 1..];
    }
    parts.push(rest);
    parts
}

fn unescape(s: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => return Err(invalid(s, "trailing backslash")),
        }
    }
    Ok(out)
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | '"' | '\'' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Wraps `s` in double quotes when it would not survive tokenizing.
fn quote_if_needed(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == ':' || c == '@') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

pub(super) fn parse_identity(s: &str) -> Result<Identity, ProtocolError> {
    let mut split = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '/' {
            if split.is_some() {
                return Err(invalid(s, "identity has more than one unescaped '/'"));
            }
            split = Some(i);
        }
    }

    let identity = match split {
        Some(i) => Identity::new(unescape(&s[i + 1..])?).with_category(unescape(&s[..i])?),
        None => Identity::new(unescape(s)?),
    };
    if identity.is_null() {
        return Err(invalid(s, "identity name is empty"));
    }
    Ok(identity)
}

pub(super) fn format_identity(identity: &Identity) -> String {
    if identity.category.is_empty() {
        escape(&identity.name, &['/'])
    } else {
        format!(
            "{}/{}",
            escape(&identity.category, &['/']),
            escape(&identity.name, &['/'])
        )
    }
}

pub(super) fn parse_proxy(s: &str) -> Result<Proxy, ProtocolError> {
    let s = s.trim();
    let (head, tail) = match find_location_separator(s) {
        Some(i) => (&s[..i], Some((&s[i..i + 1], &s[i + 1..]))),
        None => (s, None),
    };

    let tokens = tokenize(head)?;
    let mut tokens = tokens.iter();
    let identity = parse_identity(tokens.next().ok_or_else(|| invalid(s, "missing identity"))?)?;

    let mut proxy = Proxy::new(identity, Location::Endpoints(Vec::new()));
    while let Some(option) = tokens.next() {
        match option.as_str() {
            "-f" => {
                let facet = tokens.next().ok_or_else(|| invalid(s, "-f needs a facet"))?;
                proxy.facet = unescape(facet)?;
            }
            "-t" => proxy.mode = InvocationMode::Twoway,
            "-o" => proxy.mode = InvocationMode::Oneway,
            "-O" => proxy.mode = InvocationMode::BatchOneway,
            "-d" => proxy.mode = InvocationMode::Datagram,
            "-D" => proxy.mode = InvocationMode::BatchDatagram,
            "-s" => proxy.secure = true,
            "-e" => {
                let version = tokens.next().ok_or_else(|| invalid(s, "-e needs a version"))?;
                proxy.encoding = EncodingVersion::parse(version)?;
            }
            "-p" => {
                let version = tokens.next().ok_or_else(|| invalid(s, "-p needs a version"))?;
                proxy.protocol = ProtocolVersion::parse(version)?;
            }
            other => return Err(invalid(s, format!("unknown option '{other}'"))),
        }
    }

    proxy.location = match tail {
        None => Location::Endpoints(Vec::new()),
        Some(("@", adapter)) => {
            let tokens = tokenize(adapter)?;
            match tokens.as_slice() {
                [adapter_id] => Location::Adapter(unescape(adapter_id)?),
                _ => return Err(invalid(s, "expected one adapter id after '@'")),
            }
        }
        Some((_, endpoints)) => Location::Endpoints(
            split_endpoints(endpoints)
                .into_iter()
                .map(parse_endpoint)
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };
    Ok(proxy)
}

fn parse_endpoint(s: &str) -> Result<Endpoint, ProtocolError> {
    let tokens = tokenize(s)?;
    let (kind, options) = tokens
        .split_first()
        .ok_or_else(|| invalid(s, "empty endpoint"))?;

    if kind == "opaque" {
        return parse_opaque(s, options);
    }
    let transport =
        Transport::from_name(kind).ok_or_else(|| invalid(s, format!("unknown transport '{kind}'")))?;

    let mut endpoint = IpEndpoint::new(transport, "", 0);
    let mut options = options.iter();
    while let Some(option) = options.next() {
        let mut arg = |name: &str| {
            options
                .next()
                .ok_or_else(|| invalid(s, format!("{name} needs an argument")))
        };
        match option.as_str() {
            "-h" => endpoint.host = unescape(arg("-h")?)?,
            "-p" => {
                endpoint.port = arg("-p")?
                    .parse()
                    .map_err(|_| invalid(s, "invalid port"))?
            }
            "-t" if transport != Transport::Udp => {
                let value = arg("-t")?;
                endpoint.timeout = if value == "infinite" {
                    -1
                } else {
                    value
                        .parse::<i32>()
                        .ok()
                        .filter(|t| *t > 0)
                        .ok_or_else(|| invalid(s, "invalid timeout"))?
                };
            }
            "-r" if matches!(transport, Transport::Ws | Transport::Wss) => {
                endpoint.resource = unescape(arg("-r")?)?;
            }
            "-z" => endpoint.compress = true,
            other => return Err(invalid(s, format!("unknown option '{other}'"))),
        }
    }
    Ok(Endpoint::Ip(endpoint))
}

fn parse_opaque(s: &str, options: &[String]) -> Result<Endpoint, ProtocolError> {
    let mut type_id = None;
    let mut encoding = EncodingVersion::V1_0;
    let mut bytes = None;

    let mut options = options.iter();
    while let Some(option) = options.next() {
        let arg = options
            .next()
            .ok_or_else(|| invalid(s, format!("{option} needs an argument")))?;
        match option.as_str() {
            "-t" => {
                type_id = Some(
                    arg.parse::<i16>()
                        .ok()
                        .filter(|t| *t >= 0)
                        .ok_or_else(|| invalid(s, "invalid opaque type"))?,
                )
            }
            "-e" => encoding = EncodingVersion::parse(arg)?,
            "-v" => {
                bytes = Some(
                    STANDARD
                        .decode(arg)
                        .map_err(|_| invalid(s, "invalid base64 value"))?,
                )
            }
            other => return Err(invalid(s, format!("unknown option '{other}'"))),
        }
    }

    let type_id = type_id.ok_or_else(|| invalid(s, "opaque endpoint needs -t"))?;
    let bytes = bytes.ok_or_else(|| invalid(s, "opaque endpoint needs -v"))?;
    match Transport::from_type_id(type_id) {
        Some(transport) => Ok(Endpoint::Ip(IpEndpoint::from_payload(transport, &bytes)?)),
        None => Ok(Endpoint::Opaque(OpaqueEndpoint {
            type_id,
            encoding,
            bytes,
        })),
    }
}

fn format_endpoint(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Ip(ip) => {
            let mut s = format!(
                "{} -h {} -p {}",
                ip.transport.name(),
                quote_if_needed(&escape(&ip.host, &[])),
                ip.port
            );
            if ip.transport != Transport::Udp {
                if ip.timeout == -1 {
                    s.push_str(" -t infinite");
                } else {
                    s.push_str(&format!(" -t {}", ip.timeout));
                }
            }
            if ip.compress {
                s.push_str(" -z");
            }
            if !ip.resource.is_empty() {
                s.push_str(&format!(" -r {}", quote_if_needed(&escape(&ip.resource, &[]))));
            }
            s
        }
        Endpoint::Opaque(opaque) => format!(
            "opaque -t {} -e {} -v {}",
            opaque.type_id,
            opaque.encoding,
            STANDARD.encode(&opaque.bytes)
        ),
    }
}

pub(super) fn format_proxy(proxy: &Proxy) -> String {
    let mut s = quote_if_needed(&format_identity(&proxy.identity));
    if !proxy.facet.is_empty() {
        s.push_str(" -f ");
        s.push_str(&quote_if_needed(&escape(&proxy.facet, &[])));
    }
    s.push_str(match proxy.mode {
        InvocationMode::Twoway => " -t",
        InvocationMode::Oneway => " -o",
        InvocationMode::BatchOneway => " -O",
        InvocationMode::Datagram => " -d",
        InvocationMode::BatchDatagram => " -D",
    });
    if proxy.secure {
        s.push_str(" -s");
    }
    s.push_str(&format!(" -e {}", proxy.encoding));
    if proxy.protocol != ProtocolVersion::ICE {
        s.push_str(&format!(" -p {}", proxy.protocol));
    }

    match &proxy.location {
        Location::Endpoints(endpoints) => {
            for endpoint in endpoints {
                s.push(':');
                s.push_str(&format_endpoint(endpoint));
            }
        }
        Location::Adapter(adapter_id) if !adapter_id.is_empty() => {
            s.push_str(" @ ");
            s.push_str(&quote_if_needed(&escape(adapter_id, &[])));
        }
        Location::Adapter(_) => {}
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let proxy = Proxy::parse("hello:tcp -h 127.0.0.1 -p 10000").unwrap();
        assert_eq!(proxy.identity, Identity::new("hello"));
        assert_eq!(proxy.mode, InvocationMode::Twoway);
        assert_eq!(
            proxy.to_string(),
            "hello -t -e 1.1:tcp -h 127.0.0.1 -p 10000 -t 60000"
        );
    }

    #[test]
    fn test_endpoint_options() {
        let proxy = Proxy::parse("hello:tcp -h 127.0.0.1 -p 10000 -z -t 10000").unwrap();
        let ip = proxy.endpoints()[0].as_ip().unwrap();
        assert!(ip.compress);
        assert_eq!(ip.timeout, 10000);

        let proxy = Proxy::parse("h:ssl -h host -p 1 -t infinite").unwrap();
        assert_eq!(proxy.endpoints()[0].as_ip().unwrap().timeout, -1);
        assert!(proxy.to_string().ends_with("-t infinite"));
    }

    #[test]
    fn test_uri_roundtrip_drops_timeout_and_compress() {
        let proxy = Proxy::parse("hello:tcp -h 127.0.0.1 -p 10000 -z -t 10000").unwrap();
        let address = proxy.to_service_address().unwrap();
        let back = Proxy::from_service_address(&address).unwrap();

        assert_eq!(back.identity, proxy.identity);
        assert_eq!(back.facet, proxy.facet);
        let ip = back.endpoints()[0].as_ip().unwrap();
        assert_eq!(ip.host, "127.0.0.1");
        assert_eq!(ip.port, 10000);
        assert!(!ip.compress);
        assert_eq!(ip.timeout, 60000);
        assert_eq!(
            back.to_string(),
            "hello -t -e 1.1:tcp -h 127.0.0.1 -p 10000 -t 60000"
        );
    }

    #[test]
    fn test_proxy_options() {
        let proxy = Proxy::parse("cat/obj -f admin -o -s -e 1.0 -p 2.0 @ Adapter1").unwrap();
        assert_eq!(proxy.identity, Identity::new("obj").with_category("cat"));
        assert_eq!(proxy.facet, "admin");
        assert_eq!(proxy.mode, InvocationMode::Oneway);
        assert!(proxy.secure);
        assert_eq!(proxy.encoding, EncodingVersion::V1_0);
        assert_eq!(proxy.protocol, ProtocolVersion::ICERPC);
        assert_eq!(proxy.adapter_id(), Some("Adapter1"));

        let text = proxy.to_string();
        assert_eq!(Proxy::parse(&text).unwrap(), proxy);
    }

    #[test]
    fn test_quoted_identity_and_ipv6() {
        let proxy =
            Proxy::parse("\"my object\" -t:tcp -h \"::1\" -p 4061:udp -h 10.0.0.1 -p 5000 -z")
                .unwrap();
        assert_eq!(proxy.identity.name, "my object");
        assert_eq!(proxy.endpoints().len(), 2);
        assert_eq!(proxy.endpoints()[0].as_ip().unwrap().host, "::1");
        let udp = proxy.endpoints()[1].as_ip().unwrap();
        assert_eq!(udp.transport, Transport::Udp);
        assert!(udp.compress);

        assert_eq!(Proxy::parse(&proxy.to_string()).unwrap(), proxy);
    }

    #[test]
    fn test_escaped_identity() {
        let identity = Identity::parse("a\\/b/c").unwrap();
        assert_eq!(identity.category, "a/b");
        assert_eq!(identity.name, "c");
        assert_eq!(identity.to_string(), "a\\/b/c");
        assert!(Identity::parse("a/b/c").is_err());
        assert!(Identity::parse("cat/").is_err());
    }

    #[test]
    fn test_ws_resource() {
        let proxy = Proxy::parse("x:ws -h example.com -p 80 -r /chat").unwrap();
        assert_eq!(proxy.endpoints()[0].as_ip().unwrap().resource, "/chat");
        assert_eq!(Proxy::parse(&proxy.to_string()).unwrap(), proxy);
    }

    #[test]
    fn test_opaque_endpoint() {
        let proxy = Proxy::parse("x:opaque -t 99 -e 1.1 -v AAEC").unwrap();
        match &proxy.endpoints()[0] {
            Endpoint::Opaque(opaque) => {
                assert_eq!(opaque.type_id, 99);
                assert_eq!(opaque.bytes, vec![0, 1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(Proxy::parse(&proxy.to_string()).unwrap(), proxy);

        // A known type id in opaque form becomes a real endpoint.
        let tcp = IpEndpoint::tcp("h", 1);
        let text = format!("x:opaque -t 1 -v {}", STANDARD.encode(tcp.payload_bytes()));
        let proxy = Proxy::parse(&text).unwrap();
        assert_eq!(proxy.endpoints()[0], Endpoint::Ip(tcp));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "hello -x",
            "hello:foo -h h",
            "hello:tcp -h",
            "hello:tcp -p notaport",
            "hello:tcp -t 0",
            "\"unterminated",
            "hello @ a b",
            "hello:opaque -t 99",
        ] {
            assert!(Proxy::parse(bad).is_err(), "{bad}");
        }
    }
}
