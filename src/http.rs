//! HTTP proxy request head parsing.

use std::str::FromStr;

use crate::protocol::ProtocolError;

pub const HTTP_DONE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
pub const HTTP_ERROR_500: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\n";

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Patch,
    Connect,
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let method = match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            "CONNECT" => Method::Connect,
            _ => return Err(ProtocolError::Http("unsupported method")),
        };
        Ok(method)
    }
}

/// The parts of a proxy request needed to pick and reach the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub method: Method,
    pub uri: String,
    pub version: String,
    /// Upstream host, without brackets for IPv6 literals.
    pub host: String,
    /// Upstream port as text.
    pub service: String,
    pub connection: Option<String>,
}

/// Parses the request line and the headers of `buf`.
///
/// Only the bytes before the first empty line are looked at; a request whose
/// head is split over several reads is rejected.
pub fn parse_request(buf: &[u8]) -> Result<RequestHeaders, ProtocolError> {
    let head = match find_subslice(buf, b"\r\n\r\n") {
        Some(end) => &buf[..end],
        None => buf,
    };
    let head = std::str::from_utf8(head).map_err(|_| ProtocolError::Http("request head is not utf-8"))?;

    let mut lines = head.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines.next().ok_or(ProtocolError::Http("empty request"))?;

    let fields: Vec<&str> = request_line.split(' ').filter(|f| !f.is_empty()).collect();
    let [method, uri, version] = fields[..] else {
        return Err(ProtocolError::Http("malformed request line"));
    };
    let method: Method = method.parse()?;

    let mut host_header = None;
    let mut connection = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("host") {
            host_header = Some(value.trim());
        } else if name.eq_ignore_ascii_case("connection") {
            connection = Some(value.trim().to_owned());
        }
    }

    let host_header = host_header
        .filter(|value| !value.is_empty())
        .ok_or(ProtocolError::Http("missing Host header"))?;

    let (host, port) = if method == Method::Connect {
        match split_host_port(uri)? {
            (host, Some(port)) if !host.is_empty() => (host, port),
            _ => return Err(ProtocolError::Http("CONNECT target must be host:port")),
        }
    } else {
        let (host, port) = split_host_port(host_header)?;
        if host.is_empty() {
            return Err(ProtocolError::Http("empty Host header"));
        }
        (host, port.map_or_else(|| port_from_uri(uri), Ok)?)
    };

    Ok(RequestHeaders {
        method,
        uri: uri.to_owned(),
        version: version.to_owned(),
        host: host.to_owned(),
        service: port.to_string(),
        connection,
    })
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), ProtocolError> {
    let bad_port = ProtocolError::Http("invalid port");

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or(ProtocolError::Http("unterminated IPv6 literal"))?;
        return match tail {
            "" => Ok((host, None)),
            _ => {
                let port = tail.strip_prefix(':').ok_or(bad_port.clone())?;
                Ok((host, Some(port.parse().map_err(|_| bad_port)?)))
            }
        };
    }

    match authority.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port.
        Some((host, _)) if host.contains(':') => Ok((authority, None)),
        Some((host, port)) => Ok((host, Some(port.parse().map_err(|_| bad_port)?))),
        None => Ok((authority, None)),
    }
}

/// Port of an absolute-form request target, falling back to the scheme default.
fn port_from_uri(uri: &str) -> Result<u16, ProtocolError> {
    let (default_port, rest) = if let Some(rest) = uri.strip_prefix("https://") {
        (HTTPS_PORT, rest)
    } else if let Some(rest) = uri.strip_prefix("http://") {
        (HTTP_PORT, rest)
    } else {
        return Ok(HTTP_PORT);
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (_, port) = split_host_port(authority)?;
    Ok(port.unwrap_or(default_port))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
