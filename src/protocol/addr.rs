use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use super::{field, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(19);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()),
            Addr::Domain(domain) => {
                let len = domain.len().min(u8::MAX as usize);
                bytes.push(len as u8);
                bytes.extend_from_slice(&domain.as_bytes()[..len]);
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }

    /// Decodes AddrType+ADDR+PORT from the front of `buf`.
    /// Returns the address and how many bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let atyp = field(buf, 0, 1)?[0];
        let addr_type = AddressType::from_u8(atyp).ok_or(ProtocolError::AddressType(atyp))?;

        let (addr, port_at) = match addr_type {
            AddressType::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(field(buf, 1, 4)?);
                (Addr::Ipv4(Ipv4Addr::from(octets)), 5)
            }
            AddressType::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(field(buf, 1, 16)?);
                (Addr::Ipv6(Ipv6Addr::from(octets)), 17)
            }
            AddressType::DomainName => {
                let len = field(buf, 1, 1)?[0] as usize;
                if len == 0 {
                    return Err(ProtocolError::InvalidDomain);
                }
                let name = std::str::from_utf8(field(buf, 2, len)?)
                    .map_err(|_| ProtocolError::InvalidDomain)?;
                (Addr::Domain(name.to_owned()), 2 + len)
            }
        };

        let port = field(buf, port_at, 2)?;
        let port = u16::from_be_bytes([port[0], port[1]]);

        Ok((SocksSocketAddr { port, addr }, port_at + 2))
    }

    /// The address as a socket address, `None` when it still has to be resolved.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.addr {
            Addr::Ipv4(ip) => Some(SocketAddr::from((ip, self.port))),
            Addr::Ipv6(ip) => Some(SocketAddr::from((ip, self.port))),
            Addr::Domain(_) => None,
        }
    }
}

impl From<SocketAddr> for SocksSocketAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(ipv4) => SocksSocketAddr {
                port: ipv4.port(),
                addr: Addr::Ipv4(*ipv4.ip()),
            },
            SocketAddr::V6(ipv6) => SocksSocketAddr {
                port: ipv6.port(),
                addr: Addr::Ipv6(*ipv6.ip()),
            },
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            addr => write!(f, "{}:{}", addr, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ipv4(ip) => ip.fmt(f),
            Addr::Ipv6(ip) => ip.fmt(f),
            Addr::Domain(name) => f.write_str(name),
        }
    }
}

/// Raw ADDR+PORT of an endpoint without the address type byte:
/// 4+2 bytes for IPv4, 16+2 for IPv6.
pub fn endpoint_to_bytes(endpoint: SocketAddr) -> Vec<u8> {
    let mut bytes = match endpoint {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    bytes.extend_from_slice(&endpoint.port().to_be_bytes());
    bytes
}
