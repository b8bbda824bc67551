//! SOCKS5 wire format (RFC 1928).
//!
//! Every decoder here works on an owned byte buffer received from the peer and
//! checks each length before touching the field behind it.

use thiserror::Error;

mod addr;
mod handshake;
mod reply;
mod udp;

pub use addr::{endpoint_to_bytes, Addr, AddressType, SocksSocketAddr};
pub use handshake::{remote_address_info, AuthMethod, AuthRequest, Command, ConnectionRequest};
pub use reply::Reply;
pub use udp::UdpMessage;

pub const VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;
pub const RESERVED_16: u16 = 0x0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),
    #[error("invalid domain name")]
    InvalidDomain,
    #[error("reserved field is not zero")]
    Reserved,
    #[error("malformed http request: {0}")]
    Http(&'static str),
}

impl ProtocolError {
    /// Reply code to send back for errors the client can be told about.
    /// `None` means the message was too broken to answer.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            ProtocolError::UnknownCommand(_) => Some(Reply::CommandNotSupported),
            ProtocolError::AddressType(_) => Some(Reply::AddressTypeNotSupported),
            _ => None,
        }
    }
}

/// Borrows `len` bytes at `start`, failing instead of reading past the end.
pub(crate) fn field(buf: &[u8], start: usize, len: usize) -> Result<&[u8], ProtocolError> {
    buf.get(start..start + len).ok_or(ProtocolError::Truncated {
        needed: start + len,
        got: buf.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_is_bounds_checked() {
        let buf = [1, 2, 3];
        assert_eq!(field(&buf, 1, 2), Ok(&buf[1..3]));
        assert_eq!(
            field(&buf, 2, 2),
            Err(ProtocolError::Truncated { needed: 4, got: 3 })
        );
    }

    #[test]
    fn only_unsupported_values_map_to_replies() {
        assert_eq!(
            ProtocolError::UnknownCommand(9).reply(),
            Some(Reply::CommandNotSupported)
        );
        assert_eq!(
            ProtocolError::AddressType(2).reply(),
            Some(Reply::AddressTypeNotSupported)
        );
        assert_eq!(ProtocolError::Version(4).reply(), None);
        assert_eq!(ProtocolError::InvalidDomain.reply(), None);
    }
}
