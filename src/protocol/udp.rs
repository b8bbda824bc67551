use super::{field, ProtocolError, SocksSocketAddr, RESERVED_16};

/// A SOCKS5 UDP request: `[RSV 2][FRAG][ATYP][DST.ADDR][DST.PORT][DATA]`.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpMessage<'a> {
    pub fragment_number: u8,
    pub dst: SocksSocketAddr,
    pub data: &'a [u8],
}

impl<'a> UdpMessage<'a> {
    const HEADER_LEN: usize = 3;

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(self.data.len() + 22);
        res.extend_from_slice(&RESERVED_16.to_be_bytes());
        res.push(self.fragment_number);
        res.extend(self.dst.to_bytes());
        res.extend_from_slice(self.data);
        res
    }

    pub fn parse(buf: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = field(buf, 0, Self::HEADER_LEN)?;
        if u16::from_be_bytes([header[0], header[1]]) != RESERVED_16 {
            return Err(ProtocolError::Reserved);
        }
        let fragment_number = header[2];

        let (dst, used) = SocksSocketAddr::parse(&buf[Self::HEADER_LEN..])?;
        let data = &buf[Self::HEADER_LEN + used..];

        Ok(UdpMessage {
            fragment_number,
            dst,
            data,
        })
    }

    /// Offset of the payload inside the buffer this message was parsed from.
    pub fn header_len(&self) -> usize {
        Self::HEADER_LEN + self.dst.to_bytes().len()
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_number != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Addr;

    #[test]
    fn parses_domain_datagram() {
        let buf = b"\x00\x00\x00\x03\x0bexample.com\x00\x35query";
        let message = UdpMessage::parse(buf).unwrap();
        assert_eq!(message.dst.addr, Addr::Domain("example.com".into()));
        assert_eq!(message.dst.port, 53);
        assert_eq!(message.data, b"query");
        assert_eq!(message.header_len(), buf.len() - 5);
        assert!(!message.is_fragment());
    }

    #[test]
    fn wraps_reply_with_sender_address() {
        let message = UdpMessage {
            fragment_number: 0,
            dst: "10.1.2.3:53".parse::<std::net::SocketAddr>().unwrap().into(),
            data: b"answer",
        };
        assert_eq!(
            message.as_bytes(),
            b"\x00\x00\x00\x01\x0a\x01\x02\x03\x00\x35answer".to_vec()
        );
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(
            UdpMessage::parse(&[0x00, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 53]),
            Err(ProtocolError::Reserved)
        );
        assert!(UdpMessage::parse(&[0x00, 0x00]).is_err());
        assert!(UdpMessage::parse(&[0x00, 0x00, 0x00, 0x01, 1, 2]).is_err());
        let fragment = UdpMessage::parse(&[0, 0, 1, 0x01, 1, 2, 3, 4, 0, 53]).unwrap();
        assert!(fragment.is_fragment());
    }
}
