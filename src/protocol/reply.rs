use std::{fmt, io};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TTLExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Reply::Success => "succeeded",
            Reply::GeneralFailure => "general SOCKS server failure",
            Reply::ConnectionNotAllowedByRuleset => "connection not allowed by ruleset",
            Reply::NetworkUnreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TTLExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddressTypeNotSupported => "address type not supported",
        };
        f.write_str(description)
    }
}

impl std::error::Error for Reply {}

impl Reply {
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl From<&io::Error> for Reply {
    fn from(err: &io::Error) -> Self {
        err.kind().into()
    }
}

impl From<io::ErrorKind> for Reply {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            // NotFound is what a failed name lookup surfaces as.
            io::ErrorKind::HostUnreachable | io::ErrorKind::NotFound => Reply::HostUnreachable,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut => Reply::TTLExpired,
            _ => Reply::GeneralFailure,
        }
    }
}
