use super::{field, ProtocolError, SocksSocketAddr, VERSION};

const NO_AUTH_REQUIRED: u8 = 0x00;
const GSSAPI: u8 = 0x01;
const USERNAME_PASSWORD: u8 = 0x02;

const IANA_ASSIGNED_LOWER: u8 = 0x03;
const IANA_ASSIGNED_UPPER: u8 = 0x7F;

const PRIVATE_METHOD_LOWER: u8 = 0x80;
const PRIVATE_METHOD_UPPER: u8 = 0xFE;

const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Authentication methods a client may offer during negotiation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMethod {
    NoAuthRequired,
    Gssapi,
    UsernamePassword,
    IanaAssigned(u8),
    PrivateMethods(u8),
    /// Sent back when none of the offered methods is acceptable.
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            NO_AUTH_REQUIRED => AuthMethod::NoAuthRequired,
            GSSAPI => AuthMethod::Gssapi,
            USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            IANA_ASSIGNED_LOWER..=IANA_ASSIGNED_UPPER => AuthMethod::IanaAssigned(value),
            PRIVATE_METHOD_LOWER..=PRIVATE_METHOD_UPPER => AuthMethod::PrivateMethods(value),
            NO_ACCEPTABLE_METHODS => AuthMethod::NoAcceptableMethods,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => NO_AUTH_REQUIRED,
            AuthMethod::Gssapi => GSSAPI,
            AuthMethod::UsernamePassword => USERNAME_PASSWORD,
            AuthMethod::IanaAssigned(value) => value,
            AuthMethod::PrivateMethods(value) => value,
            AuthMethod::NoAcceptableMethods => NO_ACCEPTABLE_METHODS,
        }
    }
}

/// `[VER][NMETHODS][METHODS...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub methods: Vec<AuthMethod>,
}

impl AuthRequest {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = field(buf, 0, 2)?;
        if header[0] != VERSION {
            return Err(ProtocolError::Version(header[0]));
        }
        let count = header[1] as usize;
        let methods = field(buf, 2, count)?
            .iter()
            .copied()
            .map(AuthMethod::from_u8)
            .collect();

        Ok(AuthRequest { methods })
    }

    /// The method-selection reply for `method`.
    pub fn reply(method: AuthMethod) -> [u8; 2] {
        [VERSION, method.to_u8()]
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// `[VER][CMD][RSV][ATYP][DST.ADDR][DST.PORT]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub command: Command,
    pub dst: SocksSocketAddr,
}

impl ConnectionRequest {
    const HEADER_LEN: usize = 3;

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = field(buf, 0, Self::HEADER_LEN)?;
        if header[0] != VERSION {
            return Err(ProtocolError::Version(header[0]));
        }
        let command = Command::from_u8(header[1]).ok_or(ProtocolError::UnknownCommand(header[1]))?;

        let (dst, _) =
            SocksSocketAddr::parse(&buf[Self::HEADER_LEN..]).map_err(|err| match err {
                ProtocolError::Truncated { needed, got } => ProtocolError::Truncated {
                    needed: needed + Self::HEADER_LEN,
                    got: got + Self::HEADER_LEN,
                },
                err => err,
            })?;

        Ok(ConnectionRequest { command, dst })
    }
}

/// Destination host and port (as text) of a connection request.
pub fn remote_address_info(buf: &[u8]) -> Result<(String, String), ProtocolError> {
    let request = ConnectionRequest::parse(buf)?;
    Ok((request.dst.addr.to_string(), request.dst.port.to_string()))
}
