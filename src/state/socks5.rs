use std::io;

use tracing::{debug, warn};

use super::transfer;
use crate::{
    auth::{Authenticator, NoAuthAuthenticator},
    protocol::{
        AddressType, AuthMethod, AuthRequest, Command, ConnectionRequest, Reply, UdpMessage,
        RESERVED, VERSION,
    },
    session::{ProtocolState, SessionContext},
    stream::{IoBuffer, Side},
};

const IPV4_ENDPOINT_LEN: usize = 6;
const IPV6_ENDPOINT_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    WaitConnection,
    AuthRequest,
    ConnectionRequest,
    ConnectionEstablished,
    ReadyTransferData,
    DataTransferMode,
    ReadyUdpTransferData,
    DataUdpTransferMode,
    /// A final reply is being flushed; the session ends once it is out.
    Closing,
}

impl Socks5State {
    fn auth(ctx: &mut SessionContext, buf: &[u8]) -> Self {
        let request = match AuthRequest::parse(buf) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = ctx.id(), error = %err, "malformed auth request");
                ctx.stop();
                return Socks5State::AuthRequest;
            }
        };

        let method = NoAuthAuthenticator.select_method(&request.methods);
        ctx.write_to_server(IoBuffer::copy_from_slice(&AuthRequest::reply(method)));
        if method == AuthMethod::NoAcceptableMethods {
            debug!(id = ctx.id(), methods = ?request.methods, "no acceptable auth method");
            Socks5State::Closing
        } else {
            Socks5State::ConnectionRequest
        }
    }

    fn request(ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        let request = match ConnectionRequest::parse(&buf) {
            Ok(request) => request,
            Err(err) => {
                return match err.reply() {
                    Some(reply) => {
                        debug!(id = ctx.id(), error = %err, "rejecting request");
                        Self::reject(ctx, &buf, reply)
                    }
                    None => {
                        warn!(id = ctx.id(), error = %err, "malformed connection request");
                        ctx.stop();
                        Socks5State::ConnectionRequest
                    }
                };
            }
        };

        ctx.set_endpoint(request.dst.addr.to_string(), request.dst.port.to_string());
        match request.command {
            Command::Connect => {
                ctx.set_response(buf.to_vec());
                ctx.connect();
                Socks5State::ConnectionEstablished
            }
            Command::UdpAssociate if ctx.udp_supported() => {
                ctx.set_response(buf.to_vec());
                ctx.enable_udp();
                ctx.udp_associate();
                Socks5State::ConnectionRequest
            }
            command => {
                debug!(id = ctx.id(), ?command, "command not supported");
                Self::reject(ctx, &buf, Reply::CommandNotSupported)
            }
        }
    }

    /// Mirrors the request back with `reply` as its code and closes.
    fn reject(ctx: &mut SessionContext, request: &[u8], reply: Reply) -> Self {
        ctx.set_response(request);
        ctx.set_response_code(reply);
        ctx.write_response_to_server();
        Socks5State::Closing
    }

    fn associated(ctx: &mut SessionContext, bound: io::Result<Vec<u8>>) -> Self {
        let bound = match bound {
            Ok(bound) => bound,
            Err(err) => {
                warn!(id = ctx.id(), error = %err, "udp relay bind failed");
                ctx.set_response_code(Reply::from(&err));
                ctx.write_response_to_server();
                return Socks5State::Closing;
            }
        };

        let addr_type = match bound.len() {
            IPV4_ENDPOINT_LEN => AddressType::Ipv4,
            IPV6_ENDPOINT_LEN => AddressType::Ipv6,
            len => {
                warn!(id = ctx.id(), len, "unexpected relay endpoint length");
                ctx.set_response_code(Reply::GeneralFailure);
                ctx.write_response_to_server();
                return Socks5State::Closing;
            }
        };

        let mut response = vec![VERSION, Reply::Success.to_u8(), RESERVED, addr_type.to_u8()];
        response.extend_from_slice(&bound);
        ctx.set_response(response);
        ctx.write_response_to_server();
        ctx.connect();
        Socks5State::ReadyUdpTransferData
    }

    fn datagram(ctx: &mut SessionContext, buf: IoBuffer) {
        match UdpMessage::parse(&buf) {
            Ok(message) if message.is_fragment() => {
                warn!(
                    id = ctx.id(),
                    fragment = message.fragment_number,
                    "dropping fragmented datagram"
                );
            }
            Ok(_) => ctx.relay_to_remote(buf),
            Err(err) => warn!(id = ctx.id(), error = %err, "dropping malformed datagram"),
        }
        ctx.read_from_server();
    }
}

impl ProtocolState for Socks5State {
    const PROTOCOL: &'static str = "socks5";

    fn initial() -> Self {
        Socks5State::WaitConnection
    }

    fn on_accept(self, ctx: &mut SessionContext) -> Self {
        match self {
            Socks5State::WaitConnection => {
                ctx.read_from_server();
                Socks5State::AuthRequest
            }
            state => state,
        }
    }

    fn on_server_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        match self {
            Socks5State::AuthRequest => Self::auth(ctx, &buf),
            Socks5State::ConnectionRequest => Self::request(ctx, buf),
            Socks5State::DataTransferMode => {
                transfer::on_server_read(ctx, buf);
                self
            }
            Socks5State::DataUdpTransferMode => {
                Self::datagram(ctx, buf);
                self
            }
            state => state,
        }
    }

    fn on_server_write(self, ctx: &mut SessionContext) -> Self {
        match self {
            Socks5State::ConnectionRequest => {
                ctx.read_from_server();
                self
            }
            Socks5State::ReadyTransferData => {
                transfer::start(ctx);
                Socks5State::DataTransferMode
            }
            Socks5State::DataTransferMode => {
                transfer::on_server_write(ctx);
                self
            }
            Socks5State::ReadyUdpTransferData => {
                ctx.read_from_server();
                Socks5State::DataUdpTransferMode
            }
            Socks5State::Closing => {
                ctx.stop();
                self
            }
            state => state,
        }
    }

    fn on_client_connect(self, ctx: &mut SessionContext) -> Self {
        match self {
            Socks5State::ConnectionEstablished => {
                debug!(id = ctx.id(), target = %ctx.target(), "upstream connected");
                ctx.set_response_code(Reply::Success);
                ctx.write_response_to_server();
                Socks5State::ReadyTransferData
            }
            Socks5State::ReadyUdpTransferData | Socks5State::DataUdpTransferMode => {
                ctx.read_from_client();
                self
            }
            state => state,
        }
    }

    fn on_client_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        match self {
            Socks5State::DataTransferMode => transfer::on_client_read(ctx, buf),
            Socks5State::DataUdpTransferMode => {
                ctx.relay_to_local(buf);
                ctx.read_from_client();
            }
            _ => {}
        }
        self
    }

    fn on_client_write(self, ctx: &mut SessionContext) -> Self {
        if self == Socks5State::DataTransferMode {
            transfer::on_client_write(ctx);
        }
        self
    }

    fn on_client_error(self, ctx: &mut SessionContext, err: &io::Error) -> Self {
        match self {
            Socks5State::ConnectionEstablished => {
                let reply = Reply::from(err);
                debug!(id = ctx.id(), target = %ctx.target(), error = %err, %reply, "upstream connect failed");
                ctx.set_response_code(reply);
                ctx.write_response_to_server();
                Socks5State::Closing
            }
            state => {
                ctx.close_on_error(Side::Client, err);
                state
            }
        }
    }

    fn on_udp_associate(self, ctx: &mut SessionContext, bound: io::Result<Vec<u8>>) -> Self {
        match self {
            Socks5State::ConnectionRequest => Self::associated(ctx, bound),
            state => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::session::{Command as Intent, Session};

    const CONNECT_V4: &[u8] = &[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];

    fn commands(session: &mut Session<Socks5State>) -> Vec<Intent> {
        session.context_mut().take_commands().into()
    }

    fn negotiated() -> Session<Socks5State> {
        let mut session = Session::<Socks5State>::new(1);
        session.handle_on_accept();
        session.handle_server_read(Bytes::from_static(&[0x05, 0x01, 0x00]));
        session.handle_server_write();
        assert_eq!(session.state(), Socks5State::ConnectionRequest);
        commands(&mut session);
        session
    }

    #[test]
    fn no_auth_negotiation() {
        let mut session = Session::<Socks5State>::new(1);
        session.handle_on_accept();
        assert_eq!(session.state(), Socks5State::AuthRequest);
        session.handle_server_read(Bytes::from_static(&[0x05, 0x02, 0x02, 0x00]));
        assert_eq!(session.state(), Socks5State::ConnectionRequest);
        assert_eq!(
            commands(&mut session),
            vec![
                Intent::ReadServer,
                Intent::WriteServer(Bytes::from_static(&[0x05, 0x00]))
            ]
        );
    }

    #[test]
    fn unacceptable_methods_are_refused() {
        let mut session = Session::<Socks5State>::new(2);
        session.handle_on_accept();
        session.handle_server_read(Bytes::from_static(&[0x05, 0x01, 0x02]));
        assert_eq!(session.state(), Socks5State::Closing);
        assert_eq!(
            commands(&mut session),
            vec![
                Intent::ReadServer,
                Intent::WriteServer(Bytes::from_static(&[0x05, 0xff]))
            ]
        );
        session.handle_server_write();
        assert_eq!(session.state(), Socks5State::Closing);
        assert_eq!(commands(&mut session), vec![Intent::Stop]);
    }

    #[test]
    fn truncated_auth_request_stops() {
        let mut session = Session::<Socks5State>::new(3);
        session.handle_on_accept();
        session.handle_server_read(Bytes::from_static(&[0x05]));
        assert_eq!(session.state(), Socks5State::AuthRequest);
        assert_eq!(commands(&mut session), vec![Intent::ReadServer, Intent::Stop]);
    }

    #[test]
    fn connect_success_patches_reply_code() {
        let mut session = negotiated();
        session.handle_server_read(Bytes::from_static(CONNECT_V4));
        assert_eq!(session.state(), Socks5State::ConnectionEstablished);
        assert_eq!(
            commands(&mut session),
            vec![Intent::Connect {
                host: "127.0.0.1".into(),
                service: "8080".into()
            }]
        );

        session.handle_client_connect();
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteServer(Bytes::from_static(CONNECT_V4))]
        );
        session.handle_server_write();
        assert_eq!(session.state(), Socks5State::DataTransferMode);
        assert_eq!(
            commands(&mut session),
            vec![Intent::ReadServer, Intent::ReadClient]
        );
    }

    #[test]
    fn connect_errors_map_to_reply_codes() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, 0x05),
            (io::ErrorKind::NotFound, 0x04),
            (io::ErrorKind::TimedOut, 0x06),
            (io::ErrorKind::PermissionDenied, 0x01),
        ];
        for (kind, code) in cases {
            let mut session = negotiated();
            session.handle_server_read(Bytes::from_static(CONNECT_V4));
            commands(&mut session);
            session.handle_client_error(&kind.into());
            assert_eq!(session.state(), Socks5State::Closing);

            let mut expected = CONNECT_V4.to_vec();
            expected[1] = code;
            assert_eq!(
                commands(&mut session),
                vec![Intent::WriteServer(Bytes::from(expected))]
            );
        }
    }

    #[test]
    fn bind_is_rejected_without_connecting() {
        let mut session = negotiated();
        session.handle_server_read(Bytes::from_static(&[
            0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50,
        ]));
        assert_eq!(session.state(), Socks5State::Closing);
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteServer(Bytes::from_static(&[
                0x05, 0x07, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50
            ]))]
        );
    }

    #[test]
    fn unknown_command_and_address_type_are_answered() {
        let mut session = negotiated();
        session.handle_server_read(Bytes::from_static(&[0x05, 0x09, 0x00, 0x01]));
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteServer(Bytes::from_static(&[0x05, 0x07, 0x00, 0x01]))]
        );

        let mut session = negotiated();
        session.handle_server_read(Bytes::from_static(&[0x05, 0x01, 0x00, 0x02, 0x00]));
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteServer(Bytes::from_static(&[
                0x05, 0x08, 0x00, 0x02, 0x00
            ]))]
        );
    }

    #[test]
    fn udp_associate_requires_permission() {
        let request: &[u8] = &[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let mut session = negotiated();
        session.handle_server_read(Bytes::copy_from_slice(request));
        assert_eq!(session.state(), Socks5State::Closing);

        let mut session = negotiated();
        session.context_mut().set_udp_supported(true);
        session.handle_server_read(Bytes::copy_from_slice(request));
        assert_eq!(session.state(), Socks5State::ConnectionRequest);
        assert!(session.context().udp_enabled());
        assert_eq!(commands(&mut session), vec![Intent::UdpAssociate]);

        session.handle_udp_associate(Ok(vec![127, 0, 0, 1, 0x13, 0x88]));
        assert_eq!(session.state(), Socks5State::ReadyUdpTransferData);
        let intents = commands(&mut session);
        assert_eq!(
            intents[0],
            Intent::WriteServer(Bytes::from_static(&[
                0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x13, 0x88
            ]))
        );
        assert!(matches!(intents[1], Intent::Connect { .. }));

        session.handle_server_write();
        assert_eq!(session.state(), Socks5State::DataUdpTransferMode);
        session.handle_client_connect();
        assert_eq!(
            commands(&mut session),
            vec![Intent::ReadServer, Intent::ReadClient]
        );

        let fragment = Bytes::from_static(&[0, 0, 1, 0x01, 8, 8, 8, 8, 0, 53, 0xaa]);
        session.handle_server_read(fragment);
        assert_eq!(commands(&mut session), vec![Intent::ReadServer]);

        let datagram = Bytes::from_static(&[0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53, 0xaa]);
        session.handle_server_read(datagram.clone());
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteClient(datagram), Intent::ReadServer]
        );
    }

    #[test]
    fn udp_bind_failure_is_reported() {
        let mut session = negotiated();
        session.context_mut().set_udp_supported(true);
        session.handle_server_read(Bytes::from_static(&[
            0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
        ]));
        commands(&mut session);

        session.handle_udp_associate(Err(io::ErrorKind::AddrNotAvailable.into()));
        assert_eq!(session.state(), Socks5State::Closing);
        assert_eq!(
            commands(&mut session),
            vec![Intent::WriteServer(Bytes::from_static(&[
                0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0
            ]))]
        );
    }
}
