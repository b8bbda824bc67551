use std::io;

use tracing::{debug, warn};

use super::transfer;
use crate::{
    http::{parse_request, Method, HTTP_DONE, HTTP_ERROR_500},
    session::{ProtocolState, Route, SessionContext},
    stream::{IoBuffer, Side},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    WaitRequest,
    ConnectionEstablished,
    ReadyTransferData,
    DataTransferMode,
    /// The last response is being flushed; the session ends once it is out.
    Closing,
}

impl HttpState {
    fn fail(ctx: &mut SessionContext) -> Self {
        ctx.set_response(HTTP_ERROR_500);
        ctx.write_response_to_server();
        HttpState::Closing
    }

    fn request(ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        let request = match parse_request(&buf) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = ctx.id(), error = %err, "malformed http request");
                return Self::fail(ctx);
            }
        };

        debug!(
            id = ctx.id(),
            method = ?request.method,
            host = %request.host,
            service = %request.service,
            "http request"
        );
        ctx.set_endpoint(request.host, request.service);
        if request.method == Method::Connect {
            ctx.set_response(HTTP_DONE);
            ctx.set_route(Route::Inbound);
        } else {
            ctx.set_response(buf.to_vec());
            ctx.set_route(Route::Outbound);
        }
        ctx.connect();
        HttpState::ConnectionEstablished
    }
}

impl ProtocolState for HttpState {
    const PROTOCOL: &'static str = "http";

    fn initial() -> Self {
        HttpState::WaitRequest
    }

    fn on_accept(self, ctx: &mut SessionContext) -> Self {
        if self == HttpState::WaitRequest {
            ctx.read_from_server();
        }
        self
    }

    fn on_server_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        match self {
            HttpState::WaitRequest => Self::request(ctx, buf),
            HttpState::DataTransferMode => {
                transfer::on_server_read(ctx, buf);
                self
            }
            state => state,
        }
    }

    fn on_client_connect(self, ctx: &mut SessionContext) -> Self {
        match self {
            HttpState::ConnectionEstablished => {
                match ctx.route() {
                    Route::Inbound => ctx.write_response_to_server(),
                    Route::Outbound => ctx.write_response_to_client(),
                }
                HttpState::ReadyTransferData
            }
            state => state,
        }
    }

    fn on_client_error(self, ctx: &mut SessionContext, err: &io::Error) -> Self {
        match self {
            HttpState::ConnectionEstablished => {
                warn!(id = ctx.id(), target = %ctx.target(), error = %err, "upstream connect failed");
                Self::fail(ctx)
            }
            state => {
                ctx.close_on_error(Side::Client, err);
                state
            }
        }
    }

    fn on_server_write(self, ctx: &mut SessionContext) -> Self {
        match self {
            HttpState::ReadyTransferData => {
                transfer::start(ctx);
                HttpState::DataTransferMode
            }
            HttpState::DataTransferMode => {
                transfer::on_server_write(ctx);
                self
            }
            HttpState::Closing => {
                ctx.stop();
                self
            }
            state => state,
        }
    }

    fn on_client_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        if self == HttpState::DataTransferMode {
            transfer::on_client_read(ctx, buf);
        }
        self
    }

    fn on_client_write(self, ctx: &mut SessionContext) -> Self {
        match self {
            HttpState::ReadyTransferData => {
                transfer::start(ctx);
                HttpState::DataTransferMode
            }
            HttpState::DataTransferMode => {
                transfer::on_client_write(ctx);
                self
            }
            state => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::session::{Command, Session};

    fn commands(session: &mut Session<HttpState>) -> Vec<Command> {
        session.context_mut().take_commands().into()
    }

    #[test]
    fn connect_request_replies_200_after_upstream_connects() {
        let mut session = Session::<HttpState>::new(1);
        session.handle_on_accept();
        assert_eq!(commands(&mut session), vec![Command::ReadServer]);

        session.handle_server_read(Bytes::from_static(
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        ));
        assert_eq!(session.state(), HttpState::ConnectionEstablished);
        assert_eq!(
            commands(&mut session),
            vec![Command::Connect {
                host: "example.com".into(),
                service: "443".into()
            }]
        );

        session.handle_client_connect();
        assert_eq!(
            commands(&mut session),
            vec![Command::WriteServer(Bytes::from_static(HTTP_DONE))]
        );

        session.handle_server_write();
        assert_eq!(session.state(), HttpState::DataTransferMode);
        assert_eq!(
            commands(&mut session),
            vec![Command::ReadServer, Command::ReadClient]
        );
    }

    #[test]
    fn plain_request_is_forwarded_upstream() {
        let request = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut session = Session::<HttpState>::new(2);
        session.handle_on_accept();
        session.handle_server_read(Bytes::from_static(request));
        assert_eq!(
            commands(&mut session),
            vec![
                Command::ReadServer,
                Command::Connect {
                    host: "example.com".into(),
                    service: "80".into()
                }
            ]
        );

        session.handle_client_connect();
        assert_eq!(
            commands(&mut session),
            vec![Command::WriteClient(Bytes::from_static(request))]
        );
        assert_eq!(session.context().bytes_to_remote(), request.len() as u64);

        session.handle_client_write();
        assert_eq!(session.state(), HttpState::DataTransferMode);
    }

    #[test]
    fn malformed_request_gets_500_then_closes() {
        let mut session = Session::<HttpState>::new(3);
        session.handle_server_read(Bytes::from_static(b"BREW /pot HTTP/1.1\r\n\r\n"));
        assert_eq!(session.state(), HttpState::Closing);
        assert_eq!(
            commands(&mut session),
            vec![Command::WriteServer(Bytes::from_static(HTTP_ERROR_500))]
        );

        session.handle_server_write();
        assert_eq!(commands(&mut session), vec![Command::Stop]);
    }

    #[test]
    fn connect_without_host_gets_500_then_closes() {
        let mut session = Session::<HttpState>::new(5);
        session.handle_server_read(Bytes::from_static(
            b"CONNECT example.com:443 HTTP/1.1\r\n\r\n",
        ));
        assert_eq!(session.state(), HttpState::Closing);
        assert_eq!(
            commands(&mut session),
            vec![Command::WriteServer(Bytes::from_static(HTTP_ERROR_500))]
        );

        session.handle_server_write();
        assert_eq!(commands(&mut session), vec![Command::Stop]);
    }

    #[test]
    fn upstream_failure_gets_500() {
        let mut session = Session::<HttpState>::new(4);
        session.handle_server_read(Bytes::from_static(
            b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n",
        ));
        commands(&mut session);

        session.handle_client_error(&io::ErrorKind::ConnectionRefused.into());
        assert_eq!(session.state(), HttpState::Closing);
        assert_eq!(
            commands(&mut session),
            vec![Command::WriteServer(Bytes::from_static(HTTP_ERROR_500))]
        );
    }
}
