use std::{
    io,
    net::{SocketAddr, UdpSocket as StdUdpSocket},
};

use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{
    duplex::Duplex, udp_relay::UdpRelay, ConnectionId, IoBuffer, Reporter, ServerStream, Stream,
};
use crate::protocol::endpoint_to_bytes;

enum UdpMode {
    Off,
    /// Socket bound, waiting for the SOCKS5 reply to go out.
    Bound(UdpSocket),
    Relaying(UdpRelay),
}

/// An accepted connection, optionally terminated with TLS.
pub struct InboundStream {
    reporter: Reporter,
    tcp: Option<TcpStream>,
    tls: Option<TlsAcceptor>,
    duplex: Duplex,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    udp: UdpMode,
}

impl InboundStream {
    pub fn new(tcp: TcpStream, tls: Option<TlsAcceptor>, reporter: Reporter) -> io::Result<Self> {
        let local_addr = tcp.local_addr()?;
        let peer_addr = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;

        Ok(InboundStream {
            reporter,
            tcp: Some(tcp),
            tls,
            duplex: Duplex::new(),
            local_addr,
            peer_addr,
            udp: UdpMode::Off,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Stream for InboundStream {
    fn id(&self) -> ConnectionId {
        self.reporter.id()
    }

    fn start(&mut self) {
        let (Some(tcp), Some(driver)) = (self.tcp.take(), self.duplex.take_driver()) else {
            debug!(id = self.id(), "server stream already started");
            return;
        };
        let reporter = self.reporter.clone();
        let tls = self.tls.clone();
        let cancel = self.duplex.cancel_token();

        tokio::spawn(async move {
            let Some(acceptor) = tls else {
                reporter.ready();
                driver.run(tcp, &reporter).await;
                return;
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = acceptor.accept(tcp) => accepted,
            };
            match accepted {
                Ok(stream) => {
                    debug!(id = reporter.id(), "tls handshake complete");
                    reporter.ready();
                    driver.run(stream, &reporter).await;
                }
                Err(err) => reporter.error(err),
            }
        });
    }

    fn stop(&mut self) {
        // The relay tasks hang off a child of this token.
        self.duplex.stop();
    }

    fn read(&mut self) {
        match &self.udp {
            UdpMode::Relaying(relay) => relay.read(),
            _ => {
                if !self.duplex.read() {
                    debug!(id = self.id(), "server read not issued");
                }
            }
        }
    }

    fn write(&mut self, buf: IoBuffer) {
        match std::mem::replace(&mut self.udp, UdpMode::Off) {
            UdpMode::Off => self.duplex.write(buf),
            UdpMode::Relaying(relay) => {
                relay.write(buf);
                self.udp = UdpMode::Relaying(relay);
            }
            UdpMode::Bound(socket) => {
                // The association reply; from here on the TCP connection only
                // signals the end of the association.
                self.duplex.write(buf);
                self.duplex.watch_close();
                let relay = UdpRelay::start(
                    socket,
                    self.peer_addr.ip(),
                    self.reporter.clone(),
                    self.duplex.cancel_token().child_token(),
                );
                debug!(id = self.id(), relay = ?relay.local_addr().ok(), "udp relay active");
                self.udp = UdpMode::Relaying(relay);
            }
        }
    }
}

impl ServerStream for InboundStream {
    fn udp_associate(&mut self) -> io::Result<Vec<u8>> {
        match &self.udp {
            UdpMode::Bound(socket) => return Ok(endpoint_to_bytes(socket.local_addr()?)),
            UdpMode::Relaying(relay) => return Ok(endpoint_to_bytes(relay.local_addr()?)),
            UdpMode::Off => {}
        }

        let socket = StdUdpSocket::bind(SocketAddr::new(self.local_addr.ip().to_canonical(), 0))?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        let bound = socket.local_addr()?;

        debug!(id = self.id(), %bound, "udp relay socket bound");
        self.udp = UdpMode::Bound(socket);
        Ok(endpoint_to_bytes(bound))
    }
}
