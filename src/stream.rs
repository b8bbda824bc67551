//! Duplex streams and the completion events they report.
//!
//! A stream never calls into a session. Every operation it finishes is sent
//! as an [`Event`] tagged with the connection id to the manager's event loop,
//! which looks the id up again before acting on it.

use std::{fmt, io};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

mod duplex;
mod inbound;
mod resolver;
mod tcp_client;
mod udp_client;
mod udp_relay;

pub use inbound::InboundStream;
pub use resolver::{Resolver, SystemResolver};
pub use tcp_client::TcpClientStream;
pub use udp_client::UdpClientStream;

pub type ConnectionId = u64;
pub type IoBuffer = Bytes;

/// Largest chunk read from a TCP or TLS stream at once.
pub const MAX_BUFFER_SIZE: usize = 0x4000;
/// Largest UDP datagram accepted by the relay sockets.
pub const MAX_DATAGRAM_SIZE: usize = 0xFFFF;

/// Which end of a connection a stream serves. `Server` is the accepted
/// inbound connection, `Client` is the outbound connection the proxy opens
/// toward the upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Server,
    Client,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Server => f.write_str("server"),
            Side::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug)]
pub enum Completion {
    /// Inbound setup (TLS handshake) finished.
    Ready,
    /// Outbound connection established.
    Connected,
    Read(IoBuffer),
    Written,
    Error(io::Error),
}

pub enum Event {
    Accept(Box<dyn ServerStream>),
    Completion {
        id: ConnectionId,
        side: Side,
        completion: Completion,
    },
    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Accept(stream) => f.debug_tuple("Accept").field(&stream.id()).finish(),
            Event::Completion {
                id,
                side,
                completion,
            } => f
                .debug_struct("Completion")
                .field("id", id)
                .field("side", side)
                .field("completion", completion)
                .finish(),
            Event::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender(tx), rx)
    }

    pub fn accept(&self, stream: Box<dyn ServerStream>) {
        self.send(Event::Accept(stream));
    }

    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    pub fn reporter(&self, id: ConnectionId, side: Side) -> Reporter {
        Reporter {
            id,
            side,
            events: self.clone(),
        }
    }

    fn send(&self, event: Event) {
        if self.0.send(event).is_err() {
            trace!("event loop is gone, dropping event");
        }
    }
}

/// Reports the completions of one stream.
#[derive(Clone)]
pub struct Reporter {
    id: ConnectionId,
    side: Side,
    events: EventSender,
}

impl Reporter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn ready(&self) {
        self.complete(Completion::Ready);
    }

    pub fn connected(&self) {
        self.complete(Completion::Connected);
    }

    pub fn read(&self, buf: IoBuffer) {
        self.complete(Completion::Read(buf));
    }

    pub fn written(&self) {
        self.complete(Completion::Written);
    }

    pub fn error(&self, err: io::Error) {
        self.complete(Completion::Error(err));
    }

    fn complete(&self, completion: Completion) {
        self.events.send(Event::Completion {
            id: self.id,
            side: self.side,
            completion,
        });
    }
}

pub trait Stream: Send {
    fn id(&self) -> ConnectionId;

    /// Begins setup; reports exactly one `Ready`/`Connected` or one error.
    fn start(&mut self);

    /// Cancels in-flight operations and releases the transport. Idempotent.
    fn stop(&mut self);

    /// Issues one read. A read issued while another is outstanding is ignored.
    fn read(&mut self);

    /// Queues one write; writes complete in order.
    fn write(&mut self, buf: IoBuffer);
}

pub trait ServerStream: Stream {
    /// Binds the UDP relay socket for a SOCKS5 UDP ASSOCIATE and returns its
    /// address as raw ADDR+PORT bytes. The next write switches the stream to
    /// relaying datagrams.
    fn udp_associate(&mut self) -> io::Result<Vec<u8>>;
}

pub trait ClientStream: Stream {
    fn set_target(&mut self, host: &str, service: &str);
}

/// Builds outbound streams for the manager.
pub trait StreamFactory: Send {
    fn tcp_client(&self, reporter: Reporter) -> Box<dyn ClientStream>;
    fn udp_client(&self, reporter: Reporter) -> Box<dyn ClientStream>;
}

#[derive(Debug, Clone, Default)]
pub struct TransportFactory<R> {
    resolver: R,
}

impl<R: Resolver> TransportFactory<R> {
    pub fn new(resolver: R) -> Self {
        TransportFactory { resolver }
    }
}

impl<R: Resolver> StreamFactory for TransportFactory<R> {
    fn tcp_client(&self, reporter: Reporter) -> Box<dyn ClientStream> {
        Box::new(TcpClientStream::new(reporter, self.resolver.clone()))
    }

    fn udp_client(&self, reporter: Reporter) -> Box<dyn ClientStream> {
        Box::new(UdpClientStream::new(reporter, self.resolver.clone()))
    }
}

/// Errors that mean the peer went away rather than something going wrong.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
    ) || is_cancelled_or_closed(err)
}

#[cfg(unix)]
fn is_cancelled_or_closed(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ECANCELED | libc::EBADF))
}

#[cfg(not(unix))]
fn is_cancelled_or_closed(_err: &io::Error) -> bool {
    false
}
