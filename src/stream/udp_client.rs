use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    resolver::Resolver, ClientStream, ConnectionId, IoBuffer, Reporter, Stream, MAX_DATAGRAM_SIZE,
};
use crate::protocol::{Addr, UdpMessage};

/// A datagram waiting for its destination name to resolve.
struct Unresolved {
    host: String,
    port: u16,
    payload: Bytes,
}

struct Queues {
    resolve: mpsc::UnboundedSender<Unresolved>,
    send: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

/// Upstream-facing half of a SOCKS5 UDP association.
///
/// Writes take complete SOCKS5 UDP requests and send their payload to the
/// destination in the header. Names go through a resolve queue and every
/// datagram through a send queue, each handling one item at a time. Reads
/// report upstream datagrams already wrapped in a SOCKS5 UDP header that
/// names the sender.
pub struct UdpClientStream<R> {
    reporter: Reporter,
    resolver: R,
    socket: Option<Arc<UdpSocket>>,
    queues: Option<Queues>,
    reading: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl<R: Resolver> UdpClientStream<R> {
    pub fn new(reporter: Reporter, resolver: R) -> Self {
        UdpClientStream {
            reporter,
            resolver,
            socket: None,
            queues: None,
            reading: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    fn bind() -> io::Result<UdpSocket> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }
}

impl<R: Resolver> Stream for UdpClientStream<R> {
    fn id(&self) -> ConnectionId {
        self.reporter.id()
    }

    fn start(&mut self) {
        if self.socket.is_some() {
            debug!(id = self.id(), "udp client already started");
            return;
        }
        let socket = match Self::bind() {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                self.reporter.error(err);
                return;
            }
        };

        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        tokio::spawn(resolve_queue(
            self.resolver.clone(),
            resolve_rx,
            send_tx.clone(),
            self.id(),
            self.cancel.clone(),
        ));
        tokio::spawn(send_queue(
            socket.clone(),
            send_rx,
            self.reporter.clone(),
            self.cancel.clone(),
        ));

        debug!(id = self.id(), local = ?socket.local_addr().ok(), "udp client bound");
        self.socket = Some(socket);
        self.queues = Some(Queues {
            resolve: resolve_tx,
            send: send_tx,
        });
        self.reporter.connected();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        self.queues = None;
    }

    fn read(&mut self) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        if self.reading.swap(true, Ordering::AcqRel) {
            debug!(id = self.id(), "udp client read already in progress");
            return;
        }
        let reporter = self.reporter.clone();
        let reading = self.reading.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = socket.recv_from(&mut buf) => received,
            };
            reading.store(false, Ordering::Release);
            match received {
                Ok((n, from)) => {
                    let wrapped = UdpMessage {
                        fragment_number: 0,
                        dst: from.into(),
                        data: &buf[..n],
                    };
                    reporter.read(Bytes::from(wrapped.as_bytes()));
                }
                Err(err) => reporter.error(err),
            }
        });
    }

    fn write(&mut self, buf: IoBuffer) {
        let id = self.id();
        let Some(queues) = &self.queues else {
            debug!(id, "udp client not started, dropping datagram");
            return;
        };
        let message = match UdpMessage::parse(&buf) {
            Ok(message) => message,
            Err(err) => {
                warn!(id, error = %err, "dropping malformed udp datagram");
                return;
            }
        };
        if message.is_fragment() {
            warn!(id, fragment = message.fragment_number, "dropping fragmented udp datagram");
            return;
        }

        let payload = buf.slice(message.header_len()..);
        let port = message.dst.port;
        let queued = match message.dst.addr {
            Addr::Ipv4(ip) => queues.send.send((SocketAddr::from((ip, port)), payload)).is_ok(),
            Addr::Ipv6(ip) => {
                warn!(id, %ip, "dropping udp datagram for ipv6 destination");
                return;
            }
            Addr::Domain(host) => queues
                .resolve
                .send(Unresolved {
                    host,
                    port,
                    payload,
                })
                .is_ok(),
        };
        if !queued {
            debug!(id, "udp client stopped, dropping datagram");
        }
    }
}

impl<R: Resolver> ClientStream for UdpClientStream<R> {
    /// Each datagram names its own destination.
    fn set_target(&mut self, _host: &str, _service: &str) {}
}

async fn resolve_queue<R: Resolver>(
    resolver: R,
    mut pending: mpsc::UnboundedReceiver<Unresolved>,
    send: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    id: ConnectionId,
    cancel: CancellationToken,
) {
    let resolving = async {
        while let Some(Unresolved {
            host,
            port,
            payload,
        }) = pending.recv().await
        {
            let addrs = match resolver.resolve(&host, port).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    warn!(id, %host, error = %err, "dropping udp datagram, resolution failed");
                    continue;
                }
            };
            // The socket is IPv4 only.
            let Some(addr) = addrs.into_iter().find(SocketAddr::is_ipv4) else {
                warn!(id, %host, "dropping udp datagram, no ipv4 address");
                continue;
            };
            if send.send((addr, payload)).is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = resolving => {}
    }
}

async fn send_queue(
    socket: Arc<UdpSocket>,
    mut outgoing: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    reporter: Reporter,
    cancel: CancellationToken,
) {
    let sending = async {
        while let Some((addr, payload)) = outgoing.recv().await {
            match socket.send_to(&payload, addr).await {
                Ok(_) => reporter.written(),
                Err(err) => {
                    reporter.error(err);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sending => {}
    }
}
