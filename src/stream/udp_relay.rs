use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{IoBuffer, Reporter, MAX_DATAGRAM_SIZE};

/// Client-facing half of a SOCKS5 UDP association.
///
/// Datagrams are only accepted from the IP of the TCP control connection;
/// the last sender becomes the destination of relayed replies.
pub(super) struct UdpRelay {
    socket: Arc<UdpSocket>,
    reporter: Reporter,
    peer_ip: IpAddr,
    client: Arc<watch::Sender<Option<SocketAddr>>>,
    reading: Arc<AtomicBool>,
    replies: mpsc::UnboundedSender<IoBuffer>,
    cancel: CancellationToken,
}

impl UdpRelay {
    pub fn start(
        socket: UdpSocket,
        peer_ip: IpAddr,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        let socket = Arc::new(socket);
        let (client, client_rx) = watch::channel(None);
        let (replies, reply_rx) = mpsc::unbounded_channel();

        tokio::spawn(send_replies(
            socket.clone(),
            reply_rx,
            client_rx,
            reporter.clone(),
            cancel.clone(),
        ));

        UdpRelay {
            socket,
            reporter,
            peer_ip: peer_ip.to_canonical(),
            client: Arc::new(client),
            reading: Arc::new(AtomicBool::new(false)),
            replies,
            cancel,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn read(&self) {
        if self.reading.swap(true, Ordering::AcqRel) {
            debug!(id = self.reporter.id(), "udp read already in progress");
            return;
        }

        let socket = self.socket.clone();
        let reporter = self.reporter.clone();
        let client = self.client.clone();
        let reading = self.reading.clone();
        let cancel = self.cancel.clone();
        let peer_ip = self.peer_ip;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((_, from)) if from.ip().to_canonical() != peer_ip => {
                        debug!(id = reporter.id(), %from, "ignoring datagram from unexpected source");
                    }
                    Ok((n, from)) => {
                        client.send_replace(Some(from));
                        reading.store(false, Ordering::Release);
                        reporter.read(Bytes::copy_from_slice(&buf[..n]));
                        return;
                    }
                    Err(err) => {
                        reading.store(false, Ordering::Release);
                        reporter.error(err);
                        return;
                    }
                }
            }
        });
    }

    pub fn write(&self, buf: IoBuffer) {
        if self.replies.send(buf).is_err() {
            debug!(id = self.reporter.id(), "udp relay closed, dropping datagram");
        }
    }
}

/// Sends replies to the client one at a time.
async fn send_replies(
    socket: Arc<UdpSocket>,
    mut replies: mpsc::UnboundedReceiver<IoBuffer>,
    client: watch::Receiver<Option<SocketAddr>>,
    reporter: Reporter,
    cancel: CancellationToken,
) {
    let sending = async {
        while let Some(buf) = replies.recv().await {
            let destination = *client.borrow();
            let Some(destination) = destination else {
                debug!(id = reporter.id(), "client endpoint unknown, dropping datagram");
                continue;
            };
            match socket.send_to(&buf, destination).await {
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
