use std::io;

use tokio::net::TcpStream;
use tracing::debug;

use super::{
    duplex::Duplex,
    resolver::{parse_service, Resolver},
    ClientStream, ConnectionId, IoBuffer, Reporter, Stream,
};

/// Outbound TCP connection to the session's target.
pub struct TcpClientStream<R> {
    reporter: Reporter,
    resolver: R,
    target: Option<(String, String)>,
    duplex: Duplex,
}

impl<R: Resolver> TcpClientStream<R> {
    pub fn new(reporter: Reporter, resolver: R) -> Self {
        TcpClientStream {
            reporter,
            resolver,
            target: None,
            duplex: Duplex::new(),
        }
    }
}

impl<R: Resolver> Stream for TcpClientStream<R> {
    fn id(&self) -> ConnectionId {
        self.reporter.id()
    }

    fn start(&mut self) {
        let Some(driver) = self.duplex.take_driver() else {
            debug!(id = self.id(), "client stream already started");
            return;
        };
        let reporter = self.reporter.clone();
        let resolver = self.resolver.clone();
        let target = self.target.clone();
        let cancel = self.duplex.cancel_token();

        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                connected = connect(&resolver, target) => connected,
            };
            match connected {
                Ok(stream) => {
                    debug!(
                        id = reporter.id(),
                        peer = ?stream.peer_addr().ok(),
                        "upstream connected"
                    );
                    reporter.connected();
                    driver.run(stream, &reporter).await;
                }
                Err(err) => reporter.error(err),
            }
        });
    }

    fn stop(&mut self) {
        self.duplex.stop();
    }

    fn read(&mut self) {
        if !self.duplex.read() {
            debug!(id = self.id(), "client read not issued");
        }
    }

    fn write(&mut self, buf: IoBuffer) {
        self.duplex.write(buf);
    }
}

impl<R: Resolver> ClientStream for TcpClientStream<R> {
    fn set_target(&mut self, host: &str, service: &str) {
        self.target = Some((host.to_owned(), service.to_owned()));
    }
}

/// Tries every resolved address in order, returning the last error if none
/// accepts the connection.
async fn connect<R: Resolver>(
    resolver: &R,
    target: Option<(String, String)>,
) -> io::Result<TcpStream> {
    let (host, service) = target
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no upstream target set"))?;
    let port = parse_service(&service)?;

    let mut last_err = None;
    for addr in resolver.resolve(&host, port).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
    }))
}
