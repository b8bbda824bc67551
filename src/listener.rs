//! Accept loop and the manager task behind it.

use std::time::Duration;

use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{Mode, ServerConfig},
    manager::StreamManager,
    state::{HttpState, Socks5State, TunnelState},
    stream::{
        ConnectionId, Event, EventSender, InboundStream, Side, SystemResolver, TransportFactory,
    },
    Result,
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds `config.listen` and serves until `shutdown` is cancelled.
pub async fn serve(
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    serve_on(listener, config, tls, shutdown).await
}

/// Serves on an already bound listener. Every live session is stopped
/// before this returns.
pub async fn serve_on(
    listener: TcpListener,
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        address = %listener.local_addr()?,
        mode = ?config.mode,
        tls = tls.is_some(),
        udp_associate = config.udp_associate,
        "proxy started"
    );

    let (events, rx) = EventSender::channel();
    let manager = spawn_manager(&config, events.clone(), rx);
    let mut next_id: ConnectionId = 0;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((tcp, peer)) => {
                next_id += 1;
                let reporter = events.reporter(next_id, Side::Server);
                match InboundStream::new(tcp, tls.clone(), reporter) {
                    Ok(stream) => {
                        debug!(id = next_id, peer = %stream.peer_addr(), "connection accepted");
                        events.accept(Box::new(stream));
                    }
                    Err(err) => warn!(%peer, error = %err, "failed to set up connection"),
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!("shutting down");
    events.shutdown();
    if let Err(err) = manager.await {
        warn!(error = %err, "stream manager task failed");
    }
    Ok(())
}

fn spawn_manager(
    config: &ServerConfig,
    events: EventSender,
    rx: mpsc::UnboundedReceiver<Event>,
) -> JoinHandle<()> {
    let settings = config.session_settings();
    let factory = TransportFactory::new(SystemResolver);
    match config.mode {
        Mode::Http => {
            tokio::spawn(StreamManager::<HttpState, _>::new(settings, factory, events).run(rx))
        }
        Mode::Socks5 => {
            tokio::spawn(StreamManager::<Socks5State, _>::new(settings, factory, events).run(rx))
        }
        Mode::Tun => {
            tokio::spawn(StreamManager::<TunnelState, _>::new(settings, factory, events).run(rx))
        }
    }
}
