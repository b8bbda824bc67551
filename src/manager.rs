//! The registry of live sessions and the single loop that feeds them events.

use std::{
    collections::{HashMap, VecDeque},
    io,
};

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{
    session::{Command, ProtocolState, Session},
    stream::{
        ClientStream, Completion, ConnectionId, Event, EventSender, IoBuffer, ServerStream, Side,
        StreamFactory,
    },
};

/// Per-listener settings applied to every new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Fixed upstream for tunnel mode.
    pub target: Option<(String, String)>,
    /// Whether SOCKS5 UDP ASSOCIATE is allowed.
    pub udp_associate: bool,
}

struct Entry<S> {
    server: Box<dyn ServerStream>,
    client: Option<Box<dyn ClientStream>>,
    session: Session<S>,
}

/// Owns every session and both of its streams, keyed by connection id.
///
/// Completions are looked up by id again when they arrive, so events for a
/// session that has been stopped in the meantime are dropped. Commands a
/// handler queues are applied after it returns, one at a time.
pub struct StreamManager<S, F> {
    settings: SessionSettings,
    factory: F,
    events: EventSender,
    entries: HashMap<ConnectionId, Entry<S>>,
    pending: VecDeque<(ConnectionId, Command)>,
}

impl<S: ProtocolState, F: StreamFactory> StreamManager<S, F> {
    pub fn new(settings: SessionSettings, factory: F, events: EventSender) -> Self {
        StreamManager {
            settings,
            factory,
            events,
            entries: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Processes events until shutdown is requested or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                return;
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the manager has shut down.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Accept(server) => self.on_accept(server),
            Event::Completion {
                id,
                side,
                completion,
            } => self.on_completion(id, side, completion),
            Event::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    pub fn on_accept(&mut self, mut server: Box<dyn ServerStream>) {
        let id = server.id();
        let mut session = Session::new(id);
        let ctx = session.context_mut();
        if let Some((host, service)) = &self.settings.target {
            ctx.set_endpoint(host.as_str(), service.as_str());
        }
        ctx.set_udp_supported(self.settings.udp_associate);

        server.start();
        self.entries.insert(
            id,
            Entry {
                server,
                client: None,
                session,
            },
        );
        debug!(
            id,
            protocol = S::PROTOCOL,
            live_sessions = self.entries.len(),
            "session accepted"
        );
    }

    fn on_completion(&mut self, id: ConnectionId, side: Side, completion: Completion) {
        if !self.entries.contains_key(&id) {
            trace!(id, %side, ?completion, "dropping completion for closed session");
            return;
        }

        match (side, completion) {
            (Side::Server, Completion::Ready) => self.dispatch(id, |s| s.handle_on_accept()),
            (Side::Server, Completion::Read(buf)) => {
                self.dispatch(id, |s| s.handle_server_read(buf))
            }
            (Side::Server, Completion::Written) => self.dispatch(id, |s| s.handle_server_write()),
            (Side::Server, Completion::Error(err)) => {
                self.dispatch(id, |s| s.handle_server_error(&err))
            }
            (Side::Client, Completion::Connected) => {
                self.dispatch(id, |s| s.handle_client_connect())
            }
            (Side::Client, Completion::Read(buf)) => {
                self.dispatch(id, |s| s.handle_client_read(buf))
            }
            (Side::Client, Completion::Written) => self.dispatch(id, |s| s.handle_client_write()),
            (Side::Client, Completion::Error(err)) => {
                self.dispatch(id, |s| s.handle_client_error(&err))
            }
            (side, completion) => {
                debug!(id, %side, ?completion, "unexpected completion");
                return;
            }
        }
        self.drain();
    }

    /// Runs one handler and queues the commands it produced.
    fn dispatch(&mut self, id: ConnectionId, handler: impl FnOnce(&mut Session<S>)) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        handler(&mut entry.session);
        let commands = entry.session.context_mut().take_commands();
        self.pending
            .extend(commands.into_iter().map(|command| (id, command)));
    }

    fn drain(&mut self) {
        while let Some((id, command)) = self.pending.pop_front() {
            self.apply(id, command);
        }
    }

    fn apply(&mut self, id: ConnectionId, command: Command) {
        match command {
            Command::Connect { host, service } => self.connect(id, &host, &service),
            Command::ReadServer => self.read_server(id),
            Command::ReadClient => self.read_client(id),
            Command::WriteServer(buf) => self.write_server(id, buf),
            Command::WriteClient(buf) => self.write_client(id, buf),
            Command::UdpAssociate => {
                if let Some(bound) = self.udp_associate(id) {
                    self.dispatch(id, |s| s.handle_udp_associate(bound));
                }
            }
            Command::Stop => {
                self.stop(id);
            }
        }
    }

    /// Opens the outbound stream of `id`, UDP if the session relays
    /// datagrams. A session connects at most once.
    pub fn connect(&mut self, id: ConnectionId, host: &str, service: &str) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.client.is_some() {
            debug!(id, "upstream already connecting");
            return;
        }

        let reporter = self.events.reporter(id, Side::Client);
        let mut client = if entry.session.context().udp_enabled() {
            self.factory.udp_client(reporter)
        } else {
            self.factory.tcp_client(reporter)
        };
        debug!(id, host, service, "connecting upstream");
        client.set_target(host, service);
        client.start();
        entry.client = Some(client);
    }

    pub fn read_server(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.server.read();
        }
    }

    pub fn read_client(&mut self, id: ConnectionId) {
        if let Some(client) = self.entries.get_mut(&id).and_then(|e| e.client.as_mut()) {
            client.read();
        }
    }

    pub fn write_server(&mut self, id: ConnectionId, buf: IoBuffer) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.server.write(buf);
        }
    }

    pub fn write_client(&mut self, id: ConnectionId, buf: IoBuffer) {
        if let Some(client) = self.entries.get_mut(&id).and_then(|e| e.client.as_mut()) {
            client.write(buf);
        }
    }

    pub fn udp_associate(&mut self, id: ConnectionId) -> Option<io::Result<Vec<u8>>> {
        self.entries
            .get_mut(&id)
            .map(|entry| entry.server.udp_associate())
    }

    /// Stops both streams of `id` and forgets the session. Returns `false` if
    /// there was nothing to stop.
    pub fn stop(&mut self, id: ConnectionId) -> bool {
        let Some(mut entry) = self.entries.remove(&id) else {
            return false;
        };
        entry.server.stop();
        if let Some(client) = entry.client.as_mut() {
            client.stop();
        }

        let ctx = entry.session.context();
        info!(
            id,
            protocol = S::PROTOCOL,
            target = %ctx.target(),
            rx_bytes = ctx.bytes_to_local(),
            tx_bytes = ctx.bytes_to_remote(),
            live_sessions = self.entries.len(),
            "session closed"
        );
        true
    }

    /// Stops every live session.
    pub fn shutdown(&mut self) {
        let ids: Vec<_> = self.entries.keys().copied().collect();
        if !ids.is_empty() {
            info!(sessions = ids.len(), "stopping live sessions");
        }
        for id in ids {
            self.stop(id);
        }
        self.pending.clear();
    }

    pub fn session(&self, id: ConnectionId) -> Option<&Session<S>> {
        self.entries.get(&id).map(|entry| &entry.session)
    }

    pub fn session_count(&self) -> usize {
        self.entries.len()
    }
}
