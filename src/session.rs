//! Per-connection context and the dispatch of stream events to the current
//! protocol state.
//!
//! Handlers never touch streams. Lifecycle operations on [`SessionContext`]
//! queue a [`Command`] that the manager applies once the handler returned.

use std::{collections::VecDeque, fmt, io};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    protocol::Reply,
    stream::{is_benign, ConnectionId, IoBuffer, Side},
};

/// An intent queued by a state handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, service: String },
    ReadServer,
    ReadClient,
    WriteServer(IoBuffer),
    WriteClient(IoBuffer),
    UdpAssociate,
    Stop,
}

/// Side that receives the staged response once the upstream is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Inbound,
    Outbound,
}

#[derive(Debug)]
pub struct SessionContext {
    id: ConnectionId,
    host: String,
    service: String,
    response: Vec<u8>,
    route: Route,
    bytes_to_remote: u64,
    bytes_to_local: u64,
    udp_supported: bool,
    udp_enabled: bool,
    commands: VecDeque<Command>,
}

impl SessionContext {
    pub fn new(id: ConnectionId) -> Self {
        SessionContext {
            id,
            host: String::new(),
            service: String::new(),
            response: Vec::new(),
            route: Route::default(),
            bytes_to_remote: 0,
            bytes_to_local: 0,
            udp_supported: false,
            udp_enabled: false,
            commands: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_endpoint(&mut self, host: impl Into<String>, service: impl Into<String>) {
        self.host = host.into();
        self.service = service.into();
    }

    /// `host:service`, bracketing IPv6 literals.
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.service)
        } else {
            format!("{}:{}", self.host, self.service)
        }
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn set_response(&mut self, response: impl Into<Vec<u8>>) {
        self.response = response.into();
    }

    /// Overwrites the code byte of a staged SOCKS5 reply.
    pub fn set_response_code(&mut self, reply: Reply) {
        if let Some(code) = self.response.get_mut(1) {
            *code = reply.to_u8();
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    pub fn bytes_to_remote(&self) -> u64 {
        self.bytes_to_remote
    }

    pub fn bytes_to_local(&self) -> u64 {
        self.bytes_to_local
    }

    pub fn add_bytes_to_remote(&mut self, n: usize) {
        self.bytes_to_remote += n as u64;
    }

    pub fn add_bytes_to_local(&mut self, n: usize) {
        self.bytes_to_local += n as u64;
    }

    pub fn udp_supported(&self) -> bool {
        self.udp_supported
    }

    pub fn set_udp_supported(&mut self, supported: bool) {
        self.udp_supported = supported;
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp_enabled
    }

    pub fn enable_udp(&mut self) {
        self.udp_enabled = true;
    }

    pub fn connect(&mut self) {
        self.commands.push_back(Command::Connect {
            host: self.host.clone(),
            service: self.service.clone(),
        });
    }

    pub fn stop(&mut self) {
        self.commands.push_back(Command::Stop);
    }

    pub fn read_from_server(&mut self) {
        self.commands.push_back(Command::ReadServer);
    }

    pub fn read_from_client(&mut self) {
        self.commands.push_back(Command::ReadClient);
    }

    pub fn write_to_server(&mut self, buf: IoBuffer) {
        self.commands.push_back(Command::WriteServer(buf));
    }

    pub fn write_to_client(&mut self, buf: IoBuffer) {
        self.commands.push_back(Command::WriteClient(buf));
    }

    pub fn udp_associate(&mut self) {
        self.commands.push_back(Command::UdpAssociate);
    }

    /// Sends the staged response to the inbound peer.
    pub fn write_response_to_server(&mut self) {
        let response = Bytes::copy_from_slice(&self.response);
        self.write_to_server(response);
    }

    /// Sends the staged response to the upstream.
    pub fn write_response_to_client(&mut self) {
        let response = Bytes::copy_from_slice(&self.response);
        self.add_bytes_to_remote(response.len());
        self.write_to_client(response);
    }

    /// Forwards bytes read from the inbound peer to the upstream.
    pub fn relay_to_remote(&mut self, buf: IoBuffer) {
        self.add_bytes_to_remote(buf.len());
        self.write_to_client(buf);
    }

    /// Forwards bytes read from the upstream to the inbound peer.
    pub fn relay_to_local(&mut self, buf: IoBuffer) {
        self.add_bytes_to_local(buf.len());
        self.write_to_server(buf);
    }

    /// Stops the session after a transport error, staying quiet when the
    /// peer simply went away.
    pub fn close_on_error(&mut self, side: Side, err: &io::Error) {
        if is_benign(err) {
            debug!(id = self.id, %side, error = %err, "connection closed by peer");
        } else {
            warn!(id = self.id, %side, error = %err, "transport error");
        }
        self.stop();
    }

    pub(crate) fn take_commands(&mut self) -> VecDeque<Command> {
        std::mem::take(&mut self.commands)
    }
}

/// One protocol's state graph.
///
/// Every handler returns the next state. Unhandled events keep the current
/// state; transport errors stop the session.
pub trait ProtocolState: Copy + PartialEq + fmt::Debug + Send + 'static {
    /// Protocol name used in log lines.
    const PROTOCOL: &'static str;

    fn initial() -> Self;

    fn on_accept(self, _ctx: &mut SessionContext) -> Self {
        self
    }

    fn on_server_read(self, _ctx: &mut SessionContext, _buf: IoBuffer) -> Self {
        self
    }

    fn on_server_write(self, _ctx: &mut SessionContext) -> Self {
        self
    }

    fn on_client_connect(self, _ctx: &mut SessionContext) -> Self {
        self
    }

    fn on_client_read(self, _ctx: &mut SessionContext, _buf: IoBuffer) -> Self {
        self
    }

    fn on_client_write(self, _ctx: &mut SessionContext) -> Self {
        self
    }

    fn on_server_error(self, ctx: &mut SessionContext, err: &io::Error) -> Self {
        ctx.close_on_error(Side::Server, err);
        self
    }

    fn on_client_error(self, ctx: &mut SessionContext, err: &io::Error) -> Self {
        ctx.close_on_error(Side::Client, err);
        self
    }

    fn on_udp_associate(self, _ctx: &mut SessionContext, _bound: io::Result<Vec<u8>>) -> Self {
        self
    }
}

#[derive(Debug)]
pub struct Session<S> {
    context: SessionContext,
    state: S,
}

impl<S: ProtocolState> Session<S> {
    pub fn new(id: ConnectionId) -> Self {
        Session {
            context: SessionContext::new(id),
            state: S::initial(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    pub fn change_state(&mut self, next: S) {
        if next != self.state {
            trace!(id = self.context.id, protocol = S::PROTOCOL, from = ?self.state, to = ?next, "state change");
            self.state = next;
        }
    }

    pub fn handle_on_accept(&mut self) {
        let next = self.state.on_accept(&mut self.context);
        self.change_state(next);
    }

    pub fn handle_server_read(&mut self, buf: IoBuffer) {
        let next = self.state.on_server_read(&mut self.context, buf);
        self.change_state(next);
    }

    pub fn handle_server_write(&mut self) {
        let next = self.state.on_server_write(&mut self.context);
        self.change_state(next);
    }

    pub fn handle_client_connect(&mut self) {
        let next = self.state.on_client_connect(&mut self.context);
        self.change_state(next);
    }

    pub fn handle_client_read(&mut self, buf: IoBuffer) {
        let next = self.state.on_client_read(&mut self.context, buf);
        self.change_state(next);
    }

    pub fn handle_client_write(&mut self) {
        let next = self.state.on_client_write(&mut self.context);
        self.change_state(next);
    }

    pub fn handle_server_error(&mut self, err: &io::Error) {
        let next = self.state.on_server_error(&mut self.context, err);
        self.change_state(next);
    }

    pub fn handle_client_error(&mut self, err: &io::Error) {
        let next = self.state.on_client_error(&mut self.context, err);
        self.change_state(next);
    }

    pub fn handle_udp_associate(&mut self, bound: io::Result<Vec<u8>>) {
        let next = self.state.on_udp_associate(&mut self.context, bound);
        self.change_state(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toggle {
        Off,
        On,
    }

    impl ProtocolState for Toggle {
        const PROTOCOL: &'static str = "toggle";

        fn initial() -> Self {
            Toggle::Off
        }

        fn on_accept(self, ctx: &mut SessionContext) -> Self {
            ctx.read_from_server();
            Toggle::On
        }
    }

    #[test]
    fn unhandled_events_keep_state() {
        let mut session = Session::<Toggle>::new(1);
        session.handle_server_write();
        session.handle_client_read(Bytes::from_static(b"x"));
        assert_eq!(session.state(), Toggle::Off);
        assert!(session.context_mut().take_commands().is_empty());

        session.handle_on_accept();
        assert_eq!(session.state(), Toggle::On);
        assert_eq!(
            session.context_mut().take_commands(),
            VecDeque::from([Command::ReadServer])
        );
    }

    #[test]
    fn errors_stop_by_default() {
        let mut session = Session::<Toggle>::new(2);
        session.handle_client_error(&io::ErrorKind::ConnectionReset.into());
        session.handle_server_error(&io::ErrorKind::InvalidData.into());
        assert_eq!(
            session.context_mut().take_commands(),
            VecDeque::from([Command::Stop, Command::Stop])
        );
    }

    #[test]
    fn response_code_patch_is_bounds_checked() {
        let mut ctx = SessionContext::new(3);
        ctx.set_response_code(Reply::GeneralFailure);
        assert!(ctx.response().is_empty());

        ctx.set_response(vec![0x05, 0x01, 0x00]);
        ctx.set_response_code(Reply::ConnectionRefused);
        assert_eq!(ctx.response(), &[0x05, 0x05, 0x00]);
    }

    #[test]
    fn relaying_counts_bytes() {
        let mut ctx = SessionContext::new(4);
        ctx.relay_to_remote(Bytes::from_static(b"abcd"));
        ctx.relay_to_local(Bytes::from_static(b"xy"));
        assert_eq!(ctx.bytes_to_remote(), 4);
        assert_eq!(ctx.bytes_to_local(), 2);

        ctx.set_endpoint("2001:db8::1", "443");
        assert_eq!(ctx.target(), "[2001:db8::1]:443");
    }
}
