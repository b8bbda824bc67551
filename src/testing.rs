//! Stream doubles that record what the manager asks of them.

use std::{
    collections::HashSet,
    io,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    manager::{SessionSettings, StreamManager},
    session::ProtocolState,
    stream::{
        ClientStream, Completion, ConnectionId, Event, EventSender, IoBuffer, Reporter,
        ServerStream, Side, Stream, StreamFactory,
    },
};

pub(crate) const UDP_BOUND: [u8; 6] = [127, 0, 0, 1, 0x13, 0x88];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Start(Side),
    Stop(Side),
    Read(Side),
    Write(Side, IoBuffer),
    Target { host: String, service: String, udp: bool },
    UdpAssociate,
}

#[derive(Default)]
struct JournalState {
    ops: Vec<(ConnectionId, Op)>,
    reading: HashSet<(ConnectionId, Side)>,
    overlapping_reads: usize,
    udp_bind_error: Option<io::ErrorKind>,
}

/// Shared log of stream calls. A read issued while one is still outstanding
/// on the same stream is counted as a violation.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<JournalState>>);

impl Journal {
    fn record(&self, id: ConnectionId, op: Op) {
        let mut state = self.0.lock().unwrap();
        if let Op::Read(side) = op {
            if !state.reading.insert((id, side)) {
                state.overlapping_reads += 1;
            }
        }
        state.ops.push((id, op));
    }

    fn read_finished(&self, id: ConnectionId, side: Side) {
        self.0.lock().unwrap().reading.remove(&(id, side));
    }

    pub fn take(&self) -> Vec<(ConnectionId, Op)> {
        std::mem::take(&mut self.0.lock().unwrap().ops)
    }

    /// Ops recorded for `id`, draining the whole journal.
    pub fn take_for(&self, id: ConnectionId) -> Vec<Op> {
        self.take()
            .into_iter()
            .filter(|(op_id, _)| *op_id == id)
            .map(|(_, op)| op)
            .collect()
    }

    pub fn overlapping_reads(&self) -> usize {
        self.0.lock().unwrap().overlapping_reads
    }

    pub fn fail_udp_bind(&self, kind: io::ErrorKind) {
        self.0.lock().unwrap().udp_bind_error = Some(kind);
    }
}

pub(crate) struct MockStream {
    id: ConnectionId,
    side: Side,
    udp: bool,
    journal: Journal,
}

impl MockStream {
    pub fn server(id: ConnectionId, journal: Journal) -> Self {
        MockStream {
            id,
            side: Side::Server,
            udp: false,
            journal,
        }
    }
}

impl Stream for MockStream {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn start(&mut self) {
        self.journal.record(self.id, Op::Start(self.side));
    }

    fn stop(&mut self) {
        self.journal.record(self.id, Op::Stop(self.side));
    }

    fn read(&mut self) {
        self.journal.record(self.id, Op::Read(self.side));
    }

    fn write(&mut self, buf: IoBuffer) {
        self.journal.record(self.id, Op::Write(self.side, buf));
    }
}

impl ServerStream for MockStream {
    fn udp_associate(&mut self) -> io::Result<Vec<u8>> {
        self.journal.record(self.id, Op::UdpAssociate);
        match self.journal.0.lock().unwrap().udp_bind_error {
            Some(kind) => Err(kind.into()),
            None => Ok(UDP_BOUND.to_vec()),
        }
    }
}

impl ClientStream for MockStream {
    fn set_target(&mut self, host: &str, service: &str) {
        self.journal.record(
            self.id,
            Op::Target {
                host: host.to_owned(),
                service: service.to_owned(),
                udp: self.udp,
            },
        );
    }
}

pub(crate) struct MockFactory {
    journal: Journal,
}

impl StreamFactory for MockFactory {
    fn tcp_client(&self, reporter: Reporter) -> Box<dyn ClientStream> {
        Box::new(MockStream {
            id: reporter.id(),
            side: Side::Client,
            udp: false,
            journal: self.journal.clone(),
        })
    }

    fn udp_client(&self, reporter: Reporter) -> Box<dyn ClientStream> {
        Box::new(MockStream {
            id: reporter.id(),
            side: Side::Client,
            udp: true,
            journal: self.journal.clone(),
        })
    }
}

/// Drives a manager with synthetic completions.
pub(crate) struct Harness<S: ProtocolState> {
    pub manager: StreamManager<S, MockFactory>,
    pub journal: Journal,
    _events: mpsc::UnboundedReceiver<Event>,
}

impl<S: ProtocolState> Harness<S> {
    pub fn new(settings: SessionSettings) -> Self {
        let journal = Journal::default();
        let (events, rx) = EventSender::channel();
        let factory = MockFactory {
            journal: journal.clone(),
        };
        Harness {
            manager: StreamManager::new(settings, factory, events),
            journal,
            _events: rx,
        }
    }

    /// Accepts connection `id` and reports its server side ready.
    pub fn accept(&mut self, id: ConnectionId) {
        let stream = MockStream::server(id, self.journal.clone());
        self.manager.handle_event(Event::Accept(Box::new(stream)));
        self.complete(id, Side::Server, Completion::Ready);
    }

    pub fn complete(&mut self, id: ConnectionId, side: Side, completion: Completion) {
        if matches!(completion, Completion::Read(_) | Completion::Error(_)) {
            self.journal.read_finished(id, side);
        }
        self.manager.handle_event(Event::Completion {
            id,
            side,
            completion,
        });
    }

    pub fn server_read(&mut self, id: ConnectionId, data: &[u8]) {
        self.complete(id, Side::Server, Completion::Read(Bytes::copy_from_slice(data)));
    }

    pub fn server_written(&mut self, id: ConnectionId) {
        self.complete(id, Side::Server, Completion::Written);
    }

    pub fn client_connected(&mut self, id: ConnectionId) {
        self.complete(id, Side::Client, Completion::Connected);
    }

    pub fn client_read(&mut self, id: ConnectionId, data: &[u8]) {
        self.complete(id, Side::Client, Completion::Read(Bytes::copy_from_slice(data)));
    }

    pub fn client_written(&mut self, id: ConnectionId) {
        self.complete(id, Side::Client, Completion::Written);
    }

    pub fn client_error(&mut self, id: ConnectionId, kind: io::ErrorKind) {
        self.complete(id, Side::Client, Completion::Error(kind.into()));
    }

    pub fn server_error(&mut self, id: ConnectionId, kind: io::ErrorKind) {
        self.complete(id, Side::Server, Completion::Error(kind.into()));
    }
}
