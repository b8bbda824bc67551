use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{IoBuffer, Reporter, MAX_BUFFER_SIZE};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadRequest {
    Data,
    /// Any byte or EOF ends the connection; used on the control connection of
    /// a UDP association.
    WatchClose,
}

/// Handle side of a byte stream driven by a background task.
///
/// Reads and writes are requests on channels; the task that owns the
/// transport performs them one at a time per direction and reports each
/// completion.
pub(super) struct Duplex {
    read_tx: mpsc::UnboundedSender<ReadRequest>,
    write_tx: mpsc::UnboundedSender<IoBuffer>,
    reading: Arc<AtomicBool>,
    cancel: CancellationToken,
    driver: Option<Driver>,
}

impl Duplex {
    pub fn new() -> Self {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let reading = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        Duplex {
            read_tx,
            write_tx,
            reading: reading.clone(),
            cancel: cancel.clone(),
            driver: Some(Driver {
                read_rx,
                write_rx,
                reading,
                cancel,
            }),
        }
    }

    /// The driver half; `None` once the stream has been started.
    pub fn take_driver(&mut self) -> Option<Driver> {
        self.driver.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `false` when a read is already outstanding or the driver has
    /// finished.
    pub fn read(&self) -> bool {
        if self.reading.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.read_tx.send(ReadRequest::Data).is_err() {
            self.reading.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn watch_close(&self) {
        if self.read_tx.send(ReadRequest::WatchClose).is_err() {
            debug!("watch close on a finished stream");
        }
    }

    pub fn write(&self, buf: IoBuffer) {
        if self.write_tx.send(buf).is_err() {
            trace!("write on a finished stream");
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

pub(super) struct Driver {
    read_rx: mpsc::UnboundedReceiver<ReadRequest>,
    write_rx: mpsc::UnboundedReceiver<IoBuffer>,
    reading: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Driver {
    /// Serves read and write requests on `io` until the stream is stopped or
    /// both directions failed.
    pub async fn run<S>(self, io: S, reporter: &Reporter)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Driver {
            mut read_rx,
            mut write_rx,
            reading,
            cancel,
        } = self;
        let (mut reader, mut writer) = tokio::io::split(io);

        {
            let read_loop = async {
                while let Some(request) = read_rx.recv().await {
                    let mut buf = BytesMut::with_capacity(MAX_BUFFER_SIZE);
                    let result = reader.read_buf(&mut buf).await;
                    reading.store(false, Ordering::Release);

                    match (request, result) {
                        (_, Err(err)) => {
                            reporter.error(err);
                            break;
                        }
                        (_, Ok(0)) => {
                            reporter.error(io::ErrorKind::UnexpectedEof.into());
                            break;
                        }
                        (ReadRequest::Data, Ok(_)) => reporter.read(buf.freeze()),
                        (ReadRequest::WatchClose, Ok(_)) => {
                            reporter.error(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected data on udp associate control connection",
                            ));
                            break;
                        }
                    }
                }
            };

            let write_loop = async {
                while let Some(buf) = write_rx.recv().await {
                    let result = async {
                        writer.write_all(&buf).await?;
                        writer.flush().await
                    }
                    .await;

                    match result {
                        Ok(()) => reporter.written(),
                        Err(err) => {
                            reporter.error(err);
                            break;
                        }
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => trace!(id = reporter.id(), side = %reporter.side(), "stream cancelled"),
                _ = async { tokio::join!(read_loop, write_loop) } => {}
            }
        }

        let _ = time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    }
}
