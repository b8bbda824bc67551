#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, time::Duration};

use multiproxy::{
    config::{Mode, ServerConfig},
    listener,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Proxy {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<multiproxy::Result<()>>,
}

impl Proxy {
    pub async fn start(mode: Mode, target: Option<SocketAddr>, udp_associate: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            listen: addr.to_string(),
            mode,
            tls: None,
            target: target.map(|t| (t.ip().to_string(), t.port().to_string())),
            udp_associate,
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener::serve_on(listener, config, None, shutdown.clone()));
        Proxy {
            addr,
            shutdown,
            task,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        within(self.task).await.unwrap().unwrap();
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

/// A TCP server that echoes everything back on each connection.
pub async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A UDP server that sends every datagram back to its sender.
pub async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// A local port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    within(stream.read_exact(&mut buf)).await.unwrap();
    buf
}

/// Waits for the proxy to close the connection.
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match within(stream.read(&mut buf)).await {
        Ok(0) => {}
        Err(_) => {}
        Ok(n) => panic!("expected close, got {:?}", &buf[..n]),
    }
}

/// Sends `payload` and expects it back, reading while still writing.
pub async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    let (mut reader, mut writer) = stream.split();
    let mut echoed = vec![0u8; payload.len()];
    let (written, read) = within(async {
        tokio::join!(writer.write_all(payload), reader.read_exact(&mut echoed))
    })
    .await;
    written.unwrap();
    read.unwrap();
    assert_eq!(echoed, payload);
}
