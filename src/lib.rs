//! # multiproxy
//!
//! A proxy server that speaks one of three protocols on its listening socket:
//!
//! - **HTTP**: `CONNECT host:port` tunnels, and plain requests forwarded to
//!   the host named in their `Host` header.
//! - **SOCKS5** (RFC 1928): no-auth negotiation, `CONNECT`, and optionally
//!   `UDP ASSOCIATE` with a datagram relay. `BIND` is refused.
//! - **Tunnel**: every connection is forwarded to one fixed upstream.
//!
//! Accepted connections may be wrapped in TLS 1.3 with mandatory client
//! certificates.
//!
//! ## Architecture
//!
//! Each connection is a [`session::Session`] holding a protocol state
//! ([`state::HttpState`], [`state::Socks5State`] or [`state::TunnelState`])
//! and two streams: the accepted *server* stream and the outbound *client*
//! stream. Streams do their I/O in spawned tasks and report completions as
//! [`stream::Event`]s. A single [`manager::StreamManager`] task receives
//! those events, hands them to the session's current state, and applies the
//! commands the state queued in response.
//!
//! ```no_run
//! use multiproxy::{
//!     config::{Mode, ServerConfig},
//!     listener,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> multiproxy::Result<()> {
//! let config = ServerConfig {
//!     listen: "127.0.0.1:1080".into(),
//!     mode: Mode::Socks5,
//!     tls: None,
//!     target: None,
//!     udp_associate: true,
//! };
//! listener::serve(config, None, CancellationToken::new()).await
//! # }
//! ```

use std::io;

use thiserror::Error;

pub mod auth;
pub mod config;
pub mod http;
pub mod listener;
pub mod logger;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stream;
pub mod tls;

#[cfg(test)]
mod testing;

pub use protocol::{ProtocolError, Reply};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("network error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("configuration error: {0}")]
    Config(String),
}
