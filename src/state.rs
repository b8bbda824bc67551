//! The protocol state machines driven by [`Session`](crate::session::Session).

mod http;
mod socks5;
mod tunnel;

pub use http::HttpState;
pub use socks5::Socks5State;
pub use tunnel::TunnelState;

use crate::{session::SessionContext, stream::IoBuffer};

/// Ping-pong relay between the two sides of an established session.
///
/// A direction is read again only once the write it produced has completed,
/// so each stream has at most one read outstanding.
pub(crate) mod transfer {
    use super::*;

    pub fn start(ctx: &mut SessionContext) {
        ctx.read_from_server();
        ctx.read_from_client();
    }

    pub fn on_server_read(ctx: &mut SessionContext, buf: IoBuffer) {
        ctx.relay_to_remote(buf);
    }

    pub fn on_client_write(ctx: &mut SessionContext) {
        ctx.read_from_server();
    }

    pub fn on_client_read(ctx: &mut SessionContext, buf: IoBuffer) {
        ctx.relay_to_local(buf);
    }

    pub fn on_server_write(ctx: &mut SessionContext) {
        ctx.read_from_client();
    }
}
