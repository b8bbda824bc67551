use tracing::debug;

use super::transfer;
use crate::{
    session::{ProtocolState, SessionContext},
    stream::IoBuffer,
};

/// Fixed-target forwarding: every accepted connection is relayed to the
/// configured upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    WaitConnection,
    ConnectionEstablished,
    DataTransferMode,
}

impl ProtocolState for TunnelState {
    const PROTOCOL: &'static str = "tun";

    fn initial() -> Self {
        TunnelState::WaitConnection
    }

    fn on_accept(self, ctx: &mut SessionContext) -> Self {
        match self {
            TunnelState::WaitConnection => {
                debug!(id = ctx.id(), target = %ctx.target(), "tunnel connecting");
                ctx.connect();
                TunnelState::ConnectionEstablished
            }
            state => state,
        }
    }

    fn on_client_connect(self, ctx: &mut SessionContext) -> Self {
        match self {
            TunnelState::ConnectionEstablished => {
                transfer::start(ctx);
                TunnelState::DataTransferMode
            }
            state => state,
        }
    }

    fn on_server_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        if self == TunnelState::DataTransferMode {
            transfer::on_server_read(ctx, buf);
        }
        self
    }

    fn on_server_write(self, ctx: &mut SessionContext) -> Self {
        if self == TunnelState::DataTransferMode {
            transfer::on_server_write(ctx);
        }
        self
    }

    fn on_client_read(self, ctx: &mut SessionContext, buf: IoBuffer) -> Self {
        if self == TunnelState::DataTransferMode {
            transfer::on_client_read(ctx, buf);
        }
        self
    }

    fn on_client_write(self, ctx: &mut SessionContext) -> Self {
        if self == TunnelState::DataTransferMode {
            transfer::on_client_write(ctx);
        }
        self
    }
}
