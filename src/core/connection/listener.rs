//! 被动打开：从 MP_CAPABLE SYN 创建服务端连接
//! Passive open: creates server connections from MP_CAPABLE SYNs

use super::Connection;
use crate::{
    config::Config,
    error::{Error, Result},
    packet::flags::Flags,
    token::TokenRegistry,
    transport::{Datagram, RouteTable},
};
use std::{net::SocketAddrV4, sync::Arc};
use tokio::time::Instant;
use tracing::debug;

/// Accepts new connections on one local address.
/// 在一个本地地址上接受新连接。
#[derive(Clone)]
pub struct Listener {
    config: Config,
    registry: TokenRegistry,
    routes: Arc<dyn RouteTable>,
    local: SocketAddrV4,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("local", &self.local).finish()
    }
}

impl Listener {
    pub fn listen(
        config: Config,
        registry: TokenRegistry,
        routes: Arc<dyn RouteTable>,
        local: SocketAddrV4,
    ) -> Self {
        debug!(%local, "Listening");
        Self {
            config,
            registry,
            routes,
            local,
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Creates the server side of a connection from a SYN carrying MP_CAPABLE. The
    /// returned connection has already queued its SYN+ACK.
    ///
    /// 从携带 MP_CAPABLE 的 SYN 创建服务端连接，返回的连接已排队其 SYN+ACK。
    pub fn accept(&self, datagram: Datagram, now: Instant) -> Result<Connection> {
        let flags = datagram.segment.flags().significant();
        if flags != Flags::SYN {
            return Err(Error::ProtocolViolation(format!(
                "listener expects SYN, got {flags}"
            )));
        }
        let token = datagram
            .segment
            .mp_capable()
            .ok_or(Error::MissingHandshakeOption)?;
        datagram.segment.validate_sequence_space()?;
        Connection::accept(
            self.config.clone(),
            self.registry.clone(),
            self.routes.clone(),
            datagram,
            token,
            now,
        )
    }
}
