//! 端点：按四元组把数据报分发给连接
//! Endpoint: demultiplexes datagrams to connections by 4-tuple
//!
//! An [`Endpoint`] owns every connection bound to one host, an optional listener and
//! the routing table from `(local, remote)` address pairs to connections. It is sans-IO
//! like the connections it owns: datagrams go in through [`Endpoint::handle_datagram`],
//! segments come out of [`Endpoint::poll_transmit`].
//!
//! 端点拥有同一主机上的所有连接、可选的监听器以及从地址对到连接的路由表。

use crate::{
    config::Config,
    core::connection::{Connection, ConnectionEvent, Listener, reset_for},
    error::{Error, Result},
    packet::flags::Flags,
    token::{ConnectionHandle, TokenRegistry},
    transport::{Datagram, RouteTable, Transmit},
};
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddrV4,
    sync::Arc,
};
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[cfg(test)]
mod tests;

/// `(local, remote)`
type PathKey = (SocketAddrV4, SocketAddrV4);

/// 一台主机上的所有多路径连接
/// Every multipath connection of one host
pub struct Endpoint {
    config: Config,
    registry: TokenRegistry,
    routes: Arc<dyn RouteTable>,
    listener: Option<Listener>,
    connections: HashMap<ConnectionHandle, Connection>,
    /// 地址对 -> 连接
    /// Address pair -> connection
    paths: HashMap<PathKey, ConnectionHandle>,
    /// RSTs answering segments nobody owns.
    transmits: VecDeque<Transmit>,
    accepted: VecDeque<ConnectionHandle>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("listener", &self.listener.as_ref().map(Listener::local_addr))
            .field("connections", &self.connections.len())
            .field("paths", &self.paths.len())
            .finish()
    }
}

impl Endpoint {
    /// Creates an endpoint with its own token registry.
    pub fn new(config: Config, routes: Arc<dyn RouteTable>) -> Self {
        Self::with_registry(config, TokenRegistry::new(), routes)
    }

    /// Creates an endpoint sharing `registry` with other endpoints.
    /// 创建与其他端点共享 `registry` 的端点。
    pub fn with_registry(config: Config, registry: TokenRegistry, routes: Arc<dyn RouteTable>) -> Self {
        Self {
            config,
            registry,
            routes,
            listener: None,
            connections: HashMap::new(),
            paths: HashMap::new(),
            transmits: VecDeque::new(),
            accepted: VecDeque::new(),
        }
    }

    /// Starts accepting MP_CAPABLE SYNs addressed to `local`.
    pub fn listen(&mut self, local: SocketAddrV4) {
        info!(%local, "Endpoint listening");
        self.listener = Some(Listener::listen(
            self.config.clone(),
            self.registry.clone(),
            self.routes.clone(),
            local,
        ));
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(&handle)
    }

    /// Opens a client connection from `local` to `remote`.
    ///
    /// 打开一个从 `local` 到 `remote` 的客户端连接。
    pub fn connect(&mut self, local: SocketAddrV4, remote: SocketAddrV4, now: Instant) -> Result<ConnectionHandle> {
        let connection = Connection::connect(
            self.config.clone(),
            self.registry.clone(),
            self.routes.clone(),
            local,
            remote,
            now,
        )?;
        Ok(self.insert(connection))
    }

    /// The next connection accepted by the listener.
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.accepted.pop_front()
    }

    fn insert(&mut self, connection: Connection) -> ConnectionHandle {
        let handle = connection.handle();
        self.connections.insert(handle, connection);
        self.sync_paths(handle);
        handle
    }

    /// Registers the address pair of every subflow the connection has opened or
    /// accepted since the last call.
    fn sync_paths(&mut self, handle: ConnectionHandle) {
        let Some(connection) = self.connections.get(&handle) else {
            return;
        };
        for subflow in connection.subflows() {
            self.paths.entry((subflow.local, subflow.remote)).or_insert(handle);
        }
    }

    /// Routes one received datagram.
    ///
    /// Known address pairs go to their connection. A SYN carrying MP_JOIN goes to the
    /// connection owning its token, and one carrying MP_CAPABLE to the listener.
    /// Anything else that is not itself a reset is answered with RST.
    ///
    /// 分发一个收到的数据报。
    pub fn handle_datagram(&mut self, datagram: Datagram, now: Instant) -> Result<()> {
        let key = (datagram.dst, datagram.src);
        if let Some(&handle) = self.paths.get(&key) {
            let owns = self
                .connections
                .get(&handle)
                .is_some_and(|connection| connection.find_subflow(datagram.dst, datagram.src).is_some());
            if owns {
                return self.deliver(handle, datagram, now);
            }
            trace!(local = %datagram.dst, remote = %datagram.src, "Stale path, rerouting");
            self.paths.remove(&key);
        }

        let flags = datagram.segment.flags().significant();
        if flags == Flags::SYN {
            if let Some((token, _)) = datagram.segment.mp_join() {
                let owner = self
                    .registry
                    .lookup(token)
                    .filter(|handle| self.connections.contains_key(handle));
                return match owner {
                    Some(handle) => self.deliver(handle, datagram, now),
                    None => {
                        debug!(token, remote = %datagram.src, "MP_JOIN for unknown token");
                        self.transmits.push_back(reset_for(&datagram));
                        Err(Error::UnknownConnection)
                    }
                };
            }
            if let Some(listener) = self
                .listener
                .as_ref()
                .filter(|listener| listener.local_addr() == datagram.dst)
            {
                let connection = listener.accept(datagram, now)?;
                let handle = self.insert(connection);
                self.accepted.push_back(handle);
                return Ok(());
            }
        }

        if !flags.contains(Flags::RST) {
            debug!(local = %datagram.dst, remote = %datagram.src, flags = %flags, "Unroutable segment, resetting");
            self.transmits.push_back(reset_for(&datagram));
        }
        Ok(())
    }

    fn deliver(&mut self, handle: ConnectionHandle, datagram: Datagram, now: Instant) -> Result<()> {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return Err(Error::UnknownConnection);
        };
        let result = connection.handle_datagram(datagram, now);
        self.sync_paths(handle);
        result
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }
        self.connections.values_mut().find_map(Connection::poll_transmit)
    }

    /// The next event of any connection. Drained closed connections are reaped once
    /// nothing is left to report.
    pub fn poll_event(&mut self) -> Option<(ConnectionHandle, ConnectionEvent)> {
        let event = self
            .connections
            .iter_mut()
            .find_map(|(&handle, connection)| connection.poll_event().map(|event| (handle, event)));
        if event.is_none() {
            self.reap();
        }
        event
    }

    /// The earliest timer deadline of any connection.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections.values().filter_map(Connection::poll_timeout).min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let handles: Vec<ConnectionHandle> = self.connections.keys().copied().collect();
        for handle in handles {
            if let Some(connection) = self.connections.get_mut(&handle) {
                connection.handle_timeout(now);
            }
            self.sync_paths(handle);
        }
    }

    /// Removes closed connections whose segments and events were all collected.
    /// Returns the removed handles.
    ///
    /// 移除已关闭且其报文段和事件都已取走的连接。
    pub fn reap(&mut self) -> Vec<ConnectionHandle> {
        let done: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_drained())
            .map(|(&handle, _)| handle)
            .collect();
        for handle in &done {
            self.connections.remove(handle);
            self.paths.retain(|_, owner| owner != handle);
            debug!(connection = %handle, "Reaped closed connection");
        }
        done
    }
}
