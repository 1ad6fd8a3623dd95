//! Sans-IO test harness linking a client connection to a listener.
//!
//! Segments are moved between the two sides by [`LinkedPair::pump`]. A filter decides
//! for every segment whether it is delivered, dropped, held back for later, or
//! delivered with a Congestion Experienced mark. Time only moves when a test asks it to.

use crate::{
    config::Config,
    core::connection::{Connection, ConnectionEvent, Listener},
    error::Error,
    token::TokenRegistry,
    transport::{AllRoutes, RouteTable, Transmit},
};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub const CLIENT_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000);
pub const SERVER_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);

/// Installs a tracing subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mptcp_engine=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Deterministic configuration for tests.
pub fn test_config(seed: u64) -> Config {
    let mut config = Config::default();
    config.connection.rng_seed = Some(seed);
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

/// What happens to one segment on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Drop,
    Hold,
    /// Deliver with the Congestion Experienced mark set.
    Mark,
}

type Filter = Box<dyn FnMut(Direction, &Transmit) -> Verdict>;

pub struct LinkedPair {
    pub client: Connection,
    pub server: Option<Connection>,
    pub listener: Listener,
    pub registry: TokenRegistry,
    pub now: Instant,
    /// Every segment either side emitted, in order.
    pub sent: Vec<(Direction, Transmit)>,
    /// Segments held back by the filter.
    pub held: Vec<(Direction, Transmit)>,
    /// Errors returned while delivering segments.
    pub errors: Vec<(Direction, Error)>,
    filter: Filter,
}

impl LinkedPair {
    /// Starts a connection from [`CLIENT_ADDR`] to a listener on [`SERVER_ADDR`]
    /// without moving any segment yet.
    pub fn new(client_config: Config, server_config: Config) -> Self {
        Self::with_routes(client_config, server_config, Arc::new(AllRoutes))
    }

    pub fn with_routes(client_config: Config, server_config: Config, routes: Arc<dyn RouteTable>) -> Self {
        let registry = TokenRegistry::new();
        let now = Instant::now();
        let listener = Listener::listen(server_config, registry.clone(), routes.clone(), SERVER_ADDR);
        let client = Connection::connect(
            client_config,
            registry.clone(),
            routes,
            CLIENT_ADDR,
            SERVER_ADDR,
            now,
        )
        .expect("connect");
        Self {
            client,
            server: None,
            listener,
            registry,
            now,
            sent: Vec::new(),
            held: Vec::new(),
            errors: Vec::new(),
            filter: Box::new(|_, _| Verdict::Deliver),
        }
    }

    /// A pair whose initial subflow is established on both sides.
    pub fn established(client_config: Config, server_config: Config) -> Self {
        let mut pair = Self::new(client_config, server_config);
        pair.pump();
        assert!(pair.client.is_established(), "client not established");
        assert!(pair.server().is_established(), "server not established");
        pair
    }

    pub fn server(&self) -> &Connection {
        self.server.as_ref().expect("server accepted")
    }

    pub fn server_mut(&mut self) -> &mut Connection {
        self.server.as_mut().expect("server accepted")
    }

    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(Direction, &Transmit) -> Verdict + 'static,
    {
        self.filter = Box::new(filter);
    }

    pub fn clear_filter(&mut self) {
        self.filter = Box::new(|_, _| Verdict::Deliver);
    }

    /// Moves segments until neither side has anything left to send.
    pub fn pump(&mut self) {
        for _ in 0..100_000 {
            let mut progressed = false;
            while let Some(transmit) = self.client.poll_transmit() {
                self.route(Direction::ToServer, transmit);
                progressed = true;
            }
            while let Some(transmit) = self.server.as_mut().and_then(Connection::poll_transmit) {
                self.route(Direction::ToClient, transmit);
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
        panic!("link never went quiet");
    }

    fn route(&mut self, direction: Direction, transmit: Transmit) {
        self.sent.push((direction, transmit.clone()));
        match (self.filter)(direction, &transmit) {
            Verdict::Deliver => self.deliver(direction, transmit, false),
            Verdict::Mark => self.deliver(direction, transmit, true),
            Verdict::Hold => self.held.push((direction, transmit)),
            Verdict::Drop => {}
        }
    }

    fn deliver(&mut self, direction: Direction, transmit: Transmit, marked: bool) {
        let mut datagram = transmit.into_datagram();
        datagram.congestion_experienced = marked;
        let now = self.now;
        let result = match direction {
            Direction::ToClient => self.client.handle_datagram(datagram, now),
            Direction::ToServer => {
                if let Some(server) = self.server.as_mut() {
                    server.handle_datagram(datagram, now)
                } else {
                    match self.listener.accept(datagram, now) {
                        Ok(server) => {
                            self.server = Some(server);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            }
        };
        if let Err(err) = result {
            self.errors.push((direction, err));
        }
    }

    /// Delivers the first `count` held segments, without pumping the replies.
    pub fn deliver_held(&mut self, count: usize) {
        let count = count.min(self.held.len());
        let batch: Vec<_> = self.held.drain(..count).collect();
        for (direction, transmit) in batch {
            self.deliver(direction, transmit, false);
        }
    }

    /// Delivers every held segment, without pumping the replies.
    pub fn release_held(&mut self) {
        self.deliver_held(self.held.len());
    }

    /// Moves the clock forward, fires due timers and pumps.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.client.handle_timeout(self.now);
        if let Some(server) = self.server.as_mut() {
            server.handle_timeout(self.now);
        }
        self.pump();
    }

    /// Jumps to the earliest pending deadline of either side. Returns `false` if no
    /// timer is armed.
    pub fn advance_to_next_timer(&mut self) -> bool {
        let deadline = [
            self.client.poll_timeout(),
            self.server.as_ref().and_then(Connection::poll_timeout),
        ]
        .into_iter()
        .flatten()
        .min();
        let Some(deadline) = deadline else {
            return false;
        };
        let by = deadline.saturating_duration_since(self.now);
        self.advance(by);
        true
    }

    /// Segments sent in `direction` that carry a payload.
    pub fn data_sent(&self, direction: Direction) -> impl Iterator<Item = &Transmit> {
        self.sent
            .iter()
            .filter(move |(d, t)| *d == direction && !t.segment.payload.is_empty())
            .map(|(_, t)| t)
    }
}

/// Drains and returns every pending event of a connection.
pub fn drain_events(connection: &mut Connection) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| connection.poll_event()).collect()
}

/// `len` bytes of a recognisable pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Reads everything readable.
pub fn read_all(connection: &mut Connection) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = connection.read(usize::MAX);
        if chunk.is_empty() {
            return out;
        }
        out.extend_from_slice(&chunk);
    }
}
