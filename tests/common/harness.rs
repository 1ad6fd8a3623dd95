//! tests/common/harness.rs
//!
//! A simulated network between two endpoints: per-segment delay with jitter, random
//! loss, and a virtual clock that jumps straight to the next arrival or timer.

use mptcp_engine::{
    AllRoutes, Config, ConnectionHandle, Datagram, Endpoint, RouteTable, TokenRegistry,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, Once},
    time::Duration,
};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub const CLIENT_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000);
pub const SERVER_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mptcp_engine=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn seeded(seed: u64) -> Config {
    let mut config = Config::default();
    config.connection.rng_seed = Some(seed);
    config
}

/// `len` bytes of a recognisable pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Link characteristics.
#[derive(Debug, Clone, Copy)]
pub struct LinkProfile {
    pub delay: Duration,
    pub jitter: Duration,
    pub loss: f64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
            loss: 0.0,
        }
    }
}

struct InFlight {
    arrival: Instant,
    to_server: bool,
    datagram: Datagram,
}

pub struct Network {
    pub client: Endpoint,
    pub server: Endpoint,
    pub now: Instant,
    profile: LinkProfile,
    rng: StdRng,
    in_flight: Vec<InFlight>,
    pub dropped: usize,
}

impl Network {
    pub fn new(client: Config, server: Config, profile: LinkProfile) -> Self {
        Self::with_routes(client, server, profile, Arc::new(AllRoutes))
    }

    pub fn with_routes(client: Config, server: Config, profile: LinkProfile, routes: Arc<dyn RouteTable>) -> Self {
        init_tracing();
        let mut server = Endpoint::with_registry(server, TokenRegistry::new(), routes.clone());
        server.listen(SERVER_ADDR);
        Self {
            client: Endpoint::new(client, routes),
            server,
            now: Instant::now(),
            profile,
            rng: StdRng::seed_from_u64(7),
            in_flight: Vec::new(),
            dropped: 0,
        }
    }

    pub fn connect(&mut self) -> ConnectionHandle {
        let now = self.now;
        self.client.connect(CLIENT_ADDR, SERVER_ADDR, now).unwrap()
    }

    fn collect(&mut self) {
        let outgoing: Vec<(bool, Datagram)> = std::iter::from_fn(|| self.client.poll_transmit())
            .map(|t| (true, t.into_datagram()))
            .chain(std::iter::from_fn(|| self.server.poll_transmit()).map(|t| (false, t.into_datagram())))
            .collect();
        for (to_server, datagram) in outgoing {
            if self.profile.loss > 0.0 && self.rng.random_bool(self.profile.loss) {
                self.dropped += 1;
                continue;
            }
            let jitter = if self.profile.jitter.is_zero() {
                Duration::ZERO
            } else {
                self.profile.jitter.mul_f64(self.rng.random::<f64>())
            };
            self.in_flight.push(InFlight {
                arrival: self.now + self.profile.delay + jitter,
                to_server,
                datagram,
            });
        }
    }

    /// Advances to the next arrival or timer and processes it. Returns `false` when
    /// nothing is left to happen.
    pub fn step(&mut self) -> bool {
        self.collect();
        let next_arrival = self.in_flight.iter().map(|p| p.arrival).min();
        let next_timer = [self.client.poll_timeout(), self.server.poll_timeout()]
            .into_iter()
            .flatten()
            .min();
        let Some(next) = [next_arrival, next_timer].into_iter().flatten().min() else {
            return false;
        };
        self.now = self.now.max(next);

        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|p| p.arrival <= self.now);
        self.in_flight = pending;
        let mut due = due;
        due.sort_by_key(|p| p.arrival);
        for packet in due {
            let endpoint = if packet.to_server {
                &mut self.server
            } else {
                &mut self.client
            };
            let _ = endpoint.handle_datagram(packet.datagram, self.now);
        }
        self.client.handle_timeout(self.now);
        self.server.handle_timeout(self.now);
        self.collect();
        true
    }

    /// Steps until `done` holds or `limit` of virtual time has passed. Returns whether
    /// `done` was reached.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let start = self.now;
        loop {
            if done(self) {
                return true;
            }
            if self.now - start > limit || !self.step() {
                return done(self);
            }
        }
    }

    /// Reads everything readable on one connection.
    pub fn read_all(endpoint: &mut Endpoint, handle: ConnectionHandle, into: &mut Vec<u8>) {
        if let Some(connection) = endpoint.connection_mut(handle) {
            loop {
                let chunk = connection.read(usize::MAX);
                if chunk.is_empty() {
                    return;
                }
                into.extend_from_slice(&chunk);
            }
        }
    }
}
