use super::*;
use crate::{
    config::PathManager,
    core::test_utils::{CLIENT_ADDR, SERVER_ADDR, init_tracing, pattern, read_all, test_config},
    packet::{option::MptcpOption, segment::Segment},
    transport::AllRoutes,
};
use std::{net::Ipv4Addr, time::Duration};

struct Hosts {
    client: Endpoint,
    server: Endpoint,
    now: Instant,
}

impl Hosts {
    fn new(client_config: Config, server_config: Config) -> Self {
        let mut server = Endpoint::new(server_config, Arc::new(AllRoutes));
        server.listen(SERVER_ADDR);
        Self {
            client: Endpoint::new(client_config, Arc::new(AllRoutes)),
            server,
            now: Instant::now(),
        }
    }

    fn pump(&mut self) {
        loop {
            let mut moved = false;
            while let Some(transmit) = self.client.poll_transmit() {
                let _ = self.server.handle_datagram(transmit.into_datagram(), self.now);
                moved = true;
            }
            while let Some(transmit) = self.server.poll_transmit() {
                let _ = self.client.handle_datagram(transmit.into_datagram(), self.now);
                moved = true;
            }
            if !moved {
                return;
            }
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.client.handle_timeout(self.now);
        self.server.handle_timeout(self.now);
        self.pump();
    }
}

fn drain(endpoint: &mut Endpoint) -> Vec<(ConnectionHandle, ConnectionEvent)> {
    std::iter::from_fn(|| endpoint.poll_event()).collect()
}

#[test]
fn test_connections_are_demultiplexed_by_address_pair() {
    init_tracing();
    let mut hosts = Hosts::new(test_config(1), test_config(2));
    let now = hosts.now;
    let first = hosts.client.connect(CLIENT_ADDR, SERVER_ADDR, now).unwrap();
    let other_port = SocketAddrV4::new(*CLIENT_ADDR.ip(), 40001);
    let second = hosts.client.connect(other_port, SERVER_ADDR, now).unwrap();
    hosts.pump();

    let accepted_first = hosts.server.accept().unwrap();
    let accepted_second = hosts.server.accept().unwrap();
    assert!(hosts.server.accept().is_none());
    assert_ne!(accepted_first, accepted_second);

    hosts.client.connection_mut(first).unwrap().write(&pattern(3000), now).unwrap();
    hosts.client.connection_mut(second).unwrap().write(b"second", now).unwrap();
    hosts.pump();

    let server_first = hosts.server.connection_mut(accepted_first).unwrap();
    assert_eq!(read_all(server_first), pattern(3000));
    let server_second = hosts.server.connection_mut(accepted_second).unwrap();
    assert_eq!(read_all(server_second), b"second");
}

#[test]
fn test_join_is_routed_by_token() {
    init_tracing();
    let mut client_config = test_config(1);
    client_config.connection.path_manager = PathManager::NDiffPorts;
    client_config.connection.max_subflows = 2;
    let mut hosts = Hosts::new(client_config, test_config(2));
    let now = hosts.now;
    let handle = hosts.client.connect(CLIENT_ADDR, SERVER_ADDR, now).unwrap();
    hosts.pump();
    hosts.advance(Duration::from_millis(1));

    let accepted = hosts.server.accept().unwrap();
    assert_eq!(hosts.server.len(), 1);
    assert_eq!(hosts.server.connection(accepted).unwrap().subflows().len(), 2);
    assert_eq!(hosts.client.connection(handle).unwrap().live_subflows(), 2);
}

#[test]
fn test_unroutable_segment_is_reset() {
    let mut endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    endpoint.listen(SERVER_ADDR);
    let now = Instant::now();
    let stray = Segment::control((40000, 80), 500, 900, Flags::ACK, u16::MAX, Vec::new());

    endpoint
        .handle_datagram(Datagram::new(CLIENT_ADDR, SERVER_ADDR, stray), now)
        .unwrap();

    let reset = endpoint.poll_transmit().unwrap();
    assert_eq!(reset.dst, CLIENT_ADDR);
    assert_eq!(reset.segment.flags(), Flags::RST);
    assert_eq!(reset.segment.header.seq, 900);
    assert_eq!(reset.segment.header.ack, 501);

    // Resets are never answered.
    let rst = Segment::control((40000, 80), 500, 900, Flags::RST, 0, Vec::new());
    endpoint
        .handle_datagram(Datagram::new(CLIENT_ADDR, SERVER_ADDR, rst), now)
        .unwrap();
    assert!(endpoint.poll_transmit().is_none());
}

#[test]
fn test_syn_for_other_address_is_reset() {
    let mut endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    endpoint.listen(SERVER_ADDR);
    let now = Instant::now();
    let elsewhere = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), 80);
    let syn = Segment::control(
        (40000, 80),
        1,
        0,
        Flags::SYN,
        u16::MAX,
        vec![MptcpOption::MpCapable { sender_token: 5 }],
    );
    endpoint
        .handle_datagram(Datagram::new(CLIENT_ADDR, elsewhere, syn), now)
        .unwrap();
    assert!(endpoint.is_empty());
    assert!(endpoint.poll_transmit().unwrap().segment.flags().contains(Flags::RST));
}

#[test]
fn test_join_for_unknown_token_is_reset() {
    let mut endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    endpoint.listen(SERVER_ADDR);
    let now = Instant::now();
    let join = Segment::control(
        (40001, 80),
        1,
        0,
        Flags::SYN,
        u16::MAX,
        vec![MptcpOption::MpJoin {
            receiver_token: 1234,
            address_id: 0,
        }],
    );

    let result = endpoint.handle_datagram(Datagram::new(CLIENT_ADDR, SERVER_ADDR, join), now);

    assert_eq!(result, Err(Error::UnknownConnection));
    assert!(endpoint.poll_transmit().unwrap().segment.flags().contains(Flags::RST));
}

#[test]
fn test_closed_connections_are_reaped() {
    init_tracing();
    let mut hosts = Hosts::new(test_config(1), test_config(2));
    let now = hosts.now;
    let handle = hosts.client.connect(CLIENT_ADDR, SERVER_ADDR, now).unwrap();
    hosts.pump();
    let accepted = hosts.server.accept().unwrap();

    hosts.client.connection_mut(handle).unwrap().close(now).unwrap();
    hosts.pump();
    hosts.advance(Duration::from_secs(2));

    let client_events = drain(&mut hosts.client);
    assert_eq!(client_events.last(), Some(&(handle, ConnectionEvent::Closed)));
    let server_events = drain(&mut hosts.server);
    assert_eq!(server_events.last(), Some(&(accepted, ConnectionEvent::Closed)));
    assert!(hosts.client.is_empty());
    assert!(hosts.server.is_empty());
    assert!(hosts.client.registry().is_empty());
    assert!(hosts.server.registry().is_empty());
}
