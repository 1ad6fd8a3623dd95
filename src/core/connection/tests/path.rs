//! Tests for the path managers and joined subflows.

use crate::{
    config::{Config, PathManager},
    core::{
        connection::ConnectionEvent,
        subflow::{SubflowId, SubflowState},
        test_utils::{
            CLIENT_ADDR, Direction, LinkedPair, SERVER_ADDR, drain_events, init_tracing, pattern,
            read_all, test_config,
        },
    },
    error::Error,
    packet::{flags::Flags, option::MptcpOption, segment::Segment},
    transport::{Datagram, StaticRoutes},
};
use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

fn ndiff_config(seed: u64, max_subflows: u8) -> Config {
    let mut config = test_config(seed);
    config.connection.path_manager = PathManager::NDiffPorts;
    config.connection.max_subflows = max_subflows;
    config
}

fn full_mesh_config(seed: u64, addresses: &[Ipv4Addr]) -> Config {
    let mut config = test_config(seed);
    config.connection.path_manager = PathManager::FullMesh;
    config.connection.local_addresses = addresses.to_vec();
    config
}

#[test]
fn test_ndiffports_opens_extra_subflows() {
    init_tracing();
    let mut pair = LinkedPair::established(ndiff_config(1, 3), test_config(2));
    drain_events(&mut pair.client);
    pair.advance(Duration::from_millis(1));

    let subflows = pair.client.subflows();
    assert_eq!(subflows.len(), 3);
    assert!(subflows.iter().all(|s| s.state == SubflowState::Established));
    assert!(subflows.iter().all(|s| s.remote == SERVER_ADDR));
    let ports: HashSet<u16> = subflows.iter().map(|s| s.local.port()).collect();
    assert_eq!(ports.len(), 3);
    assert_eq!(pair.server().subflows().len(), 3);

    assert_eq!(
        drain_events(&mut pair.client),
        vec![
            ConnectionEvent::SubflowEstablished(SubflowId(1)),
            ConnectionEvent::SubflowEstablished(SubflowId(2))
        ]
    );

    // The scheduler spreads data over every subflow.
    let now = pair.now;
    pair.client.write(&pattern(30_000), now).unwrap();
    pair.pump();
    let sources: HashSet<SocketAddrV4> = pair.data_sent(Direction::ToServer).map(|t| t.src).collect();
    assert_eq!(sources.len(), 3);
    assert_eq!(read_all(pair.server_mut()), pattern(30_000));
}

#[test]
fn test_full_mesh_joins_advertised_addresses() {
    init_tracing();
    let client = full_mesh_config(1, &[Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 1, 1)]);
    let server = full_mesh_config(2, &[Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 1, 2)]);
    let pair = LinkedPair::established(client, server);

    let advertised = pair
        .sent
        .iter()
        .filter(|(_, t)| t.segment.added_addresses().next().is_some())
        .count();
    assert_eq!(advertised, 2);

    let subflows = pair.client.subflows();
    assert_eq!(subflows.len(), 2);
    let joined = &subflows[1];
    assert_eq!(joined.local, SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 1), CLIENT_ADDR.port()));
    assert_eq!(joined.remote, SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 2), SERVER_ADDR.port()));
    assert_eq!(joined.address_id, 2);
    assert_eq!(joined.state, SubflowState::Established);
    assert_eq!(pair.server().subflows()[1].address_id, 2);
}

#[test]
fn test_full_mesh_skips_unrouted_pairs() {
    let client = full_mesh_config(1, &[Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 1, 1)]);
    let server = full_mesh_config(2, &[Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 1, 2)]);
    let routes = StaticRoutes::new().with_route(*CLIENT_ADDR.ip(), *SERVER_ADDR.ip());
    let mut pair = LinkedPair::with_routes(client, server, Arc::new(routes));
    pair.pump();

    assert!(pair.client.is_established());
    assert_eq!(pair.client.subflows().len(), 1);
}

#[test]
fn test_join_with_foreign_token_is_reset() {
    let mut pair = LinkedPair::established(test_config(1), test_config(2));
    let intruder = SocketAddrV4::new(*CLIENT_ADDR.ip(), 40005);
    let token = pair.server().local_token().wrapping_add(1);
    let syn = Segment::control(
        (intruder.port(), SERVER_ADDR.port()),
        777,
        0,
        Flags::SYN,
        u16::MAX,
        vec![MptcpOption::MpJoin {
            receiver_token: token,
            address_id: 0,
        }],
    );
    let now = pair.now;

    let result = pair
        .server_mut()
        .handle_datagram(Datagram::new(intruder, SERVER_ADDR, syn), now);

    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    let reset = pair.server_mut().poll_transmit().unwrap();
    assert_eq!(reset.dst, intruder);
    assert!(reset.segment.flags().contains(Flags::RST));
    assert_eq!(reset.segment.header.ack, 778);
    assert!(pair.server().is_established());
    assert_eq!(pair.server().subflows().len(), 1);
}

#[test]
fn test_refused_join_closes_only_that_subflow() {
    init_tracing();
    let mut server = test_config(2);
    server.connection.max_subflows = 1;
    let mut pair = LinkedPair::established(ndiff_config(1, 2), server);
    drain_events(&mut pair.client);
    pair.advance(Duration::from_millis(1));

    let subflows = pair.client.subflows();
    assert_eq!(subflows.len(), 2);
    assert_eq!(subflows[1].state, SubflowState::Closed);
    assert!(pair.client.is_established());
    assert_eq!(
        drain_events(&mut pair.client),
        vec![ConnectionEvent::SubflowClosed(SubflowId(1))]
    );
    assert!(pair
        .errors
        .iter()
        .any(|(d, e)| *d == Direction::ToServer && *e == Error::TooManySubflows));

    let now = pair.now;
    pair.client.write(b"still here", now).unwrap();
    pair.pump();
    assert_eq!(read_all(pair.server_mut()), b"still here");
}

#[test]
fn test_open_subflow_requires_connection() {
    let mut pair = LinkedPair::new(test_config(1), test_config(2));
    let now = pair.now;
    let local = SocketAddrV4::new(*CLIENT_ADDR.ip(), 40001);
    assert_eq!(
        pair.client.open_subflow(local, SERVER_ADDR, 0, now),
        Err(Error::NotConnected)
    );
}
