//! Connection lifecycle through the endpoint: establishment, graceful close, failures
//! and reaping.

mod common;

use common::harness::{CLIENT_ADDR, LinkProfile, Network, pattern, seeded};
use mptcp_engine::{ConnectionEvent, ConnectionHandle, ConnectionState, Endpoint, Error, SubflowId};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Collects every event an endpoint has queued.
fn drain(endpoint: &mut Endpoint, into: &mut Vec<(ConnectionHandle, ConnectionEvent)>) {
    while let Some(event) = endpoint.poll_event() {
        into.push(event);
    }
}

#[test]
fn test_establishment_exchanges_tokens() {
    let mut network = Network::new(seeded(1), seeded(2), LinkProfile::default());
    let client = network.connect();
    assert_eq!(
        network.client.connection(client).unwrap().state(),
        ConnectionState::Connecting
    );

    let mut accepted = None;
    let mut client_events = Vec::new();
    let done = network.run_until(Duration::from_secs(5), |net| {
        accepted = accepted.or_else(|| net.server.accept());
        drain(&mut net.client, &mut client_events);
        accepted.is_some_and(|h| net.server.connection(h).is_some_and(|c| c.is_established()))
    });
    assert!(done);
    assert!(client_events.contains(&(client, ConnectionEvent::Connected)));

    let client_conn = network.client.connection(client).unwrap();
    let server_conn = network.server.connection(accepted.unwrap()).unwrap();
    assert_eq!(client_conn.remote_token(), Some(server_conn.local_token()));
    assert_eq!(server_conn.remote_token(), Some(client_conn.local_token()));
    assert!(network.server.registry().contains(server_conn.local_token()));
}

fn close_after_transfer(profile: LinkProfile, client_seed: u64, server_seed: u64) {
    let mut network = Network::new(seeded(client_seed), seeded(server_seed), profile);
    let client = network.connect();
    let now = network.now;
    let data = pattern(40_000);
    // Queued before the handshake completes.
    network.client.connection_mut(client).unwrap().write(&data, now).unwrap();
    network.client.connection_mut(client).unwrap().close(now).unwrap();

    let mut accepted = None;
    let mut received = Vec::new();
    let (mut client_events, mut server_events) = (Vec::new(), Vec::new());
    let done = network.run_until(Duration::from_secs(600), |net| {
        accepted = accepted.or_else(|| net.server.accept());
        if let Some(handle) = accepted {
            Network::read_all(&mut net.server, handle, &mut received);
        }
        drain(&mut net.client, &mut client_events);
        drain(&mut net.server, &mut server_events);
        accepted.is_some() && net.client.is_empty() && net.server.is_empty()
    });
    assert!(done, "connections were never reaped");
    let accepted = accepted.unwrap();

    assert_eq!(received, data);
    assert!(client_events.contains(&(client, ConnectionEvent::Closed)));
    assert!(server_events.contains(&(accepted, ConnectionEvent::PeerClosed)));
    assert!(server_events.contains(&(accepted, ConnectionEvent::Closed)));
    assert!(network.client.registry().is_empty());
    assert!(network.server.registry().is_empty());
}

#[test]
fn test_graceful_close_reaps_both_sides() {
    close_after_transfer(LinkProfile::default(), 3, 4);
}

#[test]
fn test_graceful_close_over_lossy_link() {
    let profile = LinkProfile {
        delay: Duration::from_millis(15),
        jitter: Duration::from_millis(5),
        loss: 0.05,
    };
    close_after_transfer(profile, 5, 6);
}

#[test]
fn test_connect_to_unknown_address_is_refused() {
    let mut network = Network::new(seeded(7), seeded(8), LinkProfile::default());
    let elsewhere = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80);
    let now = network.now;
    let client = network
        .client
        .connect(CLIENT_ADDR, elsewhere, now)
        .unwrap();

    let mut events = Vec::new();
    let done = network.run_until(Duration::from_secs(5), |net| {
        drain(&mut net.client, &mut events);
        net.client.is_empty()
    });
    assert!(done);
    assert!(events.contains(&(client, ConnectionEvent::Error(Error::ConnectionRefused))));
    assert_eq!(events.last(), Some(&(client, ConnectionEvent::Closed)));
    assert!(network.server.is_empty());
}

#[test]
fn test_unanswered_connect_times_out() {
    let profile = LinkProfile {
        loss: 1.0,
        ..LinkProfile::default()
    };
    let mut network = Network::new(seeded(9), seeded(10), profile);
    let client = network.connect();

    let mut events = Vec::new();
    let done = network.run_until(Duration::from_secs(120), |net| {
        drain(&mut net.client, &mut events);
        net.client.is_empty()
    });
    assert!(done);
    assert_eq!(
        events,
        vec![
            (client, ConnectionEvent::SubflowClosed(SubflowId(0))),
            (client, ConnectionEvent::Error(Error::ConnectionTimeout)),
            (client, ConnectionEvent::Closed),
        ]
    );
    assert!(network.client.registry().is_empty());
}
