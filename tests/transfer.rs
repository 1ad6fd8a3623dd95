//! End-to-end data transfer between two endpoints over a simulated network.

mod common;

use common::harness::{LinkProfile, Network, pattern, seeded};
use mptcp_engine::{ConnectionHandle, config::PathManager};
use std::time::Duration;

/// Connects, waits for the server to accept, and returns both handles.
fn establish(network: &mut Network) -> (ConnectionHandle, ConnectionHandle) {
    let client = network.connect();
    let mut accepted = None;
    let done = network.run_until(Duration::from_secs(30), |net| {
        if accepted.is_none() {
            accepted = net.server.accept();
        }
        accepted.is_some() && net.client.connection(client).is_some_and(|c| c.is_established())
    });
    assert!(done, "handshake did not complete");
    (client, accepted.unwrap())
}

/// Writes `data` from the client and collects it on the server.
fn transfer(network: &mut Network, client: ConnectionHandle, server: ConnectionHandle, data: &[u8]) -> Vec<u8> {
    let now = network.now;
    let written = network.client.connection_mut(client).unwrap().write(data, now).unwrap();
    assert_eq!(written, data.len());

    let mut received = Vec::new();
    network.run_until(Duration::from_secs(300), |net| {
        Network::read_all(&mut net.server, server, &mut received);
        received.len() >= data.len()
    });
    received
}

#[test]
fn test_transfer_over_clean_link() {
    let mut network = Network::new(seeded(1), seeded(2), LinkProfile::default());
    let (client, server) = establish(&mut network);

    let data = pattern(100_000);
    let received = transfer(&mut network, client, server, &data);
    assert_eq!(received, data);
    assert_eq!(network.dropped, 0);
    assert_eq!(network.client.connection(client).unwrap().pending_bytes(), 0);
}

#[test]
fn test_transfer_in_both_directions() {
    let mut network = Network::new(seeded(3), seeded(4), LinkProfile::default());
    let (client, server) = establish(&mut network);

    let now = network.now;
    let request = pattern(20_000);
    let response: Vec<u8> = pattern(30_000).into_iter().rev().collect();
    network.client.connection_mut(client).unwrap().write(&request, now).unwrap();
    network.server.connection_mut(server).unwrap().write(&response, now).unwrap();

    let (mut at_server, mut at_client) = (Vec::new(), Vec::new());
    let done = network.run_until(Duration::from_secs(60), |net| {
        Network::read_all(&mut net.server, server, &mut at_server);
        Network::read_all(&mut net.client, client, &mut at_client);
        at_server.len() == request.len() && at_client.len() == response.len()
    });
    assert!(done);
    assert_eq!(at_server, request);
    assert_eq!(at_client, response);
}

#[test]
fn test_lossy_transfer_over_three_subflows() {
    let mut client_config = seeded(5);
    client_config.connection.path_manager = PathManager::NDiffPorts;
    client_config.connection.max_subflows = 3;
    let profile = LinkProfile {
        delay: Duration::from_millis(20),
        jitter: Duration::from_millis(5),
        loss: 0.03,
    };
    let mut network = Network::new(client_config, seeded(6), profile);
    let (client, server) = establish(&mut network);

    let data = pattern(200_000);
    let received = transfer(&mut network, client, server, &data);
    assert!(network.dropped > 0, "the link never dropped anything");
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);

    let connection = network.client.connection(client).unwrap();
    assert!(connection.subflows().len() > 1);
}

#[test]
fn test_reordering_link_delivers_in_order() {
    let mut client_config = seeded(7);
    client_config.connection.path_manager = PathManager::NDiffPorts;
    client_config.connection.max_subflows = 2;
    let profile = LinkProfile {
        delay: Duration::from_millis(10),
        jitter: Duration::from_millis(30),
        loss: 0.0,
    };
    let mut network = Network::new(client_config, seeded(8), profile);
    let (client, server) = establish(&mut network);

    let data = pattern(80_000);
    let received = transfer(&mut network, client, server, &data);
    assert_eq!(received, data);
    assert_eq!(network.server.connection(server).unwrap().out_of_order_len(), 0);
}
