use super::*;
use crate::{
    core::{
        connection::ConnectionEvent,
        endpoint::Endpoint,
        test_utils::{CLIENT_ADDR, SERVER_ADDR, init_tracing, pattern, test_config},
    },
    error::Error,
    token::ConnectionHandle,
    transport::{AllRoutes, Datagram, Transmit},
};
use bytes::Bytes;
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};
use tokio::{net::UdpSocket, sync::mpsc};

type Events = mpsc::UnboundedReceiver<(ConnectionHandle, ConnectionEvent)>;

/// Moves every segment from one driver's sink into the other's inbound channel.
fn forward(mut rx: mpsc::Receiver<Transmit>, tx: mpsc::Sender<Datagram>) {
    tokio::spawn(async move {
        while let Some(transmit) = rx.recv().await {
            if tx.send(transmit.into_datagram()).await.is_err() {
                break;
            }
        }
    });
}

fn linked_drivers() -> (DriverHandle, Events, DriverHandle, Events) {
    let (client_out_tx, client_out_rx) = mpsc::channel(1024);
    let (server_out_tx, server_out_rx) = mpsc::channel(1024);
    let (client_in_tx, client_in_rx) = mpsc::channel(1024);
    let (server_in_tx, server_in_rx) = mpsc::channel(1024);
    forward(client_out_rx, server_in_tx);
    forward(server_out_rx, client_in_tx);

    let client_endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    let mut server_endpoint = Endpoint::new(test_config(2), Arc::new(AllRoutes));
    server_endpoint.listen(SERVER_ADDR);

    let (client, client_events) = Driver::spawn(client_endpoint, ChannelSink::new(client_out_tx), client_in_rx);
    let (server, server_events) = Driver::spawn(server_endpoint, ChannelSink::new(server_out_tx), server_in_rx);
    (client, client_events, server, server_events)
}

/// Waits for `wanted`, skipping other events. Returns the connection it belongs to.
async fn wait_for(events: &mut Events, wanted: ConnectionEvent) -> ConnectionHandle {
    loop {
        let (handle, event) = events.recv().await.expect("driver alive");
        if event == wanted {
            return handle;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_transfers_and_closes() {
    init_tracing();
    let (client, mut client_events, server, mut server_events) = linked_drivers();

    let handle = client.connect(CLIENT_ADDR, SERVER_ADDR).await.unwrap();
    assert_eq!(wait_for(&mut client_events, ConnectionEvent::Connected).await, handle);
    let accepted = wait_for(&mut server_events, ConnectionEvent::Connected).await;

    let data = Bytes::from(pattern(50_000));
    assert_eq!(client.write(handle, data.clone()).await.unwrap(), data.len());
    let mut received = Vec::new();
    while received.len() < data.len() {
        wait_for(&mut server_events, ConnectionEvent::DataReadable).await;
        received.extend_from_slice(&server.read(accepted, usize::MAX).await.unwrap());
    }
    assert_eq!(received, data);

    client.close(handle).await.unwrap();
    wait_for(&mut server_events, ConnectionEvent::PeerClosed).await;
    assert_eq!(wait_for(&mut server_events, ConnectionEvent::Closed).await, accepted);
    assert_eq!(wait_for(&mut client_events, ConnectionEvent::Closed).await, handle);

    // Reaped once everything was collected.
    assert_eq!(
        client.write(handle, Bytes::from_static(b"late")).await,
        Err(Error::UnknownConnection)
    );
}

#[tokio::test(start_paused = true)]
async fn test_driver_reports_timeout() {
    init_tracing();
    let (sink_tx, _sink_rx) = mpsc::channel(1024);
    let (_inbound_tx, inbound_rx) = mpsc::channel(16);
    let endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    let (client, mut events) = Driver::spawn(endpoint, ChannelSink::new(sink_tx), inbound_rx);

    let handle = client.connect(CLIENT_ADDR, SERVER_ADDR).await.unwrap();
    let failed = wait_for(&mut events, ConnectionEvent::Error(Error::ConnectionTimeout)).await;
    assert_eq!(failed, handle);
    assert_eq!(wait_for(&mut events, ConnectionEvent::Closed).await, handle);
}

#[tokio::test]
async fn test_driver_rejects_unknown_handle() {
    let (sink_tx, _sink_rx) = mpsc::channel(16);
    let (_inbound_tx, inbound_rx) = mpsc::channel(16);
    let registry_owner = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    let foreign = registry_owner.registry().next_handle();
    let endpoint = Endpoint::new(test_config(2), Arc::new(AllRoutes));
    let (driver, _events) = Driver::spawn(endpoint, ChannelSink::new(sink_tx), inbound_rx);

    assert_eq!(driver.read(foreign, 10).await, Err(Error::UnknownConnection));
    assert_eq!(driver.close(foreign).await, Err(Error::UnknownConnection));
}

#[tokio::test]
async fn test_drivers_talk_over_udp() {
    init_tracing();
    let loopback = Ipv4Addr::LOCALHOST;
    let client_socket = Arc::new(UdpSocket::bind(SocketAddrV4::new(loopback, 0)).await.unwrap());
    let server_socket = Arc::new(UdpSocket::bind(SocketAddrV4::new(loopback, 0)).await.unwrap());
    let (SocketAddr::V4(client_addr), SocketAddr::V4(server_addr)) =
        (client_socket.local_addr().unwrap(), server_socket.local_addr().unwrap())
    else {
        panic!("loopback is IPv4");
    };

    let (client_in_tx, client_in_rx) = mpsc::channel(1024);
    let (server_in_tx, server_in_rx) = mpsc::channel(1024);
    tokio::spawn(udp_receiver_task(client_socket.clone(), client_addr, client_in_tx));
    tokio::spawn(udp_receiver_task(server_socket.clone(), server_addr, server_in_tx));

    let mut server_endpoint = Endpoint::new(test_config(2), Arc::new(AllRoutes));
    server_endpoint.listen(server_addr);
    let client_endpoint = Endpoint::new(test_config(1), Arc::new(AllRoutes));
    let (server, mut server_events) = Driver::spawn(server_endpoint, UdpSink::new(server_socket), server_in_rx);
    let (client, mut client_events) = Driver::spawn(client_endpoint, UdpSink::new(client_socket), client_in_rx);

    let handle = client.connect(client_addr, server_addr).await.unwrap();
    wait_for(&mut client_events, ConnectionEvent::Connected).await;
    let accepted = wait_for(&mut server_events, ConnectionEvent::Connected).await;

    client.write(handle, Bytes::from_static(b"over the wire")).await.unwrap();
    wait_for(&mut server_events, ConnectionEvent::DataReadable).await;
    assert_eq!(&server.read(accepted, 64).await.unwrap()[..], b"over the wire");
}

#[test]
fn test_connection_is_a_multipath_socket() {
    use crate::core::test_utils::{LinkedPair, read_all};

    fn send_all(socket: &mut impl MultipathSocket, data: &[u8], now: tokio::time::Instant) -> usize {
        assert!(socket.is_established());
        socket.send(data, now).unwrap()
    }

    let mut pair = LinkedPair::established(test_config(1), test_config(2));
    let now = pair.now;
    assert_eq!(send_all(&mut pair.client, b"through the trait", now), 17);
    pair.pump();
    assert_eq!(read_all(pair.server_mut()), b"through the trait");
    assert!(MultipathSocket::receive(&mut pair.client, 10).is_empty());
    MultipathSocket::close(&mut pair.client, now).unwrap();
    assert!(!MultipathSocket::is_established(&pair.client));
}
