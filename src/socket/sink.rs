//! Where the driver sends its segments.
//!
//! 驱动器发送报文段的目的地。

use crate::{
    error::{Error, Result},
    packet::segment::Segment,
    transport::{Datagram, Transmit},
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, trace, warn};

/// Largest datagram read from a UDP socket.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Outbound half of a packet transport.
///
/// 报文传输的发送端。
#[async_trait]
pub trait SegmentSink: Send + Sync + 'static {
    /// Sends one segment to `transmit.dst`.
    /// 将一个报文段发送到 `transmit.dst`。
    async fn send(&self, transmit: Transmit) -> Result<()>;
}

/// Hands segments to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Transmit>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Transmit>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SegmentSink for ChannelSink {
    async fn send(&self, transmit: Transmit) -> Result<()> {
        self.tx.send(transmit).await.map_err(|_| Error::ChannelClosed)
    }
}

/// Encodes segments into UDP datagrams. The UDP socket address stands in for the
/// subflow address.
///
/// 将报文段编码为 UDP 数据报，UDP 套接字地址即子流地址。
#[derive(Debug, Clone)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl SegmentSink for UdpSink {
    async fn send(&self, transmit: Transmit) -> Result<()> {
        let mut buf = BytesMut::with_capacity(transmit.segment.encoded_len());
        transmit.segment.encode(&mut buf);
        trace!(dst = %transmit.dst, bytes = buf.len(), "Sending UDP datagram");
        self.socket
            .send_to(&buf, SocketAddr::V4(transmit.dst))
            .await?;
        Ok(())
    }
}

/// Reads datagrams from `socket`, decodes them and forwards them to a driver's
/// inbound channel. Undecodable datagrams are dropped. Returns when the channel closes
/// or the socket fails.
///
/// 从 `socket` 读取数据报，解码后转发到驱动器的入站通道。
pub async fn udp_receiver_task(socket: Arc<UdpSocket>, local: SocketAddrV4, inbound: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(%local, error = %err, "UDP receive failed, stopping");
                return;
            }
        };
        let SocketAddr::V4(src) = from else {
            debug!(%from, "Ignoring IPv6 datagram");
            continue;
        };
        let segment = match Segment::parse(&buf[..len]) {
            Ok(segment) => segment,
            Err(err) => {
                debug!(%src, len, error = %err, "Dropping undecodable datagram");
                continue;
            }
        };
        if inbound.send(Datagram::new(src, local, segment)).await.is_err() {
            return;
        }
    }
}
