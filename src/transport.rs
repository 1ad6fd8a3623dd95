//! Types exchanged with the packet transport, and the route oracle consulted before
//! opening additional subflows.
//!
//! 与报文传输层交换的类型，以及在打开额外子流前查询的路由接口。

use crate::packet::segment::Segment;
use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4},
};

/// A segment received from the network.
/// 从网络接收到的报文段。
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The remote endpoint that sent the segment.
    pub src: SocketAddrV4,
    /// The local endpoint the segment was addressed to.
    pub dst: SocketAddrV4,
    pub segment: Segment,
    /// Set when the network marked the packet with Congestion Experienced.
    /// 当网络将该包标记为拥塞经历（CE）时设置。
    pub congestion_experienced: bool,
}

impl Datagram {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, segment: Segment) -> Self {
        Self {
            src,
            dst,
            segment,
            congestion_experienced: false,
        }
    }
}

/// A segment the engine wants sent.
/// 引擎要求发送的报文段。
#[derive(Debug, Clone)]
pub struct Transmit {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub segment: Segment,
}

impl Transmit {
    /// Turns an outgoing segment into the datagram the peer will see.
    /// 将发出的报文段转换为对端将看到的数据报。
    pub fn into_datagram(self) -> Datagram {
        Datagram::new(self.src, self.dst, self.segment)
    }
}

/// Answers whether a path exists between two addresses.
/// 判断两个地址之间是否存在路径。
pub trait RouteTable: Send + Sync {
    fn has_route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool;
}

/// A route table where every pair of addresses is reachable.
/// 所有地址对都可达的路由表。
#[derive(Debug, Clone, Copy, Default)]
pub struct AllRoutes;

impl RouteTable for AllRoutes {
    fn has_route(&self, _src: Ipv4Addr, _dst: Ipv4Addr) -> bool {
        true
    }
}

/// A fixed set of reachable `(src, dst)` pairs.
/// 固定的可达 `(src, dst)` 地址对集合。
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: HashSet<(Ipv4Addr, Ipv4Addr)>,
}

impl StaticRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.routes.insert((src, dst));
        self
    }
}

impl RouteTable for StaticRoutes {
    fn has_route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        self.routes.contains(&(src, dst))
    }
}
