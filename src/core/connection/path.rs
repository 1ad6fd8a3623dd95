//! 路径管理：地址通告、额外子流的建立与加入
//! Path management: address advertisement, opening and joining extra subflows

use super::{Connection, Role, TimerEvent};
use crate::{
    config::PathManager,
    core::subflow::{SubflowId, SubflowState},
    error::{Error, Result},
    packet::{flags::Flags, option::MptcpOption, segment::Segment},
    transport::{Datagram, Transmit},
};
use rand::Rng;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Path-manager bookkeeping of a connection.
/// 连接的路径管理状态。
#[derive(Debug, Default)]
pub(super) struct PathState {
    /// Whether our local addresses were sent in an ADD_ADDR.
    advertised: bool,
    /// Addresses the peer advertised, with their address ids.
    remote_addresses: Vec<(u8, Ipv4Addr)>,
    /// Source port base of NDiffPorts subflows.
    ndiff_base_port: u16,
}

/// `count` random delays below `max`, pairwise distinct whenever the range allows it.
///
/// 生成 `count` 个小于 `max` 的随机延迟，在范围允许时两两不同。
pub(super) fn distinct_gaps<R: Rng + ?Sized>(rng: &mut R, count: usize, max: Duration) -> Vec<Duration> {
    let span = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    let mut gaps: Vec<Duration> = Vec::with_capacity(count);
    while gaps.len() < count {
        let gap = if span == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.random_range(0..span))
        };
        if span >= count as u64 && gaps.contains(&gap) {
            continue;
        }
        gaps.push(gap);
    }
    gaps
}

/// Builds the RST answering a segment nobody accepts.
/// 构造对无人接受的报文段的 RST 应答。
pub(crate) fn reset_for(datagram: &Datagram) -> Transmit {
    let header = &datagram.segment.header;
    let segment = Segment::control(
        (header.dst_port, header.src_port),
        header.ack,
        header.seq.wrapping_add(1),
        Flags::RST,
        0,
        Vec::new(),
    );
    Transmit {
        src: datagram.dst,
        dst: datagram.src,
        segment,
    }
}

impl Connection {
    /// Runs the configured path manager once the initial subflow is up.
    /// 初始子流建立后运行配置的路径管理器。
    pub(super) fn start_path_manager(&mut self, now: Instant) {
        match self.config.connection.path_manager {
            PathManager::Default => {}
            PathManager::FullMesh => {
                let options = self.local_advertisement();
                if options.is_empty() {
                    return;
                }
                debug!(connection = %self.handle, addresses = options.len(), "Advertising local addresses");
                self.send_ack_with(SubflowId(0), options);
                self.paths.advertised = true;
            }
            PathManager::NDiffPorts => {
                let local_port = self.subflows[0].local.port();
                let mut base = self.rng.random_range(0..65000u16);
                if base == local_port {
                    base += 1;
                }
                self.paths.ndiff_base_port = base;
                let extra = usize::from(self.config.connection.max_subflows.saturating_sub(1));
                let gap = self.config.connection.subflow_spawn_gap;
                let delays = distinct_gaps(&mut self.rng, extra, gap);
                for (ordinal, delay) in (1..).zip(delays) {
                    self.timers.schedule(now + delay, TimerEvent::OpenSubflow(ordinal));
                }
                debug!(connection = %self.handle, base_port = base, extra, "Scheduled extra subflows");
            }
        }
    }

    fn local_advertisement(&self) -> Vec<MptcpOption> {
        self.config
            .connection
            .local_addresses
            .iter()
            .zip(1u8..)
            .map(|(&address, address_id)| MptcpOption::AddAddr { address_id, address })
            .collect()
    }

    /// Opens one more subflow between the primary addresses on the next NDiffPorts port.
    pub(super) fn open_ndiff_subflow(&mut self, now: Instant) -> Result<SubflowId> {
        let primary = &self.subflows[0];
        if !primary.state.is_synchronized() {
            return Err(Error::NotConnected);
        }
        let offset = u16::try_from(self.subflows.len()).map_err(|_| Error::TooManySubflows)?;
        let port = self.paths.ndiff_base_port.wrapping_add(offset);
        let local = SocketAddrV4::new(*primary.local.ip(), port);
        let remote = primary.remote;
        self.open_subflow(local, remote, 0, now)
    }

    /// Opens a subflow with a SYN carrying MP_JOIN and the peer's token.
    ///
    /// 使用携带 MP_JOIN 和对端令牌的 SYN 打开一个子流。
    pub fn open_subflow(
        &mut self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        address_id: u8,
        now: Instant,
    ) -> Result<SubflowId> {
        if self.remote_token.is_none() {
            return Err(Error::NotConnected);
        }
        if self.close_requested || self.state == super::ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        let id = self.push_subflow(local, remote, SubflowState::SynSent, address_id)?;
        info!(connection = %self.handle, subflow = %id, %local, %remote, "Joining subflow");
        self.send_syn(id, now);
        self.arm_control(id, self.config.reliability.syn_timeout, now);
        Ok(id)
    }

    /// Records addresses the peer advertised and reacts per role and path manager.
    /// 记录对端通告的地址，并根据角色和路径管理器作出反应。
    pub(super) fn on_add_addr(&mut self, id: SubflowId, addresses: &[(u8, Ipv4Addr)], now: Instant) {
        for &entry in addresses {
            if !self.paths.remote_addresses.contains(&entry) {
                trace!(connection = %self.handle, subflow = %id, address_id = entry.0, address = %entry.1, "Peer advertised address");
                self.paths.remote_addresses.push(entry);
            }
        }
        match self.role {
            Role::Server => {
                if self.paths.advertised {
                    return;
                }
                self.paths.advertised = true;
                let options = self.local_advertisement();
                if !options.is_empty() {
                    debug!(connection = %self.handle, addresses = options.len(), "Answering with local addresses");
                    self.send_ack_with(id, options);
                }
            }
            Role::Client => {
                if self.config.connection.path_manager == PathManager::FullMesh && self.paths.advertised {
                    self.initiate_full_mesh(now);
                }
            }
        }
    }

    /// Opens a subflow for every usable (local, remote) address pair not yet covered.
    fn initiate_full_mesh(&mut self, now: Instant) {
        let primary_local = self.subflows[0].local;
        let primary_remote = self.subflows[0].remote;
        let locals: Vec<(u8, Ipv4Addr)> = self
            .config
            .connection
            .local_addresses
            .iter()
            .zip(1u8..)
            .map(|(&address, address_id)| (address_id, address))
            .collect();
        let remotes = self.paths.remote_addresses.clone();
        let limit = usize::from(self.config.connection.max_subflows);

        for &(address_id, local_ip) in &locals {
            if local_ip == *primary_local.ip() {
                continue;
            }
            for &(_, remote_ip) in &remotes {
                if self.subflows.len() >= limit {
                    return;
                }
                if remote_ip == *primary_remote.ip() || !self.routes.has_route(local_ip, remote_ip) {
                    continue;
                }
                let exists = self
                    .subflows
                    .iter()
                    .any(|subflow| *subflow.local.ip() == local_ip && *subflow.remote.ip() == remote_ip);
                if exists {
                    continue;
                }
                let local = SocketAddrV4::new(local_ip, primary_local.port());
                let remote = SocketAddrV4::new(remote_ip, primary_remote.port());
                if let Err(err) = self.open_subflow(local, remote, address_id, now) {
                    warn!(connection = %self.handle, %local, %remote, error = %err, "Full-mesh subflow not opened");
                    return;
                }
            }
        }
    }

    /// Attaches a subflow requested by a SYN carrying MP_JOIN. An invalid token or a full
    /// subflow set is answered with RST; the connection itself is left untouched.
    ///
    /// 接纳由携带 MP_JOIN 的 SYN 请求的子流。令牌无效或子流已满时回复 RST，连接本身不受影响。
    pub(crate) fn accept_join(&mut self, datagram: Datagram, now: Instant) -> Result<SubflowId> {
        let join = datagram.segment.mp_join();
        let flags = datagram.segment.flags().significant();
        let Some((token, address_id)) = join.filter(|_| flags == Flags::SYN) else {
            self.transmits.push_back(reset_for(&datagram));
            return Err(Error::ProtocolViolation("join without SYN + MP_JOIN".into()));
        };
        if token != self.local_token {
            warn!(connection = %self.handle, token, "MP_JOIN for a foreign token");
            self.transmits.push_back(reset_for(&datagram));
            return Err(Error::ProtocolViolation(format!("MP_JOIN token {token} is not ours")));
        }
        if self.close_requested {
            self.transmits.push_back(reset_for(&datagram));
            return Err(Error::ConnectionClosed);
        }
        let id = match self.push_subflow(datagram.dst, datagram.src, SubflowState::Listen, address_id) {
            Ok(id) => id,
            Err(err) => {
                debug!(connection = %self.handle, src = %datagram.src, "Subflow limit reached, refusing join");
                self.transmits.push_back(reset_for(&datagram));
                return Err(err);
            }
        };
        info!(connection = %self.handle, subflow = %id, remote = %datagram.src, address_id, "Accepting joined subflow");
        self.on_segment(id, datagram, now)?;
        Ok(id)
    }
}
