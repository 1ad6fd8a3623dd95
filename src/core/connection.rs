//! 多路径连接控制器
//! Multipath connection controller
//!
//! 职责：
//! - 拥有子流数组、连接级序列号、收发缓冲区和乱序存储
//! - 将收到的报文段分发到对应子流的状态机
//! - 管理定时器、输出队列和应用事件
//!
//! The controller is sans-IO. Every handler takes the current time and runs to
//! completion; outgoing segments are collected with [`Connection::poll_transmit`],
//! timers are driven through [`Connection::poll_timeout`] and
//! [`Connection::handle_timeout`], and application-facing changes surface through
//! [`Connection::poll_event`].

mod ack;
mod close;
mod event;
mod handshake;
mod listener;
mod path;
mod receive;
mod send;
mod timeout;


pub use event::ConnectionEvent;
pub use listener::Listener;
pub(crate) use path::reset_for;

use crate::{
    config::Config,
    core::{
        congestion::{CongestionEngine, WindowView, incast::IncastDetector},
        reliability::{mapping::OutOfOrderStore, recv_buffer::ReceiveBuffer, send_buffer::SendBuffer},
        subflow::{Subflow, SubflowId, SubflowState},
    },
    error::{Error, Result},
    packet::flags::Flags,
    timer::TimerQueue,
    token::{ConnectionHandle, TokenRegistry},
    transport::{Datagram, RouteTable, Transmit},
};
use bytes::Bytes;
use path::PathState;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{collections::VecDeque, net::SocketAddrV4, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Which side opened the connection.
/// 连接的哪一方发起了连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 连接整体状态
/// Connection-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The initial subflow has not completed its handshake.
    Connecting,
    Established,
    /// `close` was called and subflows are shutting down.
    Closing,
    /// Every subflow is closed and the token is released.
    Closed,
}

/// Timers a connection schedules on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Retransmit(SubflowId),
    /// SYN, SYN+ACK and FIN retransmission.
    ControlRetransmit(SubflowId),
    LastAck(SubflowId),
    TimeWait(SubflowId),
    /// Opens the extra subflow with the given ordinal.
    OpenSubflow(u8),
    DeferredFin(SubflowId),
}

/// 一个多路径连接
/// One multipath connection
pub struct Connection {
    handle: ConnectionHandle,
    role: Role,
    state: ConnectionState,
    config: Config,
    registry: TokenRegistry,
    routes: Arc<dyn RouteTable>,
    rng: StdRng,

    local_token: u32,
    remote_token: Option<u32>,

    subflows: Vec<Subflow>,
    /// Next data sequence number to assign.
    /// 下一个要分配的数据序列号。
    tx_next: u32,
    /// Next data sequence number to deliver.
    /// 下一个要交付的数据序列号。
    rx_next: u32,
    send_buffer: SendBuffer,
    recv_buffer: ReceiveBuffer,
    out_of_order: OutOfOrderStore,
    congestion: CongestionEngine,
    incast: IncastDetector,

    timers: TimerQueue<TimerEvent>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ConnectionEvent>,

    /// Round-robin position of the scheduler.
    next_subflow: usize,
    close_requested: bool,
    close_on_empty: bool,
    peer_closed: bool,
    paths: PathState,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("local_token", &self.local_token)
            .field("remote_token", &self.remote_token)
            .field("subflows", &self.subflows.len())
            .field("tx_next", &self.tx_next)
            .field("rx_next", &self.rx_next)
            .finish()
    }
}

impl Connection {
    fn new(
        role: Role,
        config: Config,
        registry: TokenRegistry,
        routes: Arc<dyn RouteTable>,
    ) -> Result<Self> {
        let mut rng = match config.connection.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let handle = registry.next_handle();
        let local_token = registry.allocate(handle, &mut rng)?;
        let congestion = CongestionEngine::from_config(&config.congestion_control, rng.random());
        let send_buffer = SendBuffer::new(config.connection.send_buffer_capacity_bytes);
        Ok(Self {
            handle,
            role,
            state: ConnectionState::Connecting,
            config,
            registry,
            routes,
            rng,
            local_token,
            remote_token: None,
            subflows: Vec::new(),
            tx_next: 0,
            rx_next: 0,
            send_buffer,
            recv_buffer: ReceiveBuffer::new(),
            out_of_order: OutOfOrderStore::new(),
            congestion,
            incast: IncastDetector::default(),
            timers: TimerQueue::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            next_subflow: 0,
            close_requested: false,
            close_on_empty: false,
            peer_closed: false,
            paths: PathState::default(),
        })
    }

    /// Opens a connection: creates the initial subflow and sends a SYN carrying
    /// MP_CAPABLE with a freshly allocated token.
    ///
    /// 打开连接：创建初始子流并发送携带新分配令牌的 MP_CAPABLE SYN。
    pub fn connect(
        config: Config,
        registry: TokenRegistry,
        routes: Arc<dyn RouteTable>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        now: Instant,
    ) -> Result<Self> {
        let mut connection = Self::new(Role::Client, config, registry, routes)?;
        let id = connection.push_subflow(local, remote, SubflowState::SynSent, 0)?;
        info!(
            connection = %connection.handle,
            %local,
            %remote,
            token = connection.local_token,
            "Opening multipath connection"
        );
        connection.send_syn(id, now);
        connection.arm_control(id, connection.config.reliability.syn_timeout, now);
        Ok(connection)
    }

    /// Creates the server side of a connection from an MP_CAPABLE SYN.
    pub(crate) fn accept(
        config: Config,
        registry: TokenRegistry,
        routes: Arc<dyn RouteTable>,
        datagram: Datagram,
        remote_token: u32,
        now: Instant,
    ) -> Result<Self> {
        let mut connection = Self::new(Role::Server, config, registry, routes)?;
        connection.remote_token = Some(remote_token);
        let id = connection.push_subflow(datagram.dst, datagram.src, SubflowState::Listen, 0)?;
        info!(
            connection = %connection.handle,
            local = %datagram.dst,
            remote = %datagram.src,
            token = connection.local_token,
            remote_token,
            "Accepting multipath connection"
        );
        connection.on_segment(id, datagram, now)?;
        Ok(connection)
    }

    /// Adds a subflow with a random initial sequence number.
    fn push_subflow(
        &mut self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        state: SubflowState,
        address_id: u8,
    ) -> Result<SubflowId> {
        if self.subflows.len() >= usize::from(self.config.connection.max_subflows.max(1)) {
            return Err(Error::TooManySubflows);
        }
        let id = SubflowId(self.subflows.len() as u8);
        let isn = self.rng.random_range(1..=u32::from(u16::MAX));
        let mut subflow = Subflow::new(id, local, remote, state, isn, &self.config);
        subflow.address_id = address_id;
        debug!(connection = %self.handle, subflow = %id, %local, %remote, isn, state = ?state, "Created subflow");
        self.subflows.push(subflow);
        Ok(id)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn local_token(&self) -> u32 {
        self.local_token
    }

    pub fn remote_token(&self) -> Option<u32> {
        self.remote_token
    }

    pub fn subflows(&self) -> &[Subflow] {
        &self.subflows
    }

    pub fn subflow(&self, id: SubflowId) -> Option<&Subflow> {
        self.subflows.get(id.index())
    }

    /// Subflows that are neither CLOSED nor LISTEN.
    pub fn live_subflows(&self) -> usize {
        self.subflows
            .iter()
            .filter(|subflow| !matches!(subflow.state, SubflowState::Closed | SubflowState::Listen))
            .count()
    }

    pub fn congestion(&self) -> &CongestionEngine {
        &self.congestion
    }

    /// Bytes delivered in order and not yet read.
    pub fn readable_bytes(&self) -> usize {
        self.recv_buffer.available()
    }

    /// Bytes written but not yet handed to a subflow.
    pub fn pending_bytes(&self) -> usize {
        self.send_buffer.pending_bytes()
    }

    pub fn tx_next(&self) -> u32 {
        self.tx_next
    }

    pub fn rx_next(&self) -> u32 {
        self.rx_next
    }

    pub fn out_of_order_len(&self) -> usize {
        self.out_of_order.len()
    }

    /// Queues application bytes and runs the scheduler. Returns how many bytes fit in
    /// the send buffer.
    ///
    /// 将应用字节放入发送缓冲区并运行调度器，返回被接受的字节数。
    pub fn write(&mut self, data: &[u8], now: Instant) -> Result<usize> {
        if self.close_requested || self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        let accepted = self.send_buffer.enqueue(data);
        trace!(connection = %self.handle, accepted, pending = self.send_buffer.pending_bytes(), "Buffered application data");
        self.send_pending(now);
        Ok(accepted)
    }

    /// Reads up to `max` in-order bytes.
    /// 读取最多 `max` 个按序字节。
    pub fn read(&mut self, max: usize) -> Bytes {
        self.recv_buffer.read(max)
    }

    /// Feeds one received segment.
    ///
    /// Protocol violations reset the connection and are returned as errors, as is an
    /// acknowledgment for data that was never sent.
    ///
    /// 输入一个接收到的报文段。
    pub fn handle_datagram(&mut self, datagram: Datagram, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Closed {
            trace!(connection = %self.handle, "Segment for closed connection ignored");
            return Ok(());
        }
        let Some(id) = self.find_subflow(datagram.dst, datagram.src) else {
            if datagram.segment.flags().significant() == Flags::SYN
                && datagram.segment.mp_join().is_some()
            {
                datagram.segment.validate_sequence_space()?;
                return self.accept_join(datagram, now).map(|_| ());
            }
            debug!(
                connection = %self.handle,
                src = %datagram.src,
                dst = %datagram.dst,
                "No subflow for segment"
            );
            return Ok(());
        };

        let result = datagram
            .segment
            .validate_sequence_space()
            .and_then(|()| self.on_segment(id, datagram, now));
        if let Err(err) = &result {
            match err {
                Error::InvariantViolation(reason) => {
                    error!(connection = %self.handle, subflow = %id, reason = %reason, "Invariant violated, aborting")
                }
                other => {
                    warn!(connection = %self.handle, subflow = %id, error = %other, "Protocol violation, resetting")
                }
            }
            self.abort(err.clone(), None);
        }
        result
    }

    /// The subflow bound to a 4-tuple, if it is still open.
    pub fn find_subflow(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<SubflowId> {
        self.subflows
            .iter()
            .find(|subflow| {
                subflow.local == local
                    && subflow.remote == remote
                    && subflow.state != SubflowState::Closed
            })
            .map(|subflow| subflow.id)
    }

    /// The earliest timer deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fires every timer due at `now`.
    /// 触发所有在 `now` 到期的定时器。
    pub fn handle_timeout(&mut self, now: Instant) {
        for (handle, event) in self.timers.pop_due(now) {
            if !self.timers.fire(handle) {
                continue;
            }
            trace!(connection = %self.handle, event = ?event, "Timer fired");
            match event {
                TimerEvent::Retransmit(id) => self.on_retransmit_timeout(id, now),
                TimerEvent::ControlRetransmit(id) => self.on_control_timeout(id, now),
                TimerEvent::LastAck(id) => self.on_last_ack_timeout(id, now),
                TimerEvent::TimeWait(id) => self.on_time_wait_timeout(id),
                TimerEvent::OpenSubflow(ordinal) => self.on_open_subflow_timeout(ordinal, now),
                TimerEvent::DeferredFin(id) => self.on_deferred_fin(id, now),
            }
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Closed, with every segment, event and readable byte collected.
    pub fn is_drained(&self) -> bool {
        self.state == ConnectionState::Closed
            && self.transmits.is_empty()
            && self.events.is_empty()
            && self.recv_buffer.available() == 0
    }

    fn subflow_mut(&mut self, id: SubflowId) -> &mut Subflow {
        &mut self.subflows[id.index()]
    }

    /// Window snapshots of every synchronized subflow plus `id`, and the position of
    /// `id` among them.
    fn coupled_views(&self, id: SubflowId) -> (Vec<WindowView>, usize) {
        let suppressed = self.incast_suppressed();
        let mut views = Vec::with_capacity(self.subflows.len());
        let mut index = None;
        for subflow in &self.subflows {
            if subflow.id == id {
                index = Some(views.len());
                views.push(subflow.view());
            } else if subflow.state.is_synchronized() && !(suppressed && subflow.id.index() != 0) {
                views.push(subflow.view());
            }
        }
        match index {
            Some(index) => (views, index),
            None => {
                // `id` is always present in the arena.
                views.push(self.subflows[id.index()].view());
                let index = views.len() - 1;
                (views, index)
            }
        }
    }

    /// Window snapshots of the synchronized subflows.
    fn all_views(&self) -> Vec<WindowView> {
        let suppressed = self.incast_suppressed();
        self.subflows
            .iter()
            .filter(|subflow| subflow.state.is_synchronized())
            .filter(|subflow| !suppressed || subflow.id.index() == 0)
            .map(Subflow::view)
            .collect()
    }

    /// Whether an incast confines new data to the initial subflow.
    /// 是否因 incast 而只在初始子流上发送新数据。
    pub fn incast_suppressed(&self) -> bool {
        let Some(adaptive) = &self.config.congestion_control.ecn.adaptive_subflows else {
            return false;
        };
        self.incast.detected(adaptive)
            && self
                .subflows
                .first()
                .is_some_and(|initial| initial.state == SubflowState::Established)
    }

    fn refresh_coupling(&mut self) {
        let views = self.all_views();
        if !views.is_empty() {
            self.congestion.on_congestion_event(&views);
        }
    }

    /// Resets every live subflow and tears the connection down with `error`.
    ///
    /// 重置所有存活子流，并以 `error` 拆除连接。
    pub(crate) fn abort(&mut self, error: Error, except: Option<SubflowId>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!(connection = %self.handle, error = %error, "Aborting connection");
        for index in 0..self.subflows.len() {
            let id = SubflowId(index as u8);
            let state = self.subflows[index].state;
            if matches!(state, SubflowState::Closed) {
                continue;
            }
            if Some(id) != except && state != SubflowState::Listen {
                self.send_reset(id);
            }
            self.mark_closed(id);
        }
        self.send_buffer.clear();
        self.close_on_empty = false;
        self.events.push_back(ConnectionEvent::Error(error));
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.timers.clear();
        for subflow in &mut self.subflows {
            subflow.timers = Default::default();
        }
        self.registry.release(self.local_token);
        info!(
            connection = %self.handle,
            token = self.local_token,
            delivered = self.rx_next,
            sent = self.tx_next,
            "Connection closed"
        );
        self.events.push_back(ConnectionEvent::Closed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.registry.release(self.local_token);
        }
    }
}
