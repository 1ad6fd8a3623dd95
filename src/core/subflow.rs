//! 子流状态与序列号记账
//! Subflow state and sequence-number bookkeeping
//!
//! A subflow is one TCP-like path of a connection. It owns its own sequence space,
//! congestion window, recovery state, unacked mappings and RTT estimator. The state
//! machine that drives it lives in `core::connection`.

use crate::{
    config::Config,
    core::{
        congestion::{WindowView, dctcp::DctcpState, incast::SubflowSample},
        reliability::{
            mapping::{SubflowCursors, UnackedList},
            rtt::RttEstimator,
        },
    },
    timer::TimerHandle,
};
use std::net::SocketAddrV4;

/// Position of a subflow in its connection's arena.
/// 子流在其连接子流数组中的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubflowId(pub u8);

impl SubflowId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for SubflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 子流状态
/// Subflow states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubflowState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl SubflowState {
    /// States in which both sides have agreed on sequence numbers and the subflow
    /// still counts toward the aggregate congestion window.
    ///
    /// 双方已同步序列号、且子流仍计入总拥塞窗口的状态。
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            Self::Established
                | Self::FinWait1
                | Self::FinWait2
                | Self::CloseWait
                | Self::Closing
                | Self::LastAck
        )
    }

    /// States in which unacknowledged data may still be outstanding and has to be
    /// recovered.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::Closing | Self::CloseWait | Self::LastAck
        )
    }

    /// States in which the local FIN has been sent.
    pub fn has_sent_fin(self) -> bool {
        matches!(
            self,
            Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }
}

/// Timer handles a subflow may hold at any time.
/// 子流可能持有的定时器句柄。
#[derive(Debug, Default, Clone)]
pub struct SubflowTimers {
    pub retransmit: Option<TimerHandle>,
    /// Re-sends SYN, SYN+ACK, FIN and FIN+ACK.
    pub control: Option<TimerHandle>,
    pub last_ack: Option<TimerHandle>,
    pub time_wait: Option<TimerHandle>,
}

/// 一个子流
/// One subflow
#[derive(Debug)]
pub struct Subflow {
    pub id: SubflowId,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub state: SubflowState,
    /// Address id announced for the local address of this subflow.
    pub address_id: u8,
    pub isn: u32,

    /// Next subflow sequence number to send.
    /// 下一个要发送的子流序列号。
    pub tx_seq: u32,
    /// Next subflow sequence number expected from the peer.
    /// 期望从对端接收的下一个子流序列号。
    pub rx_seq: u32,
    /// Highest byte cumulatively acknowledged by the peer.
    /// 对端累积确认的最高字节。
    pub highest_ack: u32,
    /// Highest byte ever sent.
    pub max_seq_sent: u32,
    /// Highest byte sent since the last timeout rewind.
    pub high_tx_mark: u32,

    pub mss: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_acks: u32,
    pub in_fast_recovery: bool,
    /// `high_tx_mark + 1` at the time fast recovery was entered.
    pub recover: u32,
    /// Bytes the window was inflated by during fast recovery.
    pub inflation: u32,
    /// Peer advertised receive window, in bytes.
    pub remote_window: u32,

    pub unacked: UnackedList,
    pub rtt: RttEstimator,
    pub timers: SubflowTimers,
    /// Remaining SYN / SYN+ACK retransmissions.
    pub syn_retries_left: u8,
    /// FIN / FIN+ACK retransmissions made so far.
    pub control_retries: u8,

    /// Sequence number of the peer's FIN, once seen.
    pub peer_fin: Option<u32>,
    /// Sequence number of our FIN, once sent.
    pub local_fin: Option<u32>,

    pub dctcp: DctcpState,
    /// Set when CE-marked data arrived; the next ACK echoes it.
    pub echo_congestion: bool,
}

impl Subflow {
    pub fn new(
        id: SubflowId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        state: SubflowState,
        isn: u32,
        config: &Config,
    ) -> Self {
        let cc = &config.congestion_control;
        let reliability = &config.reliability;
        let mss = cc.mss;
        Self {
            id,
            local,
            remote,
            state,
            address_id: 0,
            isn,
            tx_seq: isn,
            rx_seq: 0,
            highest_ack: isn - 1,
            max_seq_sent: isn - 1,
            high_tx_mark: isn - 1,
            mss,
            cwnd: (cc.initial_cwnd_packets * mss).max(mss),
            ssthresh: cc.initial_ssthresh,
            dup_acks: 0,
            in_fast_recovery: false,
            recover: 0,
            inflation: 0,
            remote_window: u32::from(config.connection.advertised_window),
            unacked: UnackedList::new(),
            rtt: RttEstimator::new(
                reliability.initial_rto,
                reliability.min_rto,
                reliability.max_rto,
            ),
            timers: SubflowTimers::default(),
            syn_retries_left: reliability.syn_retries,
            control_retries: 0,
            peer_fin: None,
            local_fin: None,
            dctcp: DctcpState::default(),
            echo_congestion: false,
        }
    }

    /// `(local port, remote port)` for outgoing segments.
    pub fn ports(&self) -> (u16, u16) {
        (self.local.port(), self.remote.port())
    }

    /// Bytes sent since the last rewind and not yet acknowledged.
    /// 自上次回退以来已发送但尚未确认的字节数。
    pub fn bytes_in_flight(&self) -> u32 {
        self.high_tx_mark.saturating_sub(self.highest_ack)
    }

    /// Bytes between the cumulative ACK and `tx_seq`.
    pub fn outstanding(&self) -> u32 {
        self.tx_seq.saturating_sub(self.highest_ack + 1)
    }

    /// True while the subflow resends its backlog after a timeout rewind.
    /// 子流在超时回退后重发积压数据时为真。
    pub fn in_timeout_recovery(&self) -> bool {
        self.max_seq_sent >= self.tx_seq
    }

    /// Room left in the window. Zero when less than one MSS remains while at least
    /// one MSS is waiting to be sent.
    ///
    /// 窗口中剩余的空间。当剩余不足一个 MSS 而待发送数据至少有一个 MSS 时为零。
    pub fn available_window(&self, rwnd_scale: u32, pending_bytes: usize) -> u32 {
        let window = self
            .remote_window
            .saturating_mul(rwnd_scale)
            .min(self.cwnd);
        let available = window.saturating_sub(self.outstanding());
        if available < self.mss && pending_bytes >= self.mss as usize {
            0
        } else {
            available
        }
    }

    /// Sets `cwnd`, never below one MSS.
    pub fn set_cwnd(&mut self, cwnd: u32) {
        self.cwnd = cwnd.max(self.mss);
    }

    /// Moves the receive cursor, consuming the peer's FIN once it is in sequence.
    /// 移动接收游标，并在对端 FIN 按序到达时消耗它。
    pub fn advance_rx(&mut self, len: u32) {
        self.rx_seq += len;
        self.consume_peer_fin();
    }

    pub fn consume_peer_fin(&mut self) {
        if self.peer_fin == Some(self.rx_seq) {
            self.rx_seq += 1;
        }
    }

    /// True once the peer's FIN has been received in sequence.
    pub fn peer_finished(&self) -> bool {
        self.peer_fin.is_some_and(|fin| fin < self.rx_seq)
    }

    /// True once our FIN has been acknowledged.
    pub fn local_fin_acked(&self) -> bool {
        self.local_fin.is_some_and(|fin| self.highest_ack >= fin)
    }

    /// The highest acknowledgment number the peer may legally send.
    pub fn max_valid_ack(&self) -> u32 {
        match self.local_fin {
            Some(fin) => fin + 1,
            None => self.max_seq_sent + 1,
        }
    }

    pub fn view(&self) -> WindowView {
        WindowView {
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            mss: self.mss,
            srtt: self.rtt.srtt(),
            in_fast_recovery: self.in_fast_recovery,
            marked_fraction: self.dctcp.last_fraction(),
        }
    }

    pub fn incast_sample(&self) -> SubflowSample {
        SubflowSample {
            established: self.state == SubflowState::Established,
            cwnd_packets: self.cwnd / self.mss.max(1),
            marked_fraction: self.dctcp.last_fraction(),
            recovering: self.in_fast_recovery || self.in_timeout_recovery(),
        }
    }

    /// Resets recovery state and forgets every outstanding mapping.
    pub fn clear_transmit_state(&mut self) {
        self.unacked.clear();
        self.rtt.clear_history();
        self.in_fast_recovery = false;
        self.inflation = 0;
        self.dup_acks = 0;
    }
}

impl SubflowCursors for [Subflow] {
    fn rx_seq(&self, id: SubflowId) -> Option<u32> {
        self.get(id.index())
            .filter(|subflow| subflow.state != SubflowState::Closed)
            .map(|subflow| subflow.rx_seq)
    }

    fn advance_rx(&mut self, id: SubflowId, len: u32) {
        if let Some(subflow) = self.get_mut(id.index()) {
            subflow.advance_rx(len);
        }
    }
}
