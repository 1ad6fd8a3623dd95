//! 关闭：应用关闭、逐子流 FIN、对端 FIN 和连接拆除
//! Shutdown: application close, per-subflow FIN, peer FIN and teardown

use super::{Connection, ConnectionEvent, ConnectionState, TimerEvent, path::distinct_gaps};
use crate::{
    core::subflow::{SubflowId, SubflowState},
    error::{Error, Result},
    packet::flags::Flags,
};
use tokio::time::Instant;
use tracing::{debug, info};

impl Connection {
    /// Starts a graceful close. Buffered data is sent first; subflows send their FINs
    /// once the send buffer is empty. Calling it again while closing does nothing.
    ///
    /// 开始优雅关闭。先发送缓冲数据，发送缓冲区清空后各子流再发送 FIN。
    pub fn close(&mut self, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if self.close_requested {
            return Ok(());
        }
        self.close_requested = true;
        self.state = ConnectionState::Closing;
        info!(
            connection = %self.handle,
            pending = self.send_buffer.pending_bytes(),
            "Closing connection"
        );
        if self.send_buffer.is_empty() {
            self.close_all_subflows(now);
        } else {
            self.close_on_empty = true;
        }
        Ok(())
    }

    /// Closes every subflow. The first synchronized subflow sends its FIN at once; the
    /// others are staggered by distinct random delays.
    ///
    /// 关闭所有子流。第一个同步子流立即发送 FIN，其余子流按互不相同的随机延迟错开。
    pub(super) fn close_all_subflows(&mut self, now: Instant) {
        let mut deferred = Vec::new();
        let mut first = true;
        for index in 0..self.subflows.len() {
            let id = SubflowId(index as u8);
            match self.subflows[index].state {
                SubflowState::SynSent => {
                    self.send_reset(id);
                    self.set_closed(id);
                }
                SubflowState::Listen => self.set_closed(id),
                SubflowState::Established | SubflowState::CloseWait | SubflowState::SynRcvd => {
                    if first {
                        first = false;
                        self.do_close(id, now);
                    } else {
                        deferred.push(id);
                    }
                }
                _ => {}
            }
        }
        if deferred.is_empty() {
            return;
        }
        let max = self.config.connection.fin_stagger_max;
        let gaps = distinct_gaps(&mut self.rng, deferred.len(), max);
        for (id, gap) in deferred.into_iter().zip(gaps) {
            debug!(connection = %self.handle, subflow = %id, delay = ?gap, "Deferring FIN");
            self.timers.schedule(now + gap, TimerEvent::DeferredFin(id));
        }
    }

    /// Sends this subflow's FIN (or FIN+ACK) and moves it along the close sequence.
    /// 发送该子流的 FIN（或 FIN+ACK）并推进其关闭流程。
    pub(super) fn do_close(&mut self, id: SubflowId, now: Instant) {
        let state = self.subflows[id.index()].state;
        match state {
            SubflowState::Established | SubflowState::SynRcvd => {
                self.send_fin(id, Flags::FIN);
                let subflow = self.subflow_mut(id);
                subflow.state = SubflowState::FinWait1;
                subflow.control_retries = 0;
                let rto = subflow.rtt.rto();
                self.arm_control(id, rto, now);
                debug!(connection = %self.handle, subflow = %id, "Sent FIN, FIN_WAIT_1");
            }
            SubflowState::CloseWait => {
                self.send_fin(id, Flags::FIN | Flags::ACK);
                let subflow = self.subflow_mut(id);
                subflow.state = SubflowState::LastAck;
                subflow.control_retries = 0;
                self.arm_last_ack(id, now);
                debug!(connection = %self.handle, subflow = %id, "Sent FIN+ACK, LAST_ACK");
            }
            SubflowState::SynSent | SubflowState::Closing => {
                self.send_reset(id);
                self.set_closed(id);
            }
            SubflowState::Listen | SubflowState::LastAck => self.set_closed(id),
            _ => {}
        }
    }

    /// Passive close: a subflow in CLOSE_WAIT sends its FIN once nothing is left to
    /// send or acknowledge on it.
    ///
    /// 被动关闭：CLOSE_WAIT 中的子流在没有待发送或待确认的数据后发送 FIN。
    pub(super) fn close_drained_subflows(&mut self, now: Instant) {
        if !self.send_buffer.is_empty() {
            return;
        }
        let drained: Vec<SubflowId> = self
            .subflows
            .iter()
            .filter(|subflow| subflow.state == SubflowState::CloseWait && subflow.unacked.is_empty())
            .map(|subflow| subflow.id)
            .collect();
        for id in drained {
            self.do_close(id, now);
        }
    }

    /// Records the peer's FIN at `fin_seq` on subflow `id`.
    /// 记录子流 `id` 上位于 `fin_seq` 的对端 FIN。
    pub(super) fn on_peer_fin(&mut self, id: SubflowId, fin_seq: u32, now: Instant) {
        let subflow = self.subflow_mut(id);
        if subflow.peer_fin.is_none() {
            subflow.peer_fin = Some(fin_seq);
            subflow.consume_peer_fin();
        }
        if subflow.peer_finished() {
            self.check_peer_fins(now);
        } else {
            debug!(connection = %self.handle, subflow = %id, fin_seq, "Peer FIN ahead of data");
            self.send_ack(id);
        }
    }

    /// Moves every subflow whose peer FIN is now in sequence along the close sequence.
    /// Emits `PeerClosed` once the peer has finished on every subflow.
    ///
    /// 推进所有对端 FIN 已按序到达的子流的关闭流程。
    pub(super) fn check_peer_fins(&mut self, now: Instant) {
        for index in 0..self.subflows.len() {
            let id = SubflowId(index as u8);
            let subflow = &self.subflows[index];
            if !subflow.peer_finished() {
                continue;
            }
            match subflow.state {
                SubflowState::Established => {
                    self.subflow_mut(id).state = SubflowState::CloseWait;
                    debug!(connection = %self.handle, subflow = %id, "Peer finished, CLOSE_WAIT");
                    self.send_ack(id);
                }
                SubflowState::FinWait1 => {
                    if subflow.local_fin_acked() {
                        self.enter_time_wait(id, now);
                    } else {
                        self.cancel_control(id);
                        self.subflow_mut(id).state = SubflowState::Closing;
                        let rto = self.subflows[index].rtt.rto();
                        self.arm_control(id, rto, now);
                    }
                    self.send_ack(id);
                }
                SubflowState::FinWait2 => {
                    self.enter_time_wait(id, now);
                    self.send_ack(id);
                }
                _ => {}
            }
        }

        let all_finished = self.subflows.iter().all(|subflow| {
            subflow.state == SubflowState::Closed
                || subflow.state == SubflowState::Listen
                || subflow.peer_finished()
        });
        if all_finished && !self.peer_closed && self.subflows.iter().any(|s| s.peer_finished()) {
            self.peer_closed = true;
            info!(connection = %self.handle, "Peer finished sending");
            self.events.push_back(ConnectionEvent::PeerClosed);
        }
        self.close_drained_subflows(now);
    }

    /// Marks a subflow closed, cancels its timers and forgets its unacked data. Data it
    /// already received stays in the out-of-order store.
    ///
    /// 将子流标记为关闭，取消其定时器并丢弃其未确认数据。
    pub(super) fn mark_closed(&mut self, id: SubflowId) {
        if self.subflows[id.index()].state == SubflowState::Closed {
            return;
        }
        self.cancel_subflow_timers(id);
        let subflow = self.subflow_mut(id);
        subflow.state = SubflowState::Closed;
        subflow.clear_transmit_state();
        debug!(connection = %self.handle, subflow = %id, "Subflow closed");
        self.events.push_back(ConnectionEvent::SubflowClosed(id));
    }

    /// Closes a subflow and tears the connection down once no subflow is left.
    /// 关闭子流，所有子流都关闭后拆除连接。
    pub(super) fn set_closed(&mut self, id: SubflowId) {
        self.mark_closed(id);
        self.refresh_coupling();
        if self
            .subflows
            .iter()
            .all(|subflow| subflow.state == SubflowState::Closed)
        {
            self.teardown();
        }
    }
}
