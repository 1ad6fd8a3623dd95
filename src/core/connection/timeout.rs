//! 定时器的设置与超时处理
//! Timer arming and timeout handlers
//!
//! Every subflow keeps at most one handle per timer kind. Arming always cancels the
//! previous handle first, and a handler clears its slot before doing anything else.

use super::{Connection, TimerEvent};
use crate::{
    core::subflow::{SubflowId, SubflowState},
    error::Error,
    packet::flags::Flags,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Connection {
    pub(super) fn arm_retransmit(&mut self, id: SubflowId, now: Instant) {
        self.cancel_retransmit(id);
        let deadline = now + self.subflows[id.index()].rtt.rto();
        let handle = self.timers.schedule(deadline, TimerEvent::Retransmit(id));
        self.subflow_mut(id).timers.retransmit = Some(handle);
    }

    pub(super) fn cancel_retransmit(&mut self, id: SubflowId) {
        if let Some(handle) = self.subflow_mut(id).timers.retransmit.take() {
            self.timers.cancel(handle);
        }
    }

    pub(super) fn arm_control(&mut self, id: SubflowId, delay: Duration, now: Instant) {
        self.cancel_control(id);
        let handle = self
            .timers
            .schedule(now + delay, TimerEvent::ControlRetransmit(id));
        self.subflow_mut(id).timers.control = Some(handle);
    }

    pub(super) fn cancel_control(&mut self, id: SubflowId) {
        if let Some(handle) = self.subflow_mut(id).timers.control.take() {
            self.timers.cancel(handle);
        }
    }

    pub(super) fn arm_last_ack(&mut self, id: SubflowId, now: Instant) {
        if let Some(handle) = self.subflow_mut(id).timers.last_ack.take() {
            self.timers.cancel(handle);
        }
        let deadline = now + self.subflows[id.index()].rtt.rto();
        let handle = self.timers.schedule(deadline, TimerEvent::LastAck(id));
        self.subflow_mut(id).timers.last_ack = Some(handle);
    }

    /// Moves the subflow to TIME_WAIT and arms the timer that finally closes it.
    /// 将子流转入 TIME_WAIT，并设置最终关闭它的定时器。
    pub(super) fn enter_time_wait(&mut self, id: SubflowId, now: Instant) {
        self.cancel_control(id);
        self.cancel_retransmit(id);
        if let Some(handle) = self.subflow_mut(id).timers.time_wait.take() {
            self.timers.cancel(handle);
        }
        self.subflow_mut(id).state = SubflowState::TimeWait;
        let handle = self.timers.schedule(
            now + self.config.reliability.time_wait,
            TimerEvent::TimeWait(id),
        );
        self.subflow_mut(id).timers.time_wait = Some(handle);
        debug!(connection = %self.handle, subflow = %id, "Entered TIME_WAIT");
    }

    /// Cancels every timer the subflow holds.
    pub(super) fn cancel_subflow_timers(&mut self, id: SubflowId) {
        let timers = std::mem::take(&mut self.subflow_mut(id).timers);
        for handle in [timers.retransmit, timers.control, timers.last_ack, timers.time_wait]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(handle);
        }
    }

    /// Rewinds the subflow to its cumulative ACK, collapses the window to one MSS and
    /// resends the oldest unacked mapping.
    ///
    /// 将子流回退到累积确认点，窗口收缩为一个 MSS，并重发最早的未确认映射。
    pub(super) fn on_retransmit_timeout(&mut self, id: SubflowId, now: Instant) {
        let subflow = self.subflow_mut(id);
        subflow.timers.retransmit = None;
        if matches!(subflow.state, SubflowState::Closed | SubflowState::TimeWait)
            || subflow.unacked.is_empty()
        {
            return;
        }

        let mss = subflow.mss;
        subflow.ssthresh = if subflow.in_fast_recovery {
            (subflow.ssthresh / 2).max(2 * mss)
        } else {
            (subflow.bytes_in_flight() / 2).max(2 * mss)
        };
        subflow.inflation = 0;
        subflow.in_fast_recovery = false;
        subflow.dup_acks = 0;
        subflow.cwnd = mss;
        subflow.tx_seq = subflow.highest_ack + 1;
        subflow.high_tx_mark = subflow.tx_seq - 1;
        let tx_seq = subflow.tx_seq;
        subflow.dctcp.on_timeout(tx_seq);
        subflow.rtt.double_backoff();
        let (ssthresh, rto) = (subflow.ssthresh, subflow.rtt.rto());
        warn!(
            connection = %self.handle,
            subflow = %id,
            seq = tx_seq,
            ssthresh,
            rto = ?rto,
            "Retransmission timeout"
        );
        self.refresh_coupling();

        let end = self.subflows[id.index()]
            .unacked
            .oldest()
            .map(|mapping| (mapping.subflow_seq, mapping.subflow_end()));
        if let Some((start, end)) = end {
            self.retransmit_mapping(id, start, now);
            let subflow = self.subflow_mut(id);
            subflow.tx_seq = end;
            subflow.high_tx_mark = subflow.high_tx_mark.max(end - 1);
        }
        self.arm_retransmit(id, now);
    }

    /// Retransmits SYN, SYN+ACK or FIN, closing the subflow once retries run out.
    /// 重传 SYN、SYN+ACK 或 FIN，重试耗尽后关闭子流。
    pub(super) fn on_control_timeout(&mut self, id: SubflowId, now: Instant) {
        let syn_timeout = self.config.reliability.syn_timeout;
        let syn_retries = self.config.reliability.syn_retries;
        let max_retries = self.config.reliability.control_frame_max_retries;
        let subflow = self.subflow_mut(id);
        subflow.timers.control = None;
        match subflow.state {
            SubflowState::SynSent | SubflowState::SynRcvd => {
                if subflow.syn_retries_left == 0 {
                    warn!(connection = %self.handle, subflow = %id, "Handshake retries exhausted");
                    let only = self.live_subflows() <= 1;
                    if id.index() == 0 || only {
                        self.abort(Error::ConnectionTimeout, None);
                    } else {
                        self.set_closed(id);
                    }
                    return;
                }
                subflow.syn_retries_left -= 1;
                let attempt = u32::from(syn_retries - subflow.syn_retries_left);
                let state = subflow.state;
                debug!(connection = %self.handle, subflow = %id, attempt, "Retransmitting handshake");
                if state == SubflowState::SynSent {
                    self.send_syn(id, now);
                } else {
                    self.send_syn_ack(id, now);
                }
                let delay = syn_timeout.saturating_mul(1 << attempt.min(16));
                self.arm_control(id, delay, now);
            }
            SubflowState::FinWait1 | SubflowState::Closing => {
                let rto = subflow.rtt.rto();
                if !subflow.unacked.is_empty() {
                    // Data recovery runs on the retransmit timer; the FIN budget waits.
                    self.arm_control(id, rto, now);
                    return;
                }
                if subflow.control_retries >= max_retries {
                    warn!(connection = %self.handle, subflow = %id, "FIN retries exhausted");
                    self.close_after_retries(id);
                    return;
                }
                subflow.control_retries += 1;
                debug!(connection = %self.handle, subflow = %id, "Retransmitting FIN");
                self.send_fin(id, Flags::FIN);
                self.arm_control(id, rto, now);
            }
            _ => {}
        }
    }

    pub(super) fn on_last_ack_timeout(&mut self, id: SubflowId, now: Instant) {
        let max_retries = self.config.reliability.control_frame_max_retries;
        let subflow = self.subflow_mut(id);
        subflow.timers.last_ack = None;
        if subflow.state != SubflowState::LastAck {
            return;
        }
        if !subflow.unacked.is_empty() {
            self.arm_last_ack(id, now);
            return;
        }
        if subflow.control_retries >= max_retries {
            warn!(connection = %self.handle, subflow = %id, "FIN+ACK retries exhausted");
            self.close_after_retries(id);
            return;
        }
        subflow.control_retries += 1;
        debug!(connection = %self.handle, subflow = %id, "Retransmitting FIN+ACK");
        self.send_fin(id, Flags::FIN | Flags::ACK);
        self.arm_last_ack(id, now);
    }

    /// Gives up on a FIN that was never acknowledged. Losing unacknowledged data is a
    /// timeout of the whole connection, not a graceful close.
    ///
    /// 放弃一个始终未被确认的 FIN。若仍有未确认数据，则整个连接以超时失败。
    fn close_after_retries(&mut self, id: SubflowId) {
        if self.subflows[id.index()].unacked.is_empty() {
            self.set_closed(id);
        } else {
            self.abort(Error::ConnectionTimeout, None);
        }
    }

    pub(super) fn on_time_wait_timeout(&mut self, id: SubflowId) {
        self.subflow_mut(id).timers.time_wait = None;
        if self.subflows[id.index()].state == SubflowState::TimeWait {
            self.set_closed(id);
        }
    }

    pub(super) fn on_open_subflow_timeout(&mut self, ordinal: u8, now: Instant) {
        if self.close_requested {
            return;
        }
        match self.open_ndiff_subflow(now) {
            Ok(id) => info!(connection = %self.handle, subflow = %id, ordinal, "Opened extra subflow"),
            Err(err) => debug!(connection = %self.handle, ordinal, error = %err, "Extra subflow not opened"),
        }
    }

    pub(super) fn on_deferred_fin(&mut self, id: SubflowId, now: Instant) {
        let state = self.subflows[id.index()].state;
        if matches!(
            state,
            SubflowState::Established | SubflowState::SynRcvd | SubflowState::CloseWait
        ) {
            self.do_close(id, now);
        }
    }
}
