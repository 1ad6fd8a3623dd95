//! ACK 处理：重复 ACK、快速恢复、部分/完整确认和 ECN 削减
//! ACK processing: duplicate ACKs, fast recovery, partial and full ACKs, ECN reduction

use super::Connection;
use crate::{
    core::subflow::{SubflowId, SubflowState},
    error::{Error, Result},
    packet::{flags::Flags, segment::Segment},
};
use tokio::time::Instant;
use tracing::{debug, trace};

impl Connection {
    /// Processes the acknowledgment field of `segment` on subflow `id`.
    ///
    /// Acknowledgments below the cumulative ACK are stale and ignored. One that repeats
    /// it while data is outstanding counts as a duplicate. One beyond anything sent is
    /// an invariant violation.
    ///
    /// 处理子流 `id` 上 `segment` 的确认字段。
    pub(super) fn on_ack(&mut self, id: SubflowId, segment: &Segment, now: Instant) -> Result<()> {
        let ack = segment.header.ack;
        let addresses: Vec<_> = segment.added_addresses().collect();
        if !addresses.is_empty() {
            self.on_add_addr(id, &addresses, now);
        }

        let ecn = self.config.congestion_control.ecn.clone();
        let subflow = self.subflow_mut(id);
        if ecn.enabled && subflow.state == SubflowState::Established {
            let ece = segment.flags().contains(Flags::ECE);
            let tx_seq = subflow.tx_seq;
            let round = subflow.dctcp.on_ack(ack, ece, tx_seq, ecn.weight);
            if round && id.index() == 0 {
                self.on_incast_round();
            }
        }
        let subflow = &self.subflows[id.index()];

        let max_valid = subflow.max_valid_ack();
        if ack > max_valid {
            return Err(Error::InvariantViolation(format!(
                "ack {ack} beyond highest sent {max_valid} on subflow {id}"
            )));
        }
        let expected = subflow.highest_ack + 1;
        if ack < expected {
            debug!(connection = %self.handle, subflow = %id, ack, expected, "Ignoring stale ACK");
            return Ok(());
        }
        if ack == expected {
            let is_duplicate = addresses.is_empty()
                && ack < subflow.tx_seq
                && subflow.unacked.find(ack).is_some();
            if is_duplicate {
                self.on_dup_ack(id, ack, now);
            }
            return Ok(());
        }
        self.on_new_data_ack(id, ack, now);
        Ok(())
    }

    fn on_dup_ack(&mut self, id: SubflowId, ack: u32, now: Instant) {
        let threshold = self.config.reliability.dup_ack_threshold;
        let subflow = self.subflow_mut(id);
        subflow.dup_acks += 1;
        if let Some(mapping) = subflow.unacked.find_mut(ack) {
            mapping.dup_acks += 1;
        }
        let dup_acks = subflow.dup_acks;
        trace!(connection = %self.handle, subflow = %id, ack, dup_acks, "Duplicate ACK");

        let subflow = self.subflow_mut(id);
        if subflow.in_fast_recovery {
            let mss = subflow.mss;
            subflow.cwnd = subflow.cwnd.saturating_add(mss);
            subflow.inflation += mss;
            self.send_pending(now);
            return;
        }
        if dup_acks != threshold {
            return;
        }

        let bytes_in_flight = subflow.bytes_in_flight();
        let ecn = &self.config.congestion_control.ecn;
        let (ssthresh, cwnd) = if ecn.enabled && ecn.fast_retransmit_by_alpha {
            let (views, _) = self.coupled_views(id);
            self.congestion.on_congestion_event(&views);
            let subflow = &self.subflows[id.index()];
            subflow.dctcp.fast_retransmit_window(subflow.cwnd, subflow.mss)
        } else {
            let (views, index) = self.coupled_views(id);
            self.congestion
                .enter_fast_recovery(index, &views, bytes_in_flight)
        };
        let subflow = self.subflow_mut(id);
        subflow.ssthresh = ssthresh;
        subflow.set_cwnd(cwnd);
        subflow.recover = subflow.high_tx_mark + 1;
        subflow.in_fast_recovery = true;
        subflow.inflation = 3 * subflow.mss;
        debug!(
            connection = %self.handle,
            subflow = %id,
            ssthresh,
            cwnd,
            recover = self.subflows[id.index()].recover,
            "Entering fast recovery"
        );
        self.retransmit_mapping(id, ack, now);
    }

    fn on_new_data_ack(&mut self, id: SubflowId, ack: u32, now: Instant) {
        let subflow = &self.subflows[id.index()];
        let acked = ack - (subflow.highest_ack + 1);
        let keeps_window = subflow.state == SubflowState::FinWait1
            && self.send_buffer.is_empty()
            && subflow.unacked.is_empty();

        if subflow.in_fast_recovery {
            if ack < subflow.recover {
                let subflow = self.subflow_mut(id);
                let deflate = acked.min(subflow.inflation);
                subflow.inflation -= deflate;
                let mss = subflow.mss;
                subflow.set_cwnd(subflow.cwnd.saturating_sub(deflate) + mss);
                subflow.inflation += mss;
                subflow.unacked.discard_up_to(ack);
                debug!(connection = %self.handle, subflow = %id, ack, "Partial ACK, retransmitting next hole");
                self.retransmit_mapping(id, ack, now);
            } else {
                let subflow = self.subflow_mut(id);
                let flight = subflow.high_tx_mark - subflow.highest_ack;
                let cwnd = subflow.ssthresh.min(flight + subflow.mss);
                subflow.set_cwnd(cwnd);
                subflow.inflation = 0;
                subflow.in_fast_recovery = false;
                debug!(connection = %self.handle, subflow = %id, ack, cwnd, "Full ACK, leaving fast recovery");
                if !keeps_window {
                    self.grow_window(id, acked);
                }
            }
        } else if !keeps_window {
            self.grow_window(id, acked);
        }
        self.new_ack(id, ack, now);
    }

    fn grow_window(&mut self, id: SubflowId, acked: u32) {
        let (views, index) = self.coupled_views(id);
        let cwnd = self.congestion.open_window(index, &views, acked);
        self.subflow_mut(id).set_cwnd(cwnd);
    }

    /// Advances the cumulative ACK to `ack` and lets the scheduler use the freed window.
    /// 将累积确认推进到 `ack`，并让调度器使用释放的窗口。
    fn new_ack(&mut self, id: SubflowId, ack: u32, now: Instant) {
        let subflow = self.subflow_mut(id);
        if let Some(sample) = subflow.rtt.on_acked(ack, now) {
            trace!(subflow = %id, rtt = ?sample, rto = ?subflow.rtt.rto(), "RTT sample");
        }
        subflow.unacked.discard_up_to(ack);
        if ack > subflow.tx_seq {
            subflow.tx_seq = ack;
            subflow.max_seq_sent = subflow.max_seq_sent.max(ack - 1);
            subflow.high_tx_mark = subflow.high_tx_mark.max(ack - 1);
        }
        subflow.highest_ack = subflow.highest_ack.max(ack - 1);
        subflow.dup_acks = 0;

        let idle = subflow.unacked.is_empty()
            && !matches!(subflow.state, SubflowState::FinWait1 | SubflowState::Closing);
        if idle {
            self.cancel_retransmit(id);
        } else {
            self.arm_retransmit(id, now);
        }

        let ecn = &self.config.congestion_control.ecn;
        let min_cwnd_packets = self.config.congestion_control.min_cwnd_packets;
        let subflow = &mut self.subflows[id.index()];
        if subflow.state == SubflowState::Established
            && subflow.dctcp.should_reduce(ecn, subflow.highest_ack)
        {
            let (cwnd, ssthresh) = subflow.dctcp.reduce(
                ecn.response,
                subflow.cwnd,
                subflow.mss,
                min_cwnd_packets,
                subflow.tx_seq,
            );
            subflow.cwnd = cwnd;
            subflow.ssthresh = ssthresh;
            debug!(
                connection = %self.handle,
                subflow = %id,
                cwnd,
                alpha = subflow.dctcp.alpha(),
                "ECN window reduction"
            );
        }
        self.send_pending(now);
    }

    /// Feeds one completed alpha window of the initial subflow to the incast detector.
    fn on_incast_round(&mut self) {
        let Some(adaptive) = self.config.congestion_control.ecn.adaptive_subflows else {
            return;
        };
        if self.config.connection.max_subflows < 2 {
            return;
        }
        let min_cwnd_packets = self.config.congestion_control.min_cwnd_packets.max(1);
        let samples: Vec<_> = self.subflows.iter().map(|subflow| subflow.incast_sample()).collect();
        let was = self.incast_suppressed();
        self.incast.on_round(&adaptive, min_cwnd_packets, &samples);
        let now = self.incast_suppressed();
        if was != now {
            debug!(connection = %self.handle, suppressed = now, "Adaptive subflow suppression changed");
        }
    }
}
