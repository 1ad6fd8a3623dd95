//! 发送路径：控制报文段、数据报文段和轮询调度器
//! Send path: control segments, data segments and the round-robin scheduler

use super::Connection;
use crate::{
    core::{
        reliability::mapping::DsnMapping,
        subflow::{SubflowId, SubflowState},
    },
    packet::{flags::Flags, option::MptcpOption, segment::Segment},
    transport::Transmit,
};
use tokio::time::Instant;
use tracing::{debug, trace};

impl Connection {
    fn emit(&mut self, id: SubflowId, segment: Segment) {
        let subflow = &self.subflows[id.index()];
        trace!(
            connection = %self.handle,
            subflow = %id,
            flags = %segment.flags(),
            seq = segment.header.seq,
            ack = segment.header.ack,
            len = segment.payload.len(),
            "Queueing segment"
        );
        self.transmits.push_back(Transmit {
            src: subflow.local,
            dst: subflow.remote,
            segment,
        });
    }

    fn handshake_option(&self, id: SubflowId) -> MptcpOption {
        let subflow = &self.subflows[id.index()];
        if id.index() == 0 {
            MptcpOption::MpCapable {
                sender_token: self.local_token,
            }
        } else {
            MptcpOption::MpJoin {
                receiver_token: self.remote_token.unwrap_or_default(),
                address_id: subflow.address_id,
            }
        }
    }

    pub(super) fn send_syn(&mut self, id: SubflowId, now: Instant) {
        let option = self.handshake_option(id);
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        subflow.rtt.on_sent(subflow.isn, 1, now);
        let segment = Segment::control(subflow.ports(), subflow.isn, 0, Flags::SYN, window, vec![option]);
        self.emit(id, segment);
    }

    pub(super) fn send_syn_ack(&mut self, id: SubflowId, now: Instant) {
        let option = self.handshake_option(id);
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        subflow.rtt.on_sent(subflow.isn, 1, now);
        let segment = Segment::control(
            subflow.ports(),
            subflow.isn,
            subflow.rx_seq,
            Flags::SYN | Flags::ACK,
            window,
            vec![option],
        );
        self.emit(id, segment);
    }

    /// Sends a pure ACK for the subflow's receive cursor, echoing congestion if CE-marked
    /// data arrived since the last ACK.
    ///
    /// 发送纯 ACK，如果自上次 ACK 以来收到了 CE 标记的数据则回显拥塞。
    pub(super) fn send_ack(&mut self, id: SubflowId) {
        self.send_ack_with(id, Vec::new());
    }

    pub(super) fn send_ack_with(&mut self, id: SubflowId, options: Vec<MptcpOption>) {
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        let mut flags = Flags::ACK;
        if subflow.echo_congestion {
            flags = flags | Flags::ECE;
            subflow.echo_congestion = false;
        }
        let segment = Segment::control(
            subflow.ports(),
            subflow.tx_seq,
            subflow.rx_seq,
            flags,
            window,
            options,
        );
        self.emit(id, segment);
    }

    pub(super) fn send_reset(&mut self, id: SubflowId) {
        let subflow = &self.subflows[id.index()];
        let segment = Segment::control(
            subflow.ports(),
            subflow.tx_seq,
            subflow.rx_seq,
            Flags::RST,
            0,
            Vec::new(),
        );
        debug!(connection = %self.handle, subflow = %id, "Sending RST");
        self.emit(id, segment);
    }

    /// Sends (or re-sends) the local FIN. The first call assigns it the sequence number
    /// after everything sent so far.
    ///
    /// 发送（或重发）本端 FIN。第一次调用时为其分配已发送数据之后的序列号。
    pub(super) fn send_fin(&mut self, id: SubflowId, flags: Flags) {
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        let fin = match subflow.local_fin {
            Some(fin) => fin,
            None => {
                let fin = subflow.max_seq_sent + 1;
                subflow.local_fin = Some(fin);
                if !subflow.in_timeout_recovery() {
                    subflow.tx_seq = fin + 1;
                }
                subflow.max_seq_sent = fin;
                subflow.high_tx_mark = subflow.high_tx_mark.max(fin);
                fin
            }
        };
        let segment = Segment::control(subflow.ports(), fin, subflow.rx_seq, flags, window, Vec::new());
        self.emit(id, segment);
    }

    /// Takes up to `len` bytes from the send buffer, assigns them the next data sequence
    /// number and sends them on `id`.
    fn send_data_packet(&mut self, id: SubflowId, len: usize, now: Instant) {
        let Some(payload) = self.send_buffer.dequeue_up_to(len) else {
            return;
        };
        let data_seq = self.tx_next;
        let length = payload.len() as u32;
        self.tx_next += length;
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        let seq = subflow.tx_seq;
        subflow
            .unacked
            .push(DsnMapping::new(data_seq, seq, subflow.rx_seq, payload.clone()));
        subflow.rtt.on_sent(seq, length, now);
        subflow.tx_seq += length;
        subflow.max_seq_sent = subflow.max_seq_sent.max(subflow.tx_seq - 1);
        subflow.high_tx_mark = subflow.high_tx_mark.max(subflow.tx_seq - 1);
        let segment = Segment::data(subflow.ports(), seq, subflow.rx_seq, window, data_seq, payload);
        trace!(
            connection = %self.handle,
            subflow = %id,
            data_seq,
            subflow_seq = seq,
            len = length,
            "Sending data"
        );
        self.emit(id, segment);
        if self.subflows[id.index()].timers.retransmit.is_none() {
            self.arm_retransmit(id, now);
        }
    }

    /// Re-sends the unacked mapping that starts at `subflow_seq`. Returns `false` if
    /// there is none.
    ///
    /// 重发从 `subflow_seq` 开始的未确认映射。
    pub(super) fn retransmit_mapping(&mut self, id: SubflowId, subflow_seq: u32, now: Instant) -> bool {
        let window = self.config.connection.advertised_window;
        let subflow = self.subflow_mut(id);
        let Some(mapping) = subflow.unacked.find(subflow_seq).cloned() else {
            return false;
        };
        subflow.rtt.on_sent(mapping.subflow_seq, u32::from(mapping.length), now);
        let segment = Segment::data(
            subflow.ports(),
            mapping.subflow_seq,
            subflow.rx_seq,
            window,
            mapping.data_seq,
            mapping.payload,
        );
        debug!(
            connection = %self.handle,
            subflow = %id,
            data_seq = mapping.data_seq,
            subflow_seq = mapping.subflow_seq,
            "Retransmitting segment"
        );
        self.emit(id, segment);
        if self.subflows[id.index()].timers.retransmit.is_none() {
            self.arm_retransmit(id, now);
        }
        true
    }

    /// Re-sends the next backlog mapping of a subflow recovering from a timeout, if
    /// the window allows it.
    fn resend_backlog(&mut self, id: SubflowId, now: Instant) -> bool {
        let rwnd_scale = self.config.connection.rwnd_scale;
        let subflow = &self.subflows[id.index()];
        if !subflow.state.carries_data() || !subflow.in_timeout_recovery() {
            return false;
        }
        let Some(mapping) = subflow.unacked.find(subflow.tx_seq) else {
            return false;
        };
        let length = u32::from(mapping.length);
        let end = mapping.subflow_end();
        if subflow.available_window(rwnd_scale, 0) < length.min(subflow.mss) {
            return false;
        }
        let seq = subflow.tx_seq;
        self.retransmit_mapping(id, seq, now);
        let subflow = self.subflow_mut(id);
        subflow.tx_seq = end;
        subflow.high_tx_mark = subflow.high_tx_mark.max(end - 1);
        true
    }

    /// Runs the round-robin scheduler until the send buffer is empty or no subflow has
    /// room, then lets recovering subflows resend their backlog. During an incast only
    /// the initial subflow takes new data.
    ///
    /// 运行轮询调度器，直到发送缓冲区为空或没有子流有空间。
    pub(super) fn send_pending(&mut self, now: Instant) {
        if self.state == super::ConnectionState::Closed || self.subflows.is_empty() {
            return;
        }
        let count = self.subflows.len();
        let rwnd_scale = self.config.connection.rwnd_scale;
        let suppressed = self.incast_suppressed();
        let mut idle = 0;
        while !self.send_buffer.is_empty() && idle < count {
            let index = self.next_subflow % count;
            self.next_subflow = (index + 1) % count;
            let id = SubflowId(index as u8);
            let subflow = &self.subflows[index];
            if subflow.state != SubflowState::Established {
                idle += 1;
                continue;
            }
            if suppressed && index != 0 && !subflow.in_timeout_recovery() {
                idle += 1;
                continue;
            }
            if subflow.in_timeout_recovery() {
                if self.resend_backlog(id, now) {
                    idle = 0;
                } else {
                    idle += 1;
                }
                continue;
            }
            let pending = self.send_buffer.pending_bytes();
            let window = subflow.available_window(rwnd_scale, pending);
            if window == 0 {
                idle += 1;
                continue;
            }
            let len = (window.min(subflow.mss) as usize).min(pending);
            self.send_data_packet(id, len, now);
            idle = 0;
        }

        for index in 0..count {
            while self.resend_backlog(SubflowId(index as u8), now) {}
        }

        if self.send_buffer.is_empty() {
            if self.close_on_empty {
                self.close_on_empty = false;
                debug!(connection = %self.handle, "Send buffer drained, closing subflows");
                self.close_all_subflows(now);
            }
            self.close_drained_subflows(now);
        }
    }
}
