//! 子流状态机：按状态分发收到的报文段
//! Subflow state machine: dispatches received segments by state
//!
//! Flags are masked to SYN|FIN|RST|ACK before dispatch. A segment that carries ACK is
//! acknowledged first; any payload is handed to the mapping engine afterwards.

use super::{Connection, ConnectionEvent, ConnectionState, Role};
use crate::{
    core::subflow::{SubflowId, SubflowState},
    error::{Error, Result},
    packet::{flags::Flags, segment::Segment},
    transport::Datagram,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const SYN_ACK: Flags = Flags::from_bits(Flags::SYN.bits() | Flags::ACK.bits());
const FIN_ACK: Flags = Flags::from_bits(Flags::FIN.bits() | Flags::ACK.bits());

impl Connection {
    /// Entry point of the per-subflow state machine.
    /// 每个子流状态机的入口。
    pub(super) fn on_segment(&mut self, id: SubflowId, datagram: Datagram, now: Instant) -> Result<()> {
        let Datagram {
            segment,
            congestion_experienced,
            ..
        } = datagram;
        let flags = segment.flags().significant();
        let state = self.subflows[id.index()].state;
        trace!(
            connection = %self.handle,
            subflow = %id,
            state = ?state,
            flags = %flags,
            seq = segment.header.seq,
            ack = segment.header.ack,
            len = segment.payload.len(),
            "Received segment"
        );

        if flags.contains(Flags::RST) {
            self.on_reset(id, state);
            return Ok(());
        }
        if state != SubflowState::Listen {
            self.subflow_mut(id).remote_window = u32::from(segment.header.window);
        }

        match state {
            SubflowState::Listen => {
                self.handle_in_listen(id, &segment, flags, now);
                Ok(())
            }
            SubflowState::SynSent => self.handle_in_syn_sent(id, &segment, flags, now),
            SubflowState::SynRcvd => {
                self.handle_in_syn_rcvd(id, segment, flags, congestion_experienced, now)
            }
            SubflowState::Established => {
                self.handle_in_established(id, segment, flags, congestion_experienced, now)
            }
            SubflowState::FinWait1
            | SubflowState::FinWait2
            | SubflowState::CloseWait
            | SubflowState::Closing => {
                self.handle_in_wait(id, segment, flags, congestion_experienced, now)
            }
            SubflowState::LastAck => self.handle_in_last_ack(id, &segment, flags, now),
            SubflowState::TimeWait => {
                if flags.contains(Flags::FIN) {
                    self.send_ack(id);
                }
                Ok(())
            }
            SubflowState::Closed => Ok(()),
        }
    }

    fn on_reset(&mut self, id: SubflowId, state: SubflowState) {
        match state {
            SubflowState::Closed | SubflowState::Listen => {}
            SubflowState::SynSent => {
                debug!(connection = %self.handle, subflow = %id, "Subflow refused");
                if id.index() == 0 {
                    self.abort(Error::ConnectionRefused, Some(id));
                } else {
                    self.set_closed(id);
                }
            }
            SubflowState::LastAck | SubflowState::TimeWait => self.set_closed(id),
            _ => {
                debug!(connection = %self.handle, subflow = %id, state = ?state, "Subflow reset by peer");
                let others_alive = self.subflows.iter().any(|subflow| {
                    subflow.id != id
                        && !matches!(subflow.state, SubflowState::Closed | SubflowState::Listen)
                });
                if id.index() == 0 || !others_alive {
                    self.abort(Error::ConnectionReset, Some(id));
                } else {
                    self.set_closed(id);
                }
            }
        }
    }

    fn handle_in_listen(&mut self, id: SubflowId, segment: &Segment, flags: Flags, now: Instant) {
        if flags != Flags::SYN {
            trace!(connection = %self.handle, subflow = %id, flags = %flags, "Listener ignores non-SYN segment");
            return;
        }
        let subflow = self.subflow_mut(id);
        subflow.rx_seq = segment.header.seq + 1;
        subflow.state = SubflowState::SynRcvd;
        self.send_syn_ack(id, now);
        self.arm_control(id, self.config.reliability.syn_timeout, now);
    }

    fn handle_in_syn_sent(&mut self, id: SubflowId, segment: &Segment, flags: Flags, now: Instant) -> Result<()> {
        match flags {
            SYN_ACK => {
                if id.index() == 0 {
                    let token = segment.mp_capable().ok_or(Error::MissingHandshakeOption)?;
                    self.remote_token = Some(token);
                }
                let subflow = self.subflow_mut(id);
                subflow.rx_seq = segment.header.seq + 1;
                self.complete_handshake(id, segment.header.ack, now)?;
                self.send_ack(id);
                self.on_subflow_established(id, now);
                Ok(())
            }
            Flags::SYN => {
                // Simultaneous open.
                let subflow = self.subflow_mut(id);
                subflow.rx_seq = segment.header.seq + 1;
                subflow.state = SubflowState::SynRcvd;
                self.send_syn_ack(id, now);
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {other} in SYN_SENT"
            ))),
        }
    }

    fn handle_in_syn_rcvd(
        &mut self,
        id: SubflowId,
        segment: Segment,
        flags: Flags,
        congestion_experienced: bool,
        now: Instant,
    ) -> Result<()> {
        match flags {
            Flags::ACK | Flags::NONE => {
                if flags == Flags::NONE && segment.dsn_mapping().is_none() {
                    return Ok(());
                }
                if flags == Flags::NONE {
                    warn!(connection = %self.handle, subflow = %id, "Handshake ACK lost, completing from data segment");
                }
                self.complete_handshake(id, segment.header.ack, now)?;
                self.on_subflow_established(id, now);
                let addresses: Vec<_> = segment.added_addresses().collect();
                if !addresses.is_empty() {
                    self.on_add_addr(id, &addresses, now);
                }
                if segment.dsn_mapping().is_some() {
                    self.on_data(id, segment, congestion_experienced, now);
                }
                Ok(())
            }
            Flags::SYN => {
                self.send_syn_ack(id, now);
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {other} in SYN_RCVD"
            ))),
        }
    }

    /// Moves the send-side baselines past the SYN once the peer acknowledged it.
    fn complete_handshake(&mut self, id: SubflowId, ack: u32, now: Instant) -> Result<()> {
        let syn_retries = self.config.reliability.syn_retries;
        let subflow = self.subflow_mut(id);
        if ack != subflow.isn + 1 {
            return Err(Error::ProtocolViolation(format!(
                "handshake acknowledges {ack}, expected {}",
                subflow.isn + 1
            )));
        }
        subflow.tx_seq = ack;
        subflow.highest_ack = subflow.isn;
        subflow.max_seq_sent = subflow.isn;
        subflow.high_tx_mark = subflow.isn;
        subflow.syn_retries_left = syn_retries;
        let sample = subflow.rtt.on_acked(ack, now);
        subflow.state = SubflowState::Established;
        debug!(connection = %self.handle, subflow = %id, rtt = ?sample, "Subflow established");
        self.cancel_control(id);
        Ok(())
    }

    fn on_subflow_established(&mut self, id: SubflowId, now: Instant) {
        if id.index() == 0 {
            if self.state == ConnectionState::Connecting {
                self.state = ConnectionState::Established;
                info!(
                    connection = %self.handle,
                    local_token = self.local_token,
                    remote_token = ?self.remote_token,
                    "Connection established"
                );
                self.events.push_back(ConnectionEvent::Connected);
                if self.role == Role::Client {
                    self.start_path_manager(now);
                }
            }
        } else {
            info!(connection = %self.handle, subflow = %id, "Additional subflow established");
            self.events.push_back(ConnectionEvent::SubflowEstablished(id));
        }
        self.refresh_coupling();
        self.send_pending(now);
    }

    fn handle_in_established(
        &mut self,
        id: SubflowId,
        segment: Segment,
        flags: Flags,
        congestion_experienced: bool,
        now: Instant,
    ) -> Result<()> {
        match flags {
            Flags::ACK | Flags::NONE | Flags::FIN | FIN_ACK => {
                if flags.contains(Flags::ACK) {
                    self.on_ack(id, &segment, now)?;
                }
                let fin = flags.contains(Flags::FIN).then_some(segment.header.seq);
                if segment.dsn_mapping().is_some() {
                    self.on_data(id, segment, congestion_experienced, now);
                }
                if let Some(fin_seq) = fin {
                    self.on_peer_fin(id, fin_seq, now);
                }
                Ok(())
            }
            // The peer lost our handshake ACK.
            SYN_ACK | Flags::SYN => {
                self.send_ack(id);
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {other} in ESTABLISHED"
            ))),
        }
    }

    fn handle_in_wait(
        &mut self,
        id: SubflowId,
        segment: Segment,
        flags: Flags,
        congestion_experienced: bool,
        now: Instant,
    ) -> Result<()> {
        match flags {
            Flags::ACK | Flags::NONE | Flags::FIN | FIN_ACK => {
                if flags.contains(Flags::ACK) {
                    self.on_ack(id, &segment, now)?;
                    self.after_fin_acked(id, now);
                }
                let fin = flags.contains(Flags::FIN).then_some(segment.header.seq);
                if segment.dsn_mapping().is_some() {
                    self.on_data(id, segment, congestion_experienced, now);
                }
                if let Some(fin_seq) = fin {
                    self.on_peer_fin(id, fin_seq, now);
                }
                Ok(())
            }
            SYN_ACK => {
                self.send_ack(id);
                Ok(())
            }
            other => {
                let state = self.subflows[id.index()].state;
                Err(Error::ProtocolViolation(format!(
                    "unexpected {other} in {state:?}"
                )))
            }
        }
    }

    fn handle_in_last_ack(&mut self, id: SubflowId, segment: &Segment, flags: Flags, now: Instant) -> Result<()> {
        match flags {
            Flags::ACK => {
                self.on_ack(id, segment, now)?;
                self.after_fin_acked(id, now);
                Ok(())
            }
            Flags::FIN => {
                self.send_fin(id, FIN_ACK);
                Ok(())
            }
            FIN_ACK => {
                self.set_closed(id);
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {other} in LAST_ACK"
            ))),
        }
    }

    /// Applies the transitions triggered by an acknowledgment of the local FIN.
    /// 应用本端 FIN 被确认后触发的状态转换。
    fn after_fin_acked(&mut self, id: SubflowId, now: Instant) {
        let subflow = &self.subflows[id.index()];
        if !subflow.local_fin_acked() {
            return;
        }
        match subflow.state {
            SubflowState::FinWait1 => {
                self.cancel_control(id);
                self.subflow_mut(id).state = SubflowState::FinWait2;
                debug!(connection = %self.handle, subflow = %id, "FIN acknowledged, FIN_WAIT_2");
            }
            SubflowState::Closing => self.enter_time_wait(id, now),
            SubflowState::LastAck => self.set_closed(id),
            _ => {}
        }
    }
}
