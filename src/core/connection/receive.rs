//! 接收路径：按子流顺序和连接顺序交付数据
//! Receive path: delivers data in subflow order and connection order

use super::Connection;
use crate::{
    core::{reliability::mapping::DsnMapping, subflow::SubflowId},
    packet::segment::Segment,
};
use std::cmp::Ordering;
use tokio::time::Instant;
use tracing::{trace, warn};

impl Connection {
    /// Handles the payload of a data segment on subflow `id`.
    ///
    /// A segment in subflow order moves the subflow cursor. It is delivered if it is
    /// also in connection order and stored otherwise. A segment ahead of the subflow
    /// cursor is stored until the gap fills. One behind it is a duplicate. Every case
    /// is answered with an ACK.
    ///
    /// 处理子流 `id` 上数据报文段的负载。
    pub(super) fn on_data(&mut self, id: SubflowId, segment: Segment, congestion_experienced: bool, now: Instant) {
        let Some((data_seq, subflow_seq, length)) = segment.dsn_mapping() else {
            return;
        };
        if segment.payload.len() != usize::from(length) {
            warn!(
                connection = %self.handle,
                subflow = %id,
                mapped = length,
                actual = segment.payload.len(),
                "Mapping length does not match payload, ignoring"
            );
            return;
        }
        if length == 0 {
            return;
        }
        if congestion_experienced && self.config.congestion_control.ecn.enabled {
            self.subflow_mut(id).echo_congestion = true;
        }

        let rx_seq = self.subflows[id.index()].rx_seq;
        let mut delivered = 0;
        match subflow_seq.cmp(&rx_seq) {
            Ordering::Equal => {
                let payload = segment.payload;
                match data_seq.cmp(&self.rx_next) {
                    Ordering::Equal => {
                        delivered += payload.len();
                        self.rx_next += u32::from(length);
                        self.recv_buffer.append(payload);
                    }
                    Ordering::Greater => {
                        let mapping = DsnMapping::new(data_seq, subflow_seq, segment.header.ack, payload);
                        if !self.out_of_order.insert(id, mapping) {
                            trace!(connection = %self.handle, subflow = %id, data_seq, "Data sequence already stored");
                        }
                    }
                    Ordering::Less => {
                        let end = data_seq + u32::from(length);
                        if end > self.rx_next {
                            let tail = payload.slice((self.rx_next - data_seq) as usize..);
                            delivered += tail.len();
                            self.rx_next = end;
                            self.recv_buffer.append(tail);
                        } else {
                            trace!(connection = %self.handle, subflow = %id, data_seq, "Data already delivered via another subflow");
                        }
                    }
                }
                self.subflow_mut(id).advance_rx(u32::from(length));
                delivered += self.out_of_order.drain(
                    &mut self.rx_next,
                    self.subflows.as_mut_slice(),
                    &mut self.recv_buffer,
                );
            }
            Ordering::Greater => {
                trace!(
                    connection = %self.handle,
                    subflow = %id,
                    subflow_seq,
                    expected = rx_seq,
                    "Segment ahead of subflow order"
                );
                // Kept even if already delivered: the subflow cursor has to pass it.
                let mapping = DsnMapping::new(data_seq, subflow_seq, segment.header.ack, segment.payload);
                self.out_of_order.insert(id, mapping);
            }
            Ordering::Less => {
                trace!(connection = %self.handle, subflow = %id, subflow_seq, "Duplicate segment");
            }
        }

        self.send_ack(id);
        if delivered > 0 {
            trace!(connection = %self.handle, delivered, rx_next = self.rx_next, "Delivered in-order data");
            self.events.push_back(super::ConnectionEvent::DataReadable);
        }
        self.check_peer_fins(now);
    }
}
