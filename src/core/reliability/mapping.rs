//! 数据序列映射引擎。
//! The data-sequence mapping engine.
//!
//! Every byte has two sequence numbers: its position in the connection-wide stream
//! (the DSN) and its position in the subflow that carried it. A [`DsnMapping`] ties the
//! two together for one segment. Senders keep their mappings in an [`UnackedList`] per
//! subflow until the subflow ACK covers them; receivers park segments that cannot be
//! delivered yet in the connection's [`OutOfOrderStore`].

use super::recv_buffer::ReceiveBuffer;
use crate::core::subflow::SubflowId;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

/// One segment's position in both sequence spaces.
/// 一个报文段在两个序列空间中的位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsnMapping {
    pub data_seq: u32,
    pub subflow_seq: u32,
    pub length: u16,
    /// The subflow ACK number carried when the segment was sent.
    /// 发送该报文段时携带的子流 ACK 号。
    pub ack_seq: u32,
    /// Duplicate ACKs observed for this segment.
    /// 该报文段观察到的重复 ACK 数。
    pub dup_acks: u32,
    pub payload: Bytes,
}

impl DsnMapping {
    pub fn new(data_seq: u32, subflow_seq: u32, ack_seq: u32, payload: Bytes) -> Self {
        Self {
            data_seq,
            subflow_seq,
            length: payload.len() as u16,
            ack_seq,
            dup_acks: 0,
            payload,
        }
    }

    pub fn subflow_end(&self) -> u32 {
        self.subflow_seq + u32::from(self.length)
    }

    pub fn data_end(&self) -> u32 {
        self.data_seq + u32::from(self.length)
    }
}

/// Sent but unacknowledged mappings of one subflow, ordered by subflow sequence.
/// 一个子流已发送但未确认的映射，按子流序列号排序。
#[derive(Debug, Default)]
pub struct UnackedList {
    entries: VecDeque<DsnMapping>,
}

impl UnackedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mapping: DsnMapping) {
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|last| last.subflow_end() <= mapping.subflow_seq),
            "mappings must be appended in subflow order"
        );
        self.entries.push_back(mapping);
    }

    /// Drops every mapping whose end is covered by the cumulative `ack`. Returns the
    /// number of mappings dropped.
    ///
    /// 丢弃所有结尾被累积 `ack` 覆盖的映射，返回丢弃的数量。
    pub fn discard_up_to(&mut self, ack: u32) -> usize {
        let mut dropped = 0;
        while self
            .entries
            .front()
            .is_some_and(|mapping| mapping.subflow_end() <= ack)
        {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// The mapping that starts at `subflow_seq`.
    /// 从 `subflow_seq` 开始的映射。
    pub fn find(&self, subflow_seq: u32) -> Option<&DsnMapping> {
        self.entries
            .iter()
            .find(|mapping| mapping.subflow_seq == subflow_seq)
    }

    pub fn find_mut(&mut self, subflow_seq: u32) -> Option<&mut DsnMapping> {
        self.entries
            .iter_mut()
            .find(|mapping| mapping.subflow_seq == subflow_seq)
    }

    pub fn oldest(&self) -> Option<&DsnMapping> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DsnMapping> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Access to the receive cursors of a connection's subflows.
/// 访问连接各子流的接收游标。
pub trait SubflowCursors {
    /// The next expected subflow sequence number, `None` if the subflow is gone.
    fn rx_seq(&self, id: SubflowId) -> Option<u32>;
    /// Moves the subflow's receive cursor forward by `len` bytes.
    fn advance_rx(&mut self, id: SubflowId, len: u32);
}

#[derive(Debug, Clone)]
struct StoredSegment {
    subflow: SubflowId,
    mapping: DsnMapping,
}

/// Segments received out of connection order, or out of subflow order, keyed by DSN.
/// 按 DSN 索引的、不按连接顺序或子流顺序到达的报文段。
#[derive(Debug, Default)]
pub struct OutOfOrderStore {
    entries: BTreeMap<u32, StoredSegment>,
}

impl OutOfOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a segment. Returns `false` if one with the same DSN is already present.
    /// 存储报文段。如果已存在相同 DSN 的报文段，返回 `false`。
    pub fn insert(&mut self, subflow: SubflowId, mapping: DsnMapping) -> bool {
        match self.entries.entry(mapping.data_seq) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(StoredSegment { subflow, mapping });
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, data_seq: u32) -> bool {
        self.entries.contains_key(&data_seq)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Delivers every segment that has become contiguous with `rx_next` and moves
    /// subflow cursors over segments that have become in order on their subflow.
    /// A segment leaves the store once it is delivered and its subflow cursor has
    /// passed it. Repeats until a full pass makes no progress. Returns the bytes
    /// delivered.
    ///
    /// 交付所有已与 `rx_next` 连续的报文段，并将子流游标移过在其子流上已按序的报文段。
    /// 重复直到一整轮没有进展，返回交付的字节数。
    pub fn drain<C: SubflowCursors + ?Sized>(
        &mut self,
        rx_next: &mut u32,
        cursors: &mut C,
        out: &mut ReceiveBuffer,
    ) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            let keys: Vec<u32> = self.entries.keys().copied().collect();
            for key in keys {
                let Some(stored) = self.entries.get(&key) else {
                    continue;
                };
                let subflow = stored.subflow;
                let length = u32::from(stored.mapping.length);
                let cursor = cursors.rx_seq(subflow);
                let in_subflow_order = cursor == Some(stored.mapping.subflow_seq);
                // Already passed by its subflow cursor, or its subflow is gone.
                let counted = cursor.is_none_or(|rx| stored.mapping.subflow_seq < rx);

                if stored.mapping.data_seq <= *rx_next {
                    let mapping = &stored.mapping;
                    if mapping.data_end() > *rx_next {
                        let offset = (*rx_next - mapping.data_seq) as usize;
                        let bytes = mapping.payload.slice(offset..);
                        delivered += bytes.len();
                        out.append(bytes);
                        *rx_next = mapping.data_end();
                        trace!(
                            data_seq = mapping.data_seq,
                            rx_next = *rx_next,
                            subflow = %subflow,
                            "Drained stored segment"
                        );
                        progressed = true;
                    }
                    if counted || in_subflow_order {
                        self.entries.remove(&key);
                        if in_subflow_order {
                            cursors.advance_rx(subflow, length);
                        }
                        progressed = true;
                    }
                } else if in_subflow_order {
                    cursors.advance_rx(subflow, length);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Cursors(HashMap<SubflowId, u32>);

    impl SubflowCursors for Cursors {
        fn rx_seq(&self, id: SubflowId) -> Option<u32> {
            self.0.get(&id).copied()
        }

        fn advance_rx(&mut self, id: SubflowId, len: u32) {
            if let Some(rx) = self.0.get_mut(&id) {
                *rx += len;
            }
        }
    }

    fn mapping(data_seq: u32, subflow_seq: u32, fill: u8, len: usize) -> DsnMapping {
        DsnMapping::new(data_seq, subflow_seq, 0, Bytes::from(vec![fill; len]))
    }

    #[test]
    fn test_unacked_list_discards_covered_mappings() {
        let mut list = UnackedList::new();
        list.push(mapping(0, 100, 1, 10));
        list.push(mapping(10, 110, 2, 10));
        list.push(mapping(20, 120, 3, 10));

        assert_eq!(list.discard_up_to(115), 1);
        assert_eq!(list.oldest().map(|m| m.subflow_seq), Some(110));
        assert!(list.find(120).is_some());
        assert!(list.find(125).is_none());

        list.find_mut(120).unwrap().dup_acks += 1;
        assert_eq!(list.find(120).unwrap().dup_acks, 1);

        assert_eq!(list.discard_up_to(130), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_duplicate_dsn_is_rejected() {
        let mut store = OutOfOrderStore::new();
        assert!(store.insert(SubflowId(0), mapping(1000, 5, 0, 10)));
        assert!(!store.insert(SubflowId(1), mapping(1000, 9, 0, 10)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_drain_delivers_contiguous_run_and_advances_subflows() {
        let a = SubflowId(0);
        let b = SubflowId(1);
        let mut cursors = Cursors::default();
        // Subflow a already counted its segment; b is still waiting for its own.
        cursors.0.insert(a, 200);
        cursors.0.insert(b, 500);

        let mut store = OutOfOrderStore::new();
        store.insert(a, mapping(10, 190, 2, 10));
        store.insert(b, mapping(20, 500, 3, 5));
        store.insert(b, mapping(40, 505, 9, 5));

        let mut rx_next = 10;
        let mut out = ReceiveBuffer::new();
        let delivered = store.drain(&mut rx_next, &mut cursors, &mut out);

        assert_eq!(delivered, 15);
        assert_eq!(rx_next, 25);
        assert_eq!(cursors.rx_seq(a), Some(200));
        // Both stored b segments became in order on b, so b's cursor moved twice.
        assert_eq!(cursors.rx_seq(b), Some(510));
        assert_eq!(store.len(), 1);
        assert!(store.contains(40));
        assert_eq!(out.read(100), Bytes::from([vec![2u8; 10], vec![3u8; 5]].concat()));
    }

    #[test]
    fn test_drain_trims_overlap_with_delivered_bytes() {
        let a = SubflowId(0);
        let mut cursors = Cursors::default();
        cursors.0.insert(a, 50);
        let mut store = OutOfOrderStore::new();
        store.insert(a, DsnMapping::new(5, 40, 0, Bytes::from_static(b"0123456789")));

        let mut rx_next = 8;
        let mut out = ReceiveBuffer::new();
        assert_eq!(store.drain(&mut rx_next, &mut cursors, &mut out), 7);
        assert_eq!(rx_next, 15);
        assert_eq!(out.read(100), Bytes::from_static(b"3456789"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delivered_segment_waits_for_its_subflow() {
        let a = SubflowId(0);
        let mut cursors = Cursors::default();
        cursors.0.insert(a, 100);
        let mut store = OutOfOrderStore::new();
        // Ahead on its subflow, but already in connection order.
        store.insert(a, mapping(0, 110, 7, 10));

        let mut rx_next = 0;
        let mut out = ReceiveBuffer::new();
        assert_eq!(store.drain(&mut rx_next, &mut cursors, &mut out), 10);
        assert_eq!(rx_next, 10);
        assert!(store.contains(0));

        // The hole on the subflow fills with data delivered elsewhere.
        cursors.advance_rx(a, 10);
        assert_eq!(store.drain(&mut rx_next, &mut cursors, &mut out), 0);
        assert_eq!(cursors.rx_seq(a), Some(120));
        assert!(store.is_empty());
    }
}
