//! 定义完整的报文段：头部加载荷。
//! Defines a complete segment: header plus payload.

use super::{flags::Flags, header::SegmentHeader, option::MptcpOption};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes};
use std::net::Ipv4Addr;

/// A segment as exchanged on one subflow.
/// 在一个子流上交换的报文段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Bytes,
}

impl Segment {
    /// Creates a segment without payload.
    /// 创建一个不带载荷的报文段。
    pub fn control(
        ports: (u16, u16),
        seq: u32,
        ack: u32,
        flags: Flags,
        window: u16,
        options: Vec<MptcpOption>,
    ) -> Self {
        Self {
            header: SegmentHeader {
                src_port: ports.0,
                dst_port: ports.1,
                seq,
                ack,
                flags,
                window,
                options,
            },
            payload: Bytes::new(),
        }
    }

    /// Creates a data segment carrying a DSN mapping for its payload.
    /// 创建一个为其载荷携带 DSN 映射的数据报文段。
    pub fn data(
        ports: (u16, u16),
        seq: u32,
        ack: u32,
        window: u16,
        data_seq: u32,
        payload: Bytes,
    ) -> Self {
        let mapping = MptcpOption::DsnMapping {
            data_seq,
            length: payload.len() as u16,
            subflow_seq: seq,
        };
        Self {
            header: SegmentHeader {
                src_port: ports.0,
                dst_port: ports.1,
                seq,
                ack,
                flags: Flags::NONE,
                window,
                options: vec![mapping],
            },
            payload,
        }
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    /// The DSN mapping carried by this segment, as `(data_seq, subflow_seq, length)`.
    /// 此报文段携带的 DSN 映射。
    pub fn dsn_mapping(&self) -> Option<(u32, u32, u16)> {
        self.header.options.iter().find_map(|option| match *option {
            MptcpOption::DsnMapping {
                data_seq,
                length,
                subflow_seq,
            } => Some((data_seq, subflow_seq, length)),
            _ => None,
        })
    }

    /// Checks that every sequence number the segment occupies, in the subflow space
    /// and in the data space, fits the non-wrapping 32-bit range.
    ///
    /// 检查报文段占用的所有序列号（子流空间和数据空间）都在不回绕的 32 位范围内。
    pub fn validate_sequence_space(&self) -> Result<()> {
        let flags = self.flags();
        let control = u64::from(flags.contains(Flags::SYN)) + u64::from(flags.contains(Flags::FIN));
        let payload = self.payload.len() as u64;
        let fits = |start: u32, len: u64| u64::from(start) + len <= u64::from(u32::MAX);

        if !fits(self.header.seq, payload + control) {
            return Err(Error::ProtocolViolation(format!(
                "segment at seq {} overflows the sequence space",
                self.header.seq
            )));
        }
        if let Some((data_seq, subflow_seq, length)) = self.dsn_mapping() {
            let len = payload.max(u64::from(length));
            if !fits(data_seq, len) || !fits(subflow_seq, len) {
                return Err(Error::ProtocolViolation(format!(
                    "mapping at data seq {data_seq} overflows the sequence space"
                )));
            }
        }
        Ok(())
    }

    pub fn mp_capable(&self) -> Option<u32> {
        self.header.options.iter().find_map(|option| match *option {
            MptcpOption::MpCapable { sender_token } => Some(sender_token),
            _ => None,
        })
    }

    /// The `(receiver_token, address_id)` of an MP_JOIN option.
    pub fn mp_join(&self) -> Option<(u32, u8)> {
        self.header.options.iter().find_map(|option| match *option {
            MptcpOption::MpJoin {
                receiver_token,
                address_id,
            } => Some((receiver_token, address_id)),
            _ => None,
        })
    }

    pub fn added_addresses(&self) -> impl Iterator<Item = (u8, Ipv4Addr)> + '_ {
        self.header.options.iter().filter_map(|option| match *option {
            MptcpOption::AddAddr {
                address_id,
                address,
            } => Some((address_id, address)),
            _ => None,
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.payload.len()
    }

    /// 将报文段编码到缓冲区。
    /// Encodes the segment into a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }

    /// Decodes a segment. Everything after the header is taken as payload.
    /// 解码报文段。头部之后的所有内容都作为载荷。
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        let header = SegmentHeader::decode(buf)?;
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(Segment { header, payload })
    }

    /// Parses one datagram payload as a segment.
    /// 将一个数据报载荷解析为报文段。
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        Self::decode(&mut &datagram[..]).ok_or(Error::InvalidPacket)
    }
}
