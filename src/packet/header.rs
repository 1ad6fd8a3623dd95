//! 定义报文段头。
//! Defines the segment header.

use super::{
    flags::Flags,
    option::{KIND_END, MptcpOption},
};
use bytes::{Buf, BufMut};

/// Size of the header without options.
/// 不含选项的头部大小。
pub const FIXED_HEADER_SIZE: usize = 16;

/// The header of every segment exchanged on a subflow.
/// 子流上交换的每个报文段的头部。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Subflow-level sequence number of the first payload byte.
    /// 第一个载荷字节的子流级序列号。
    pub seq: u32,
    /// Next subflow-level sequence number the sender expects to receive.
    /// 发送方期望接收的下一个子流级序列号。
    pub ack: u32,
    pub flags: Flags,
    /// Receive window advertised by the sender of this segment.
    /// 此报文段发送方通告的接收窗口。
    pub window: u16,
    pub options: Vec<MptcpOption>,
}

impl SegmentHeader {
    /// Option bytes including the zero padding up to a 4-byte boundary.
    /// 选项字节数，包括补齐到4字节边界的零填充。
    fn padded_options_len(&self) -> usize {
        let raw: usize = self.options.iter().map(MptcpOption::encoded_len).sum();
        raw.div_ceil(4) * 4
    }

    /// Total encoded size of the header.
    /// 头部编码后的总大小。
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE + self.padded_options_len()
    }

    /// 将头部编码到缓冲区。
    /// Encodes the header into a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let padded = self.padded_options_len();
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(((FIXED_HEADER_SIZE + padded) / 4) as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        let mut written = 0;
        for option in &self.options {
            option.encode(buf);
            written += option.encoded_len();
        }
        buf.put_bytes(KIND_END, padded - written);
    }

    /// 从缓冲区解码头部。
    /// Decodes a header from a buffer.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < FIXED_HEADER_SIZE {
            return None;
        }
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let header_len = buf.get_u8() as usize * 4;
        let flags = Flags::from_bits(buf.get_u8());
        let window = buf.get_u16();

        let options_len = header_len.checked_sub(FIXED_HEADER_SIZE)?;
        if buf.remaining() < options_len {
            return None;
        }
        let mut options_buf = buf.copy_to_bytes(options_len);
        let mut options = Vec::new();
        while options_buf.has_remaining() {
            let kind = options_buf.get_u8();
            if kind == KIND_END {
                break;
            }
            options.push(MptcpOption::decode_body(kind, &mut options_buf)?);
        }

        Some(SegmentHeader {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            options,
        })
    }
}
