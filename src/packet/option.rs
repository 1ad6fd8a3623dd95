//! 多路径选项的定义与编解码。
//! Multipath option definitions and their wire encoding.
//!
//! Every option is a kind byte followed by a fixed-size payload. Kind 0 terminates the
//! option list and is used as padding.

use bytes::{Buf, BufMut};
use std::net::Ipv4Addr;

pub const KIND_END: u8 = 0;
pub const KIND_MP_CAPABLE: u8 = 30;
pub const KIND_MP_JOIN: u8 = 31;
pub const KIND_ADD_ADDR: u8 = 32;
pub const KIND_DSN_MAPPING: u8 = 34;

/// A multipath option carried in the segment header.
/// 报文段头中携带的多路径选项。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MptcpOption {
    /// Handshake option establishing the sender's connection token.
    /// 握手选项，建立发送方的连接令牌。
    MpCapable { sender_token: u32 },
    /// Asks the receiver to attach a new subflow to the connection owning the token.
    /// 请求接收方将新子流加入拥有该令牌的连接。
    MpJoin { receiver_token: u32, address_id: u8 },
    /// Advertises an additional local address.
    /// 通告额外的本地地址。
    AddAddr { address_id: u8, address: Ipv4Addr },
    /// Maps the segment payload onto the connection-level byte stream.
    /// 将报文段载荷映射到连接级字节流。
    DsnMapping {
        data_seq: u32,
        length: u16,
        subflow_seq: u32,
    },
}

impl MptcpOption {
    pub fn kind(&self) -> u8 {
        match self {
            MptcpOption::MpCapable { .. } => KIND_MP_CAPABLE,
            MptcpOption::MpJoin { .. } => KIND_MP_JOIN,
            MptcpOption::AddAddr { .. } => KIND_ADD_ADDR,
            MptcpOption::DsnMapping { .. } => KIND_DSN_MAPPING,
        }
    }

    /// Number of bytes the option occupies on the wire, kind byte included.
    /// 选项在线路上占用的字节数（包括类型字节）。
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            MptcpOption::MpCapable { .. } => 4,
            MptcpOption::MpJoin { .. } => 5,
            MptcpOption::AddAddr { .. } => 5,
            MptcpOption::DsnMapping { .. } => 10,
        }
    }

    /// 将选项编码到缓冲区。
    /// Encodes the option into a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind());
        match *self {
            MptcpOption::MpCapable { sender_token } => buf.put_u32(sender_token),
            MptcpOption::MpJoin {
                receiver_token,
                address_id,
            } => {
                buf.put_u32(receiver_token);
                buf.put_u8(address_id);
            }
            MptcpOption::AddAddr {
                address_id,
                address,
            } => {
                buf.put_u8(address_id);
                buf.put_u32(address.into());
            }
            MptcpOption::DsnMapping {
                data_seq,
                length,
                subflow_seq,
            } => {
                buf.put_u32(data_seq);
                buf.put_u16(length);
                buf.put_u32(subflow_seq);
            }
        }
    }

    /// Decodes one option whose kind byte has already been consumed.
    /// Returns `None` for an unknown kind or a truncated payload.
    ///
    /// 解码一个类型字节已被读取的选项。未知类型或载荷截断时返回 `None`。
    pub fn decode_body<B: Buf>(kind: u8, buf: &mut B) -> Option<Self> {
        let needed = match kind {
            KIND_MP_CAPABLE => 4,
            KIND_MP_JOIN | KIND_ADD_ADDR => 5,
            KIND_DSN_MAPPING => 10,
            _ => return None,
        };
        if buf.remaining() < needed {
            return None;
        }
        let option = match kind {
            KIND_MP_CAPABLE => MptcpOption::MpCapable {
                sender_token: buf.get_u32(),
            },
            KIND_MP_JOIN => MptcpOption::MpJoin {
                receiver_token: buf.get_u32(),
                address_id: buf.get_u8(),
            },
            KIND_ADD_ADDR => MptcpOption::AddAddr {
                address_id: buf.get_u8(),
                address: Ipv4Addr::from(buf.get_u32()),
            },
            _ => MptcpOption::DsnMapping {
                data_seq: buf.get_u32(),
                length: buf.get_u16(),
                subflow_seq: buf.get_u32(),
            },
        };
        Some(option)
    }
}
