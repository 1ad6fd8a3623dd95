//! The reliability layer: byte buffers, data sequence mappings and RTT estimation.
//!
//! 可靠性层：字节缓冲区、数据序列映射和 RTT 估计。

pub mod mapping;
pub mod recv_buffer;
pub mod rtt;
pub mod send_buffer;
