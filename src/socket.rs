//! The socket-level API: the byte-stream view of a connection and the async driver
//! that runs an endpoint on a tokio task.
//!
//! 套接字层 API：连接的字节流视图，以及在 tokio 任务上运行端点的异步驱动器。

pub mod command;
pub mod driver;
pub mod sink;

pub use command::DriverCommand;
pub use driver::{Driver, DriverHandle};
pub use sink::{ChannelSink, SegmentSink, UdpSink, udp_receiver_task};

use crate::{core::connection::Connection, error::Result};
use bytes::Bytes;
use tokio::time::Instant;

#[cfg(test)]
mod tests;

/// A reliable, ordered byte stream spread over several paths.
///
/// 分布在多条路径上的可靠有序字节流。
pub trait MultipathSocket {
    /// Queues bytes for sending. Returns how many were accepted.
    /// 将字节放入发送队列，返回被接受的字节数。
    fn send(&mut self, data: &[u8], now: Instant) -> Result<usize>;

    /// Takes up to `max` in-order bytes. Empty when nothing is readable.
    fn receive(&mut self, max: usize) -> Bytes;

    /// Starts a graceful close.
    fn close(&mut self, now: Instant) -> Result<()>;

    fn is_established(&self) -> bool;
}

impl MultipathSocket for Connection {
    fn send(&mut self, data: &[u8], now: Instant) -> Result<usize> {
        self.write(data, now)
    }

    fn receive(&mut self, max: usize) -> Bytes {
        self.read(max)
    }

    fn close(&mut self, now: Instant) -> Result<()> {
        Connection::close(self, now)
    }

    fn is_established(&self) -> bool {
        Connection::is_established(self)
    }
}
