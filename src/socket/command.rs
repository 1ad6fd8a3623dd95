//! Commands sent from a [`DriverHandle`](super::DriverHandle) to the driver task.

use crate::{error::Result, token::ConnectionHandle};
use bytes::Bytes;
use std::net::SocketAddrV4;
use tokio::sync::oneshot;

/// Commands handled by the driver task.
///
/// 由驱动任务处理的命令。
#[derive(Debug)]
pub enum DriverCommand {
    /// Opens a connection from `local` to `remote`.
    /// 打开从 `local` 到 `remote` 的连接。
    Connect {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        response_tx: oneshot::Sender<Result<ConnectionHandle>>,
    },
    /// Queues bytes on a connection.
    /// 在连接上排队发送字节。
    Write {
        handle: ConnectionHandle,
        data: Bytes,
        response_tx: oneshot::Sender<Result<usize>>,
    },
    /// Takes up to `max` readable bytes. Answers with an empty buffer when nothing is
    /// readable yet.
    Read {
        handle: ConnectionHandle,
        max: usize,
        response_tx: oneshot::Sender<Result<Bytes>>,
    },
    /// Starts a graceful close.
    /// 开始优雅关闭。
    Close {
        handle: ConnectionHandle,
        response_tx: oneshot::Sender<Result<()>>,
    },
}
