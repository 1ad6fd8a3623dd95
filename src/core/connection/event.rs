//! 连接向应用层报告的事件
//! Events a connection reports to the application

use crate::{core::subflow::SubflowId, error::Error};

/// Something the application may want to react to.
/// 应用程序可能需要响应的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The initial subflow completed its handshake.
    /// 初始子流完成握手。
    Connected,
    /// An additional subflow completed its handshake.
    SubflowEstablished(SubflowId),
    /// A subflow reached CLOSED.
    SubflowClosed(SubflowId),
    /// New in-order bytes are ready for [`read`](super::Connection::read).
    DataReadable,
    /// The peer will send no more data.
    /// 对端不会再发送数据。
    PeerClosed,
    /// The connection failed. Always followed by [`ConnectionEvent::Closed`].
    /// 连接失败，随后总会有 [`ConnectionEvent::Closed`]。
    Error(Error),
    /// Every subflow is closed and the token has been released.
    /// 所有子流已关闭，令牌已释放。
    Closed,
}
