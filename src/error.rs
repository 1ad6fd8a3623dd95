//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// The primary error type for the multipath connection engine.
/// 多路径连接引擎的主要错误类型。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An underlying I/O error occurred. Only the kind is kept so that errors can be
    /// cloned into connection events.
    /// 发生了底层的I/O错误。
    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),

    /// A received segment was invalid and could not be decoded.
    /// 接收到的报文段无效，无法解码。
    #[error("Invalid packet received")]
    InvalidPacket,

    /// The peer sent a flag combination that is illegal in the current subflow state.
    /// 对端发送了当前子流状态下非法的标志组合。
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A handshake segment arrived without the multipath option it requires.
    /// 握手报文段缺少所需的多路径选项。
    #[error("Handshake segment is missing its multipath option")]
    MissingHandshakeOption,

    /// The connection was reset by the peer or aborted after a protocol violation.
    /// 连接被对端重置，或因协议违规而中止。
    #[error("Connection reset")]
    ConnectionReset,

    /// The peer refused the connection attempt.
    /// 对端拒绝了连接请求。
    #[error("Connection refused")]
    ConnectionRefused,

    /// Handshake retries were exhausted.
    /// 握手重试次数耗尽。
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// The operation is not allowed because the connection is closing or closed.
    /// 由于连接正在关闭或已关闭，操作不被允许。
    #[error("Connection is closed or closing")]
    ConnectionClosed,

    /// The operation could not be completed because the connection is not established.
    /// 由于连接未处于建立状态，操作无法完成。
    #[error("Connection not established")]
    NotConnected,

    /// No free connection token could be found.
    /// 无法找到空闲的连接令牌。
    #[error("Connection token space exhausted")]
    TokenSpaceExhausted,

    /// The connection already holds the configured maximum number of subflows.
    /// 连接已拥有配置允许的最大子流数量。
    #[error("Subflow limit reached")]
    TooManySubflows,

    /// An internal sequence-number invariant was broken, for example an acknowledgment
    /// for data that was never sent.
    /// 内部序列号不变量被破坏，例如确认了从未发送的数据。
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// No connection is registered under the given handle or token.
    /// 给定句柄或令牌下没有注册的连接。
    #[error("Unknown connection")]
    UnknownConnection,

    /// An internal channel for communication between tasks was closed unexpectedly.
    /// 用于任务间通信的内部通道意外关闭。
    #[error("Internal channel is broken")]
    ChannelClosed,
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.kind())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(kind) => kind.into(),
            Error::InvalidPacket => ErrorKind::InvalidData.into(),
            Error::ProtocolViolation(msg) => std::io::Error::new(ErrorKind::InvalidData, msg),
            Error::MissingHandshakeOption => ErrorKind::InvalidData.into(),
            Error::ConnectionReset => ErrorKind::ConnectionReset.into(),
            Error::ConnectionRefused => ErrorKind::ConnectionRefused.into(),
            Error::ConnectionTimeout => ErrorKind::TimedOut.into(),
            Error::ConnectionClosed => ErrorKind::ConnectionAborted.into(),
            Error::NotConnected => ErrorKind::NotConnected.into(),
            Error::TokenSpaceExhausted => ErrorKind::AddrInUse.into(),
            Error::TooManySubflows => ErrorKind::OutOfMemory.into(),
            Error::InvariantViolation(msg) => std::io::Error::other(msg),
            Error::UnknownConnection => ErrorKind::NotFound.into(),
            Error::ChannelClosed => ErrorKind::BrokenPipe.into(),
        }
    }
}
