//! The protocol core: connections, subflows, reliability and congestion control.
//! 协议核心：连接、子流、可靠性和拥塞控制。

pub mod congestion;
pub mod connection;
pub mod endpoint;
pub mod reliability;
pub mod subflow;

#[cfg(test)]
pub mod test_utils;
