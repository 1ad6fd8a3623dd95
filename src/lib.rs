#![deny(clippy::expect_used, clippy::unwrap_used)]

//! A sans-IO multipath TCP connection engine.
//! 一个无 I/O 的多路径 TCP 连接引擎。
//!
//! A [`Connection`] spreads one reliable byte stream over several subflows, each a
//! TCP-like path between a pair of addresses. The engine consumes [`Datagram`]s and
//! produces [`Transmit`]s; time is passed in explicitly. [`Endpoint`] demultiplexes
//! many connections on one host and [`socket::Driver`] runs an endpoint on a tokio task.

pub mod config;
pub mod core;
pub mod error;
pub mod packet;
pub mod socket;
pub mod timer;
pub mod token;
pub mod transport;

pub use config::Config;
pub use core::{
    connection::{Connection, ConnectionEvent, ConnectionState, Listener},
    endpoint::Endpoint,
    subflow::{SubflowId, SubflowState},
};
pub use error::{Error, Result};
pub use socket::MultipathSocket;
pub use token::{ConnectionHandle, TokenRegistry};
pub use transport::{AllRoutes, Datagram, RouteTable, StaticRoutes, Transmit};
