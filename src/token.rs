//! 连接令牌注册表。
//! The connection token registry.
//!
//! Tokens are exchanged in MP_CAPABLE and let later MP_JOIN handshakes find the
//! connection they belong to. The registry is shared by every connection served by a
//! demultiplexer and is passed to each connection explicitly.

use crate::error::{Error, Result};
use dashmap::{DashMap, mapref::entry::Entry};
use rand::Rng;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, trace};

/// Attempts made to find a free token before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Identifies a connection inside a demultiplexer.
/// 在解复用器内部标识一个连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A cloneable handle to the process-wide token map.
/// 进程范围令牌映射的可克隆句柄。
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: Arc<DashMap<u32, ConnectionHandle>>,
    next_handle: Arc<AtomicU64>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a fresh connection handle.
    /// 分配一个新的连接句柄。
    pub fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Draws random non-zero tokens until one is unused and binds it to `handle`.
    /// 随机抽取非零令牌直到找到未使用的，并将其绑定到 `handle`。
    pub fn allocate<R: Rng + ?Sized>(&self, handle: ConnectionHandle, rng: &mut R) -> Result<u32> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let token: u32 = rng.random();
            if token == 0 {
                continue;
            }
            match self.tokens.entry(token) {
                Entry::Vacant(slot) => {
                    slot.insert(handle);
                    debug!(token, connection = %handle, "Allocated connection token");
                    return Ok(token);
                }
                Entry::Occupied(_) => {
                    trace!(token, "Token collision, drawing again");
                }
            }
        }
        Err(Error::TokenSpaceExhausted)
    }

    pub fn lookup(&self, token: u32) -> Option<ConnectionHandle> {
        self.tokens.get(&token).map(|entry| *entry.value())
    }

    /// Removes a token. Returns `false` if it was not registered.
    /// 移除令牌。如果未注册则返回 `false`。
    pub fn release(&self, token: u32) -> bool {
        let removed = self.tokens.remove(&token).is_some();
        if removed {
            debug!(token, "Released connection token");
        }
        removed
    }

    pub fn contains(&self, token: u32) -> bool {
        self.tokens.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
