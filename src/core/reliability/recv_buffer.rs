//! Holds connection-ordered bytes until the application reads them.
//!
//! 保存按连接顺序排列的字节，直到应用层读取。

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// In-order bytes ready for the application.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes that are already in connection order.
    ///
    /// 追加已按连接顺序排列的字节。
    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Reads up to `max` bytes.
    ///
    /// 读取最多 `max` 字节。
    pub fn read(&mut self, max: usize) -> Bytes {
        let mut wanted = max.min(self.len);
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= wanted {
                self.len -= wanted;
                let out = front.split_to(wanted);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return out;
            }
        }
        let mut out = BytesMut::with_capacity(wanted);
        while wanted > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let take = wanted.min(chunk.len());
            out.extend_from_slice(&chunk.split_to(take));
            if !chunk.is_empty() {
                self.chunks.push_front(chunk);
            }
            wanted -= take;
            self.len -= take;
        }
        out.freeze()
    }

    pub fn available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
