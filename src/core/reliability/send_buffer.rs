//! Buffers application bytes until the scheduler hands them to a subflow.
//!
//! 缓存应用层字节，直到调度器将其交给某个子流。

use bytes::{Bytes, BytesMut};

const DEFAULT_SEND_BUFFER_CAPACITY_BYTES: usize = 1024 * 1024; // 1 MB

/// FIFO byte buffer shared by all subflows of a connection.
#[derive(Debug)]
pub struct SendBuffer {
    stream_buffer: BytesMut,
    capacity: usize,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_BUFFER_CAPACITY_BYTES)
    }
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            stream_buffer: BytesMut::new(),
            capacity,
        }
    }

    /// Appends as much of `buf` as fits. Returns the number of bytes accepted.
    ///
    /// 尽可能多地追加 `buf`，返回接受的字节数。
    pub fn enqueue(&mut self, buf: &[u8]) -> usize {
        let space_available = self.capacity.saturating_sub(self.stream_buffer.len());
        let bytes_to_write = std::cmp::min(buf.len(), space_available);
        self.stream_buffer.extend_from_slice(&buf[..bytes_to_write]);
        bytes_to_write
    }

    /// Takes at most `max_size` bytes from the front of the buffer.
    ///
    /// 从缓冲区头部取出最多 `max_size` 字节。
    pub fn dequeue_up_to(&mut self, max_size: usize) -> Option<Bytes> {
        let chunk_size = std::cmp::min(self.stream_buffer.len(), max_size);
        if chunk_size == 0 {
            return None;
        }
        Some(self.stream_buffer.split_to(chunk_size).freeze())
    }

    pub fn pending_bytes(&self) -> usize {
        self.stream_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream_buffer.is_empty()
    }

    /// Drops everything still queued, used when the connection aborts.
    pub fn clear(&mut self) {
        self.stream_buffer.clear();
    }
}
