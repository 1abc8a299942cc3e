//! Bounded in-memory byte streams backing pipe stdio. A writer that would
//! exceed the buffer capacity suspends until the reader drains enough
//! bytes; a reader on an empty open pipe suspends until bytes arrive or
//! the write end closes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

pub const DEFAULT_PIPE_CAPACITY: usize = 16 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

pub struct PipeBuffer {
    capacity: usize,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

impl PipeBuffer {
    pub fn new() -> Arc<PipeBuffer> {
        PipeBuffer::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<PipeBuffer> {
        Arc::new(PipeBuffer {
            capacity,
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes a read would currently return without suspending.
    pub fn available(&self) -> u64 {
        self.state.lock().buf.len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the stream. Pending and future reads drain the remaining
    /// bytes and then report end-of-stream; subsequent writes are
    /// swallowed, reporting the full length as consumed.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Write all of `bytes`, suspending whenever the buffer is full.
    /// Returns the number of bytes accepted (always the full length).
    pub async fn write(&self, bytes: &[u8]) -> u64 {
        let mut offset = 0;
        while offset < bytes.len() {
            // Register the waiter before re-checking the buffer so a drain
            // between the check and the await cannot be missed.
            let drained = self.writable.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return bytes.len() as u64;
                }
                let room = self.capacity.saturating_sub(state.buf.len());
                if room > 0 {
                    let take = std::cmp::min(room, bytes.len() - offset);
                    state.buf.extend(&bytes[offset..offset + take]);
                    offset += take;
                    self.readable.notify_waiters();
                    continue;
                }
            }
            drained.await;
        }
        bytes.len() as u64
    }

    /// Read up to `max` bytes. Suspends on an empty open pipe; returns an
    /// empty vector only at end-of-stream (or `max == 0`).
    pub async fn read(&self, max: usize) -> Vec<u8> {
        if max == 0 {
            return Vec::new();
        }
        loop {
            let filled = self.readable.notified();
            tokio::pin!(filled);
            filled.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.buf.is_empty() {
                    let take = std::cmp::min(max, state.buf.len());
                    let out: Vec<u8> = state.buf.drain(..take).collect();
                    self.writable.notify_waiters();
                    return out;
                }
                if state.closed {
                    return Vec::new();
                }
            }
            filled.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let pipe = PipeBuffer::new();
        pipe.write(b"hello").await;
        assert_eq!(pipe.available(), 5);
        assert_eq!(pipe.read(16).await, b"hello");
        assert_eq!(pipe.available(), 0);
    }

    #[tokio::test]
    async fn reader_waits_for_writer() {
        let pipe = PipeBuffer::new();
        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        pipe.write(b"data").await;
        assert_eq!(reader.await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn writer_suspends_at_capacity() {
        let pipe = PipeBuffer::with_capacity(4);
        pipe.write(b"full").await;
        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(b"more").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!writer.is_finished());
        assert_eq!(pipe.read(4).await, b"full");
        writer.await.unwrap();
        assert_eq!(pipe.read(4).await, b"more");
    }

    #[tokio::test]
    async fn close_ends_reads() {
        let pipe = PipeBuffer::new();
        pipe.write(b"tail").await;
        pipe.close();
        assert_eq!(pipe.read(16).await, b"tail");
        assert_eq!(pipe.read(16).await, b"");
    }
}
