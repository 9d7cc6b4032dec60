//! Receive buffer shared between the UART receive context and the parser.
//!
//! The producer only appends under a short critical section; the consumer
//! copies a snapshot out under the same lock, scans it without holding the
//! lock, then consumes exactly the bytes it accounted for.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use crate::frame::ESC;

pub const ARENA_CAPACITY: usize = 2048;

#[derive(Debug)]
struct ArenaInner {
    bytes: [u8; ARENA_CAPACITY],
    len: usize,
    /// A frame end was probably seen since the last snapshot.
    pending: bool,
    overflowed: bool,
}

#[derive(Debug)]
pub struct ReceiveArena {
    inner: Mutex<ArenaInner>,
    ready: Condvar,
}

impl Default for ReceiveArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveArena {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                bytes: [0; ARENA_CAPACITY],
                len: 0,
                pending: false,
                overflowed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Appends a received chunk. Never allocates and never parses.
    pub fn feed(&self, chunk: &[u8]) {
        // Empty chunks and line noise ending in NUL carry nothing.
        if matches!(chunk.last(), None | Some(0)) {
            return;
        }
        let mut inner = self.lock();
        let start = inner.len;
        let end = start + chunk.len();
        if end > ARENA_CAPACITY {
            inner.overflowed = true;
            inner.pending = true;
            drop(inner);
            self.ready.notify_all();
            return;
        }
        inner.bytes[start..end].copy_from_slice(chunk);
        inner.len = end;

        if Self::hints_frame(&inner.bytes[..end]) {
            inner.pending = true;
            drop(inner);
            self.ready.notify_all();
        }
    }

    /// Copies the buffered bytes into `out` if a frame end was hinted.
    ///
    /// Returns the overflow flag on success; the hint is cleared.
    pub fn take_pending(&self, out: &mut Vec<u8>) -> Option<bool> {
        let mut inner = self.lock();
        if !inner.pending {
            return None;
        }
        inner.pending = false;
        out.clear();
        out.extend_from_slice(&inner.bytes[..inner.len]);
        Some(inner.overflowed)
    }

    /// Drops the first `count` bytes, keeping anything that arrived after
    /// the snapshot was taken.
    pub fn consume(&self, count: usize) {
        let mut inner = self.lock();
        let count = count.min(inner.len);
        let len = inner.len;
        inner.bytes.copy_within(count..len, 0);
        inner.len = len - count;
        inner.overflowed = false;
        if inner.len > 0 && Self::hints_frame(&inner.bytes[..inner.len]) {
            inner.pending = true;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.len = 0;
        inner.pending = false;
        inner.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending
    }

    pub fn overflowed(&self) -> bool {
        self.lock().overflowed
    }

    /// Blocks until a frame end is hinted or `timeout` elapses.
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |inner| !inner.pending)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.pending
    }

    fn hints_frame(bytes: &[u8]) -> bool {
        bytes.ends_with(b"\r\n") || (bytes.len() >= 2 && bytes[bytes.len() - 2] == ESC)
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn hint_set_on_crlf_and_escape() {
        let arena = ReceiveArena::new();
        arena.feed(b"AT\r");
        assert!(!arena.has_pending());
        arena.feed(b"\n");
        assert!(arena.has_pending());

        let arena = ReceiveArena::new();
        arena.feed(&[ESC, b'S', b'x', ESC, b'E']);
        assert!(arena.has_pending());
    }

    #[test]
    fn nul_terminated_chunk_is_dropped() {
        let arena = ReceiveArena::new();
        arena.feed(b"garbage\0");
        assert!(arena.is_empty());
    }

    #[test]
    fn overflow_rejects_chunk_and_flags() {
        let arena = ReceiveArena::new();
        arena.feed(&[b'a'; ARENA_CAPACITY - 1]);
        arena.feed(b"bc");
        assert_eq!(arena.len(), ARENA_CAPACITY - 1);
        assert!(arena.overflowed());

        let mut out = Vec::new();
        assert_eq!(arena.take_pending(&mut out), Some(true));
        assert_eq!(out.len(), ARENA_CAPACITY - 1);
    }

    #[test]
    fn consume_keeps_late_bytes() {
        let arena = ReceiveArena::new();
        arena.feed(b"AT\r\nOK\r\n");
        let mut out = Vec::new();
        assert_eq!(arena.take_pending(&mut out), Some(false));
        arena.feed(b"AT+W");
        arena.consume(out.len());

        assert_eq!(arena.len(), 4);
        assert!(!arena.has_pending());
        assert_eq!(arena.take_pending(&mut out), None);
    }

    #[test]
    fn waiter_wakes_on_feed() {
        let arena = Arc::new(ReceiveArena::new());
        let producer = Arc::clone(&arena);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.feed(b"OK\r\n");
        });

        let started = Instant::now();
        assert!(arena.wait_for_frame(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_input() {
        let arena = ReceiveArena::new();
        assert!(!arena.wait_for_frame(Duration::from_millis(10)));
    }
}
