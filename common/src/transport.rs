use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use log::{debug, trace, warn};

use crate::{
    arena::ReceiveArena,
    error::TransportError,
    frame::{self, Frame, ScanStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReplyState {
    Ready,
    MsgSent,
    PendingReply,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Nothing new was hinted since the last pass.
    Idle,
    /// The decoded queue is held by a pending read; nothing was touched.
    Locked,
    Complete { decoded: usize },
    Incomplete { decoded: usize },
}

#[derive(Debug)]
struct Decoder {
    state: ReplyState,
    /// First arena byte not yet turned into a frame.
    resume_at: usize,
    frames: VecDeque<Frame>,
    locked: bool,
    scratch: Vec<u8>,
}

pub struct SerialTransport {
    arena: Arc<ReceiveArena>,
    decoder: Mutex<Decoder>,
    port: Mutex<Box<dyn Write + Send>>,
    write_settle: Duration,
}

impl SerialTransport {
    pub fn new(
        arena: Arc<ReceiveArena>,
        port: Box<dyn Write + Send>,
        write_settle: Duration,
    ) -> Self {
        Self {
            arena,
            decoder: Mutex::new(Decoder {
                state: ReplyState::Ready,
                resume_at: 0,
                frames: VecDeque::new(),
                locked: false,
                scratch: Vec::with_capacity(crate::arena::ARENA_CAPACITY),
            }),
            port: Mutex::new(port),
            write_settle,
        }
    }

    pub fn arena(&self) -> &Arc<ReceiveArena> {
        &self.arena
    }

    /// Turns hinted arena content into frames.
    pub fn parse(&self) -> ParseOutcome {
        let mut guard = self.decoder();
        if guard.locked {
            return ParseOutcome::Locked;
        }
        let decoder = &mut *guard;
        let Some(overflowed) = self.arena.take_pending(&mut decoder.scratch) else {
            return ParseOutcome::Idle;
        };

        let scan = frame::scan(&decoder.scratch, decoder.resume_at);
        let decoded = scan.frames.len();
        for frame in &scan.frames {
            trace!("decoded {:?}", frame.text());
        }
        decoder.frames.extend(scan.frames);

        match scan.status {
            ScanStatus::Complete => {
                self.arena.consume(decoder.scratch.len());
                decoder.resume_at = 0;
                decoder.state = ReplyState::Ready;
                ParseOutcome::Complete { decoded }
            }
            ScanStatus::Incomplete if overflowed => {
                warn!(
                    "receive buffer overflowed with {} unframed byte(s); discarding",
                    decoder.scratch.len() - scan.next
                );
                self.arena.reset();
                decoder.resume_at = 0;
                decoder.state = ReplyState::Ready;
                ParseOutcome::Complete { decoded }
            }
            ScanStatus::Incomplete => {
                decoder.resume_at = scan.next;
                decoder.state = ReplyState::Incomplete;
                ParseOutcome::Incomplete { decoded }
            }
        }
    }

    /// Locks the decoded queue and hands out a snapshot of it.
    pub fn read_all(&self) -> Result<PendingFrames<'_>, TransportError> {
        let mut decoder = self.decoder();
        if decoder.locked {
            return Err(TransportError::Locked);
        }
        decoder.locked = true;
        let frames = decoder.frames.iter().cloned().collect();
        Ok(PendingFrames {
            transport: self,
            frames,
            released: false,
        })
    }

    pub fn read_and_erase_all(&self) -> Result<Vec<Frame>, TransportError> {
        let mut decoder = self.decoder();
        if decoder.locked {
            return Err(TransportError::Locked);
        }
        Ok(decoder.frames.drain(..).collect())
    }

    pub fn read(&self) -> Result<Option<Frame>, TransportError> {
        let mut decoder = self.decoder();
        if decoder.locked {
            return Err(TransportError::Locked);
        }
        Ok(decoder.frames.pop_front())
    }

    pub fn message_pending(&self) -> bool {
        !self.decoder().frames.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.decoder().frames.len()
    }

    pub fn is_locked(&self) -> bool {
        self.decoder().locked
    }

    pub fn state(&self) -> ReplyState {
        self.decoder().state
    }

    pub fn waiting_for_reply(&self) -> bool {
        self.decoder().state > ReplyState::Ready
    }

    /// Drops everything, held lock included. Used after a modem restart.
    pub fn restart(&self) {
        let mut decoder = self.decoder();
        decoder.frames.clear();
        decoder.resume_at = 0;
        decoder.locked = false;
        decoder.state = ReplyState::Ready;
        self.arena.reset();
        debug!("serial transport reset");
    }

    /// Writes `command` followed by `\r`.
    pub fn write(&self, command: &str) -> io::Result<()> {
        {
            let mut port = self
                .port
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            port.write_all(command.as_bytes())?;
            port.write_all(b"\r")?;
            port.flush()?;
        }
        trace!("sent {command:?}");
        self.decoder().state = ReplyState::MsgSent;
        if !self.write_settle.is_zero() {
            thread::sleep(self.write_settle);
        }
        Ok(())
    }

    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        self.arena.wait_for_frame(timeout)
    }

    fn decoder(&self) -> MutexGuard<'_, Decoder> {
        self.decoder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unlock(&self, take: Option<usize>) -> Option<Frame> {
        let mut decoder = self.decoder();
        decoder.locked = false;
        take.and_then(|index| decoder.frames.remove(index))
    }
}

/// Snapshot of the decoded queue taken under its lock.
///
/// The queue stays locked until exactly one frame is taken or the guard is
/// released or dropped.
pub struct PendingFrames<'a> {
    transport: &'a SerialTransport,
    frames: Vec<Frame>,
    released: bool,
}

impl PendingFrames<'_> {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn position(&self, matches: impl Fn(&Frame) -> bool) -> Option<usize> {
        self.frames.iter().position(matches)
    }

    pub fn take(mut self, index: usize) -> Option<Frame> {
        self.released = true;
        self.transport.unlock(Some(index))
    }

    pub fn release(mut self) {
        self.released = true;
        self.transport.unlock(None);
    }
}

impl Drop for PendingFrames<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.transport.unlock(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::ESC;

    fn transport() -> SerialTransport {
        SerialTransport::new(
            Arc::new(ReceiveArena::new()),
            Box::new(io::sink()),
            Duration::ZERO,
        )
    }

    fn stream() -> Vec<u8> {
        let mut bytes = b"AT\r\r\n\r\nOK\r\nAT+WS=MySSID\r\r\n  SSID  BSSID\r\n\r\nOK\r\n".to_vec();
        bytes.extend_from_slice(&[ESC, b'S', b'0', b'h', b'i', ESC, b'E']);
        bytes.extend_from_slice(b"AT+HTTPCLOSE=1\r\nERROR: INVALID CID\r\nDISCONNECT 1\r\n");
        bytes
    }

    fn drain(transport: &SerialTransport) -> Vec<Frame> {
        transport.read_and_erase_all().unwrap()
    }

    #[test]
    fn chunked_feed_matches_single_feed() {
        let whole = transport();
        whole.arena().feed(&stream());
        whole.parse();
        let expected = drain(&whole);
        assert_eq!(expected.len(), 4);

        for size in 1..=9 {
            let chunked = transport();
            let mut frames = Vec::new();
            for chunk in stream().chunks(size) {
                chunked.arena().feed(chunk);
                chunked.parse();
                frames.extend(drain(&chunked));
            }
            chunked.parse();
            frames.extend(drain(&chunked));
            assert_eq!(frames, expected, "chunk size {size}");
            assert!(chunked.arena().is_empty());
        }
    }

    #[test]
    fn receive_thread_and_parser_run_concurrently() {
        let whole = transport();
        whole.arena().feed(&stream());
        whole.parse();
        let expected = drain(&whole);

        let concurrent = transport();
        let producer_arena = Arc::clone(concurrent.arena());
        let producer = thread::spawn(move || {
            for chunk in stream().chunks(3) {
                producer_arena.feed(chunk);
                thread::sleep(Duration::from_micros(200));
            }
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut frames = Vec::new();
        while frames.len() < expected.len() && std::time::Instant::now() < deadline {
            concurrent.wait_for_frame(Duration::from_millis(5));
            concurrent.parse();
            frames.extend(drain(&concurrent));
        }
        producer.join().unwrap();
        concurrent.parse();
        frames.extend(drain(&concurrent));

        assert_eq!(frames, expected);
        assert!(concurrent.arena().is_empty());
    }

    #[test]
    fn incomplete_keeps_bytes_until_terminator() {
        let transport = transport();
        transport.arena().feed(b"AT+NSET=10.0.0.10\r\n");
        assert_eq!(transport.parse(), ParseOutcome::Incomplete { decoded: 0 });
        assert_eq!(transport.arena().len(), 19);
        assert_eq!(transport.state(), ReplyState::Incomplete);
        assert!(transport.waiting_for_reply());

        transport.arena().feed(b"\r\nOK\r\n");
        assert_eq!(transport.parse(), ParseOutcome::Complete { decoded: 1 });
        assert_eq!(
            drain(&transport),
            vec![Frame::Reply("AT+NSET=10.0.0.10\r\n\r\nOK\r\n".into())]
        );
        assert!(transport.arena().is_empty());
    }

    #[test]
    fn frames_before_incomplete_are_not_repeated() {
        let transport = transport();
        transport.arena().feed(b"AT\r\nOK\r\nAT+WM=0\r\n");
        assert_eq!(transport.parse(), ParseOutcome::Incomplete { decoded: 1 });
        transport.arena().feed(b"\r\nOK\r\n");
        assert_eq!(transport.parse(), ParseOutcome::Complete { decoded: 1 });
        assert_eq!(transport.pending_count(), 2);
    }

    #[test]
    fn locked_queue_is_left_alone() {
        let transport = transport();
        transport.arena().feed(b"AT\r\nOK\r\n");
        transport.parse();

        let pending = transport.read_all().unwrap();
        transport.arena().feed(b"AT+WM=0\r\nOK\r\n");
        assert_eq!(transport.parse(), ParseOutcome::Locked);
        assert_eq!(transport.read_all().err(), Some(TransportError::Locked));
        assert_eq!(transport.read().err(), Some(TransportError::Locked));
        assert_eq!(pending.frames().len(), 1);
        pending.release();

        assert_eq!(transport.pending_count(), 1);
        assert_eq!(transport.parse(), ParseOutcome::Complete { decoded: 1 });
        assert_eq!(transport.pending_count(), 2);
    }

    #[test]
    fn take_removes_only_the_chosen_frame() {
        let transport = transport();
        transport.arena().feed(b"AT\r\nOK\r\nAT+WM=0\r\nOK\r\nAT+WSEC=8\r\nOK\r\n");
        transport.parse();

        let pending = transport.read_all().unwrap();
        let index = pending
            .position(|frame| frame.text().starts_with("AT+WM"))
            .unwrap();
        let taken = pending.take(index).unwrap();
        assert_eq!(taken, Frame::Reply("AT+WM=0\r\nOK\r\n".into()));
        assert!(!transport.is_locked());
        assert_eq!(
            drain(&transport),
            vec![
                Frame::Reply("AT\r\nOK\r\n".into()),
                Frame::Reply("AT+WSEC=8\r\nOK\r\n".into()),
            ]
        );
    }

    #[test]
    fn dropped_guard_unlocks() {
        let transport = transport();
        drop(transport.read_all().unwrap());
        assert!(!transport.is_locked());
    }

    #[test]
    fn overflow_with_partial_frame_discards_buffer() {
        let transport = transport();
        transport
            .arena()
            .feed(&[b'x'; crate::arena::ARENA_CAPACITY - 4]);
        transport.arena().feed(b"more\r\n");
        assert!(transport.arena().overflowed());
        assert_eq!(transport.parse(), ParseOutcome::Complete { decoded: 0 });
        assert!(transport.arena().is_empty());

        transport.arena().feed(b"AT\r\nOK\r\n");
        transport.parse();
        assert_eq!(transport.pending_count(), 1);
    }

    #[test]
    fn write_appends_carriage_return() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Shared::default();
        let transport = SerialTransport::new(
            Arc::new(ReceiveArena::new()),
            Box::new(sink.clone()),
            Duration::ZERO,
        );
        transport.write("AT+WM=0").unwrap();
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"AT+WM=0\r");
        assert_eq!(transport.state(), ReplyState::MsgSent);
    }
}
