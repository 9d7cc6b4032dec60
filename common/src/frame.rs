//! Framing grammar for the byte stream coming out of the modem UART.
//!
//! Two kinds of frames share the stream: AT text replies that end with one of
//! a fixed set of terminators, and escape delimited data frames of the form
//! `ESC <type> ... ESC <type>`.

use std::borrow::Cow;

pub const ESC: u8 = 0x1b;

/// The modem emits this after some echoes; it carries no reply.
pub const IDLE_SEQUENCE: &[u8] = b"\r\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    BlankLine,
    Error,
    Ok,
    InvalidCid,
    InvalidInput,
    Disconnect0,
    Disconnect1,
    BatteryBanner,
}

impl Terminator {
    pub const ALL: [Terminator; 8] = [
        Terminator::BlankLine,
        Terminator::Error,
        Terminator::Ok,
        Terminator::InvalidCid,
        Terminator::InvalidInput,
        Terminator::Disconnect0,
        Terminator::Disconnect1,
        Terminator::BatteryBanner,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::BlankLine => b"\r\n\n\r\n",
            Self::Error => b"\r\nERROR\r\n",
            Self::Ok => b"\r\nOK\r\n",
            Self::InvalidCid => b"\r\nERROR: INVALID CID\r\n",
            Self::InvalidInput => b"\r\nERROR: INVALID INPUT\r\n",
            Self::Disconnect0 => b"DISCONNECT 0\r\n",
            Self::Disconnect1 => b"DISCONNECT 1\r\n",
            Self::BatteryBanner => b"Battery)\r\n\r\n",
        }
    }

    pub fn as_str(self) -> &'static str {
        // Every terminator is ASCII.
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }
}

pub const OK_TERMINATOR: &str = "\r\nOK\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// AT reply, terminator included.
    Reply(String),
    /// Escape data frame, both delimiters included.
    Data(Vec<u8>),
}

impl Frame {
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::Reply(text) => Cow::Borrowed(text.as_str()),
            Self::Data(bytes) => String::from_utf8_lossy(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Every byte was accounted for.
    Complete,
    /// The tail holds a partial frame starting at `Scan::next`.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub frames: Vec<Frame>,
    pub next: usize,
    pub status: ScanStatus,
}

/// Earliest terminator in `bytes`; on a tie the first in `Terminator::ALL` wins.
pub fn find_terminator(bytes: &[u8]) -> Option<(usize, Terminator)> {
    let mut best: Option<(usize, Terminator)> = None;
    for terminator in Terminator::ALL {
        let Some(index) = find(bytes, terminator.as_bytes()) else {
            continue;
        };
        if best.map_or(true, |(current, _)| index < current) {
            best = Some((index, terminator));
        }
    }
    best
}

pub fn scan(bytes: &[u8], from: usize) -> Scan {
    let mut frames = Vec::new();
    let mut offset = from.min(bytes.len());

    while offset < bytes.len() {
        let rest = &bytes[offset..];

        if rest[0] == ESC {
            // The closing delimiter sits at least two bytes in and is followed
            // by its type byte.
            let closing = rest
                .get(2..)
                .and_then(|tail| tail.iter().position(|&b| b == ESC))
                .map(|index| index + 2);
            match closing {
                Some(end) if end + 1 < rest.len() => {
                    frames.push(Frame::Data(rest[..end + 2].to_vec()));
                    offset += end + 2;
                }
                _ => {
                    return Scan {
                        frames,
                        next: offset,
                        status: ScanStatus::Incomplete,
                    }
                }
            }
            continue;
        }

        match find_terminator(rest) {
            Some((0, terminator)) => {
                offset += terminator.as_bytes().len();
            }
            Some((index, terminator)) => {
                let end = index + terminator.as_bytes().len();
                frames.push(Frame::Reply(
                    String::from_utf8_lossy(&rest[..end]).into_owned(),
                ));
                offset += end;
            }
            None if rest == IDLE_SEQUENCE => {
                offset = bytes.len();
            }
            None => {
                return Scan {
                    frames,
                    next: offset,
                    status: ScanStatus::Incomplete,
                }
            }
        }
    }

    Scan {
        frames,
        next: offset,
        status: ScanStatus::Complete,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reply(text: &str) -> Frame {
        Frame::Reply(text.to_string())
    }

    #[test]
    fn splits_replies_on_earliest_terminator() {
        let scan = scan(b"AT\r\r\n\r\nOK\r\nAT+X\r\nERROR\r\n", 0);
        assert_eq!(scan.status, ScanStatus::Complete);
        assert_eq!(
            scan.frames,
            vec![reply("AT\r\r\n\r\nOK\r\n"), reply("AT+X\r\nERROR\r\n")]
        );
    }

    #[test]
    fn longer_error_variant_is_not_cut_short() {
        let scan = scan(b"AT+HTTPCLOSE=3\r\nERROR: INVALID CID\r\n", 0);
        assert_eq!(
            scan.frames,
            vec![reply("AT+HTTPCLOSE=3\r\nERROR: INVALID CID\r\n")]
        );
    }

    #[test]
    fn bare_terminator_emits_nothing() {
        let scan = scan(b"\r\nERROR\r\nDISCONNECT 1\r\n", 0);
        assert_eq!(scan.status, ScanStatus::Complete);
        assert!(scan.frames.is_empty());
    }

    #[test]
    fn idle_sequence_is_discarded() {
        let scan = scan(b"AT\r\nOK\r\n\r\r\n", 0);
        assert_eq!(scan.status, ScanStatus::Complete);
        assert_eq!(scan.frames, vec![reply("AT\r\nOK\r\n")]);
        assert_eq!(scan.next, 11);
    }

    #[test]
    fn unterminated_text_is_incomplete() {
        let scan = scan(b"AT\r\nOK\r\nAT+WS\r\r\n", 0);
        assert_eq!(scan.status, ScanStatus::Incomplete);
        assert_eq!(scan.frames, vec![reply("AT\r\nOK\r\n")]);
        assert_eq!(scan.next, 8);
    }

    #[test]
    fn data_frame_keeps_closing_type_byte() {
        let mut bytes = vec![ESC, b'S', b'0', b'h', b'i', ESC, b'E'];
        bytes.extend_from_slice(b"AT\r\nOK\r\n");
        let scan = scan(&bytes, 0);
        assert_eq!(scan.status, ScanStatus::Complete);
        assert_eq!(
            scan.frames,
            vec![
                Frame::Data(vec![ESC, b'S', b'0', b'h', b'i', ESC, b'E']),
                reply("AT\r\nOK\r\n"),
            ]
        );
    }

    #[test]
    fn data_frame_without_trailer_is_incomplete() {
        let scan = scan(&[ESC, b'S', b'0', ESC], 0);
        assert_eq!(scan.status, ScanStatus::Incomplete);
        assert_eq!(scan.next, 0);
        assert!(scan.frames.is_empty());
    }

    #[test]
    fn escape_right_after_opener_does_not_close() {
        let scan = scan(&[ESC, ESC, b'x', b'y'], 0);
        assert_eq!(scan.status, ScanStatus::Incomplete);
    }

    #[test]
    fn resumes_from_offset() {
        let bytes = b"AT\r\nOK\r\nAT+WA=x,,\r\nOK\r\n";
        let scan = scan(bytes, 8);
        assert_eq!(scan.frames, vec![reply("AT+WA=x,,\r\nOK\r\n")]);
    }

    #[test]
    fn terminator_tie_breaks_by_table_order() {
        assert_eq!(
            find_terminator(b"x\r\nOK\r\n"),
            Some((1, Terminator::Ok))
        );
        assert_eq!(find_terminator(b"nothing here"), None);
        assert_eq!(Terminator::InvalidCid.as_str(), "\r\nERROR: INVALID CID\r\n");
    }
}
