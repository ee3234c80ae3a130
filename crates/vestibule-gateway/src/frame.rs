//! Passive WebSocket frame boundary tracking.
//!
//! The tunnel never decodes payloads, but it needs two facts about the byte
//! streams it splices: whether the client sent a pong, and where a frame
//! ends so a ping can be injected without corrupting the stream. Both come
//! from walking frame headers (RFC 6455 §5.2) and skipping payload bytes.

/// Unmasked ping with an empty payload, as sent to the client.
pub const PING_FRAME: [u8; 2] = [0x89, 0x00];

const OPCODE_PONG: u8 = 0xA;
const MAX_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy)]
enum State {
    Header {
        buf: [u8; MAX_HEADER_LEN],
        filled: usize,
    },
    Payload {
        remaining: u64,
    },
}

impl State {
    const BOUNDARY: Self = Self::Header {
        buf: [0; MAX_HEADER_LEN],
        filled: 0,
    };
}

/// What a call to [`FrameScanner::feed`] found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// A pong frame header completed inside the chunk.
    pub pong_seen: bool,
    /// Smallest `i > 0` such that `chunk[..i]` ends exactly on a frame boundary.
    pub first_boundary: Option<usize>,
}

/// Tracks frame boundaries across arbitrarily split chunks of one direction
/// of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    state: State,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    /// A scanner positioned at the start of a stream.
    pub fn new() -> Self {
        Self {
            state: State::BOUNDARY,
        }
    }

    /// True when the bytes seen so far end exactly between two frames.
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, State::Header { filled: 0, .. })
    }

    /// Consume the next chunk of the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> ScanReport {
        let mut report = ScanReport::default();
        let mut pos = 0;

        while pos < chunk.len() {
            match &mut self.state {
                State::Payload { remaining } => {
                    let available = (chunk.len() - pos) as u64;
                    let take = (*remaining).min(available);
                    pos += take as usize;
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = State::BOUNDARY;
                    }
                }
                State::Header { buf, filled } => {
                    buf[*filled] = chunk[pos];
                    *filled += 1;
                    pos += 1;

                    if *filled < 2 || *filled < header_len(buf[1]) {
                        continue;
                    }

                    let opcode = buf[0] & 0x0F;
                    let payload = payload_len(buf);
                    if opcode == OPCODE_PONG {
                        report.pong_seen = true;
                    }
                    self.state = if payload == 0 {
                        State::BOUNDARY
                    } else {
                        State::Payload { remaining: payload }
                    };
                }
            }

            if report.first_boundary.is_none() && self.at_boundary() {
                report.first_boundary = Some(pos);
            }
        }

        report
    }
}

/// Header length implied by the second header byte.
fn header_len(second: u8) -> usize {
    let extended = match second & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if second & 0x80 != 0 { 4 } else { 0 };
    2 + extended + mask
}

fn payload_len(buf: &[u8; MAX_HEADER_LEN]) -> u64 {
    match buf[1] & 0x7F {
        126 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
        127 => u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]),
        len => u64::from(len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: u8, payload: &[u8], masked: bool) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        let mask_bit = if masked { 0x80 } else { 0 };
        match payload.len() {
            n if n < 126 => out.push(mask_bit | n as u8),
            n if n <= u16::MAX as usize => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        if masked {
            out.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        }
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_detects_masked_pong() {
        let mut scanner = FrameScanner::new();
        let report = scanner.feed(&frame(0xA, b"", true));
        assert!(report.pong_seen);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_pong_byte_inside_payload_is_not_a_pong() {
        let mut scanner = FrameScanner::new();
        let report = scanner.feed(&frame(0x2, &[0x8A, 0x80, 0x8A, 0x00], true));
        assert!(!report.pong_seen);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_header_split_across_chunks() {
        let bytes = frame(0xA, b"hi", true);
        let mut scanner = FrameScanner::new();
        let first = scanner.feed(&bytes[..1]);
        assert!(!first.pong_seen);
        assert!(!scanner.at_boundary());

        let second = scanner.feed(&bytes[1..4]);
        assert!(!second.pong_seen);

        let third = scanner.feed(&bytes[4..]);
        assert!(third.pong_seen);
        assert_eq!(third.first_boundary, Some(bytes.len() - 4));
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_extended_lengths() {
        let medium = frame(0x1, &vec![b'a'; 300], false);
        let large = frame(0x2, &vec![0u8; 70_000], false);
        let mut scanner = FrameScanner::new();

        let report = scanner.feed(&medium[..200]);
        assert_eq!(report.first_boundary, None);
        let report = scanner.feed(&medium[200..]);
        assert_eq!(report.first_boundary, Some(medium.len() - 200));

        for chunk in large.chunks(16 * 1024) {
            scanner.feed(chunk);
        }
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_first_boundary_in_multi_frame_chunk() {
        let mut bytes = frame(0x1, b"hello", false);
        let first_len = bytes.len();
        bytes.extend(frame(0x1, b"world", false));

        let mut scanner = FrameScanner::new();
        let report = scanner.feed(&bytes);
        assert_eq!(report.first_boundary, Some(first_len));
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_empty_chunk_reports_nothing() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.feed(&[]), ScanReport::default());
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_ping_frame_parses_as_complete() {
        let mut scanner = FrameScanner::new();
        let report = scanner.feed(&PING_FRAME);
        assert!(!report.pong_seen);
        assert_eq!(report.first_boundary, Some(2));
    }
}
