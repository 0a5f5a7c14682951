//! Upstream stream reassembly
//!
//! Bytes read from an upstream connection are either control-protocol text
//! (recognised by the [`CONTROL_MARKER`] prefix) or binary frames:
//!
//! ```text
//! +----------+----------+----------------------+
//! | reserved | length   | body (length bytes)  |
//! | 2 bytes  | u16 BE   |                      |
//! +----------+----------+----------------------+
//! ```
//!
//! Frames may be split across reads or packed several to a read. A
//! [`Reassembler`] holds at most one partially received unit and emits each
//! frame once all of its declared bytes have arrived.
//!
//! Control text carries no length prefix. It is relayed as it arrives, one
//! unit per read, and the reassembler stays in text mode until the header
//! terminator and any `Content-Length` body have passed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{CONTROL_MARKER, FRAME_HEADER_SIZE};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Control header size past which continuation tracking is abandoned
const MAX_CONTROL_HEAD: usize = 64 * 1024;

/// A completed upstream unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Control-protocol text, passed through unmodified
    Control(Bytes),
    /// A whole binary frame, header included
    Frame(Bytes),
}

impl Unit {
    pub fn len(&self) -> usize {
        match self {
            Unit::Control(b) | Unit::Frame(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    /// Start of a unit too short to classify or to read the length from
    Head(BytesMut),
    /// Binary frame with a known total size
    Body { buf: BytesMut, expected: usize },
    /// Control text whose header block has not ended yet
    ControlHead(BytesMut),
    /// Control body bytes still to come
    ControlBody(usize),
}

/// Per-channel reassembly state
#[derive(Debug, Default)]
pub struct Reassembler {
    state: State,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream read
    ///
    /// The returned iterator yields every unit completed by `chunk`. Drain it
    /// fully; bytes it has not reached when dropped are never processed.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Units<'a> {
        Units {
            reassembler: self,
            input: chunk,
        }
    }

    /// Whether a unit is partially received
    pub fn has_pending(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Number of bytes held for the partial unit
    pub fn pending_len(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Head(head) => head.len(),
            State::Body { buf, .. } => buf.len(),
            State::ControlHead(header) => header.len(),
            State::ControlBody(_) => 0,
        }
    }

    /// Drop any partial unit, returning how many bytes were held
    pub fn discard(&mut self) -> usize {
        let held = self.pending_len();
        self.state = State::Idle;
        held
    }

    fn next_unit(&mut self, input: &mut &[u8]) -> Option<Unit> {
        loop {
            match std::mem::take(&mut self.state) {
                State::Body { mut buf, expected } => {
                    let take = (expected - buf.len()).min(input.len());
                    buf.put_slice(&input[..take]);
                    *input = &input[take..];

                    if buf.len() == expected {
                        return Some(Unit::Frame(buf.freeze()));
                    }
                    self.state = State::Body { buf, expected };
                    return None;
                }
                State::ControlHead(header) => {
                    if input.is_empty() {
                        self.state = State::ControlHead(header);
                        return None;
                    }
                    return Some(self.control_head(BytesMut::new(), header, input));
                }
                State::ControlBody(remaining) => {
                    if input.is_empty() {
                        self.state = State::ControlBody(remaining);
                        return None;
                    }
                    return Some(self.control_body(BytesMut::new(), remaining, input));
                }
                State::Head(head) => {
                    if input.is_empty() {
                        self.state = State::Head(head);
                        return None;
                    }
                    if let Some(unit) = self.start_unit(head, input) {
                        return Some(unit);
                    }
                }
                State::Idle => {
                    if input.is_empty() {
                        return None;
                    }
                    if let Some(unit) = self.start_unit(BytesMut::new(), input) {
                        return Some(unit);
                    }
                }
            }
        }
    }

    /// Classify the start of a unit made of `head` followed by `input`
    fn start_unit(&mut self, mut head: BytesMut, input: &mut &[u8]) -> Option<Unit> {
        let mut prefix = [0u8; 8];
        let prefix_len = (head.len() + input.len()).min(CONTROL_MARKER.len());
        let from_head = head.len().min(prefix_len);
        prefix[..from_head].copy_from_slice(&head[..from_head]);
        prefix[from_head..prefix_len].copy_from_slice(&input[..prefix_len - from_head]);
        let prefix = &prefix[..prefix_len];

        if prefix == CONTROL_MARKER {
            return Some(self.control_head(head.clone(), head, input));
        }

        if prefix.len() < CONTROL_MARKER.len() && CONTROL_MARKER.starts_with(prefix) {
            head.put_slice(input);
            *input = &[];
            self.state = State::Head(head);
            return None;
        }

        let need = FRAME_HEADER_SIZE.saturating_sub(head.len());
        if input.len() < need {
            head.put_slice(input);
            *input = &[];
            self.state = State::Head(head);
            return None;
        }
        head.put_slice(&input[..need]);
        *input = &input[need..];

        let declared = u16::from_be_bytes([head[2], head[3]]) as usize;
        let expected = FRAME_HEADER_SIZE + declared;

        let mut buf = BytesMut::with_capacity(expected);
        buf.put_slice(&head);
        self.state = State::Body { buf, expected };
        None
    }

    /// Relay control header bytes from `input`
    ///
    /// `header` holds every header byte seen so far, including any already
    /// placed in `unit`.
    fn control_head(
        &mut self,
        mut unit: BytesMut,
        mut header: BytesMut,
        input: &mut &[u8],
    ) -> Unit {
        let scan_from = header.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        let before = header.len();
        header.put_slice(input);

        let Some(pos) = find_terminator(&header[scan_from..]) else {
            unit.put_slice(input);
            *input = &[];
            if header.len() <= MAX_CONTROL_HEAD {
                self.state = State::ControlHead(header);
            }
            return Unit::Control(unit.freeze());
        };

        let end = scan_from + pos + HEADER_TERMINATOR.len();
        let from_input = end - before;
        unit.put_slice(&input[..from_input]);
        *input = &input[from_input..];
        self.control_body(unit, content_length(&header[..end]), input)
    }

    fn control_body(&mut self, mut unit: BytesMut, remaining: usize, input: &mut &[u8]) -> Unit {
        let take = remaining.min(input.len());
        unit.put_slice(&input[..take]);
        *input = &input[take..];
        if take < remaining {
            self.state = State::ControlBody(remaining - take);
        }
        Unit::Control(unit.freeze())
    }
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// `Content-Length` of a control header block, 0 when absent or invalid
fn content_length(header: &[u8]) -> usize {
    header
        .split(|&b| b == b'\n')
        .rev()
        .find_map(|line| {
            let colon = line.iter().position(|&b| b == b':')?;
            let name = std::str::from_utf8(&line[..colon]).ok()?;
            if !name.trim().eq_ignore_ascii_case("content-length") {
                return None;
            }
            std::str::from_utf8(&line[colon + 1..]).ok()?.trim().parse().ok()
        })
        .unwrap_or(0)
}

/// Units completed by one [`Reassembler::feed`] call
#[must_use = "units are only produced while the iterator is drained"]
pub struct Units<'a> {
    reassembler: &'a mut Reassembler,
    input: &'a [u8],
}

impl Iterator for Units<'_> {
    type Item = Unit;

    fn next(&mut self) -> Option<Unit> {
        self.reassembler.next_unit(&mut self.input)
    }
}
