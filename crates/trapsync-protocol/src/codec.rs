//! Escaped, length-agnostic framing.
//!
//! A message on the wire looks like this:
//!
//! ```text
//! escape(id) SEP escape(code) [SEP escape(field)]* END [END padding]*
//! ```
//!
//! No length prefix is sent; boundaries are found by scanning for
//! unescaped control bytes. Frames are not aligned to read calls, so the
//! parser keeps whatever follows an `END` in a carry buffer for the next
//! frame. When the sender's queue runs dry it pads the stream with `END`
//! bytes up to the next 256-byte boundary so the receiver's fixed-size
//! reads never stall on a half-filled chunk.

use std::mem;

use trapsync_transport::Connection;

use crate::types::{CHUNK_SIZE, Code, END, ESCAPE, MessageId, SEPARATOR, is_control};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Prefixes every control byte in `data` with `ESCAPE`.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if is_control(b) {
            out.push(ESCAPE);
        }
        out.push(b);
    }
    out
}

/// Reverses [`escape`].
///
/// An `ESCAPE` followed by a non-control byte is kept as a literal
/// `ESCAPE`; a trailing lone `ESCAPE` is kept too.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.peek() {
            Some(&next) if is_control(next) => {
                out.push(next);
                iter.next();
            }
            _ => out.push(ESCAPE),
        }
    }
    out
}

/// Escapes each field and joins them with single `SEPARATOR` bytes.
pub fn combine<F: AsRef<[u8]>>(fields: &[F]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(&escape(field.as_ref()));
    }
    out
}

/// Frames one message.
///
/// With no data fields the header is followed directly by `END`, so an
/// empty field list and a single empty field stay distinguishable.
pub fn pack<F: AsRef<[u8]>>(id: MessageId, code: Code, fields: &[F]) -> Vec<u8> {
    let mut out = escape(&[id.0]);
    out.push(SEPARATOR);
    out.extend_from_slice(&escape(&[code.as_u8()]));
    if !fields.is_empty() {
        out.push(SEPARATOR);
        out.extend_from_slice(&combine(fields));
    }
    out.push(END);
    out
}

/// Number of filler bytes that bring `sent` up to a chunk boundary.
pub fn fill_len(sent: usize) -> usize {
    (CHUNK_SIZE - sent % CHUNK_SIZE) % CHUNK_SIZE
}

/// Appends `fill` bytes so that `offset + data.len()` lands on a chunk
/// boundary. `offset` is how much of the stream was written before
/// `data`.
pub fn pad(data: &mut Vec<u8>, offset: usize, fill: u8) {
    let n = fill_len(offset + data.len());
    data.resize(data.len() + n, fill);
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: MessageId,
    pub code: Code,
    /// Unescaped data fields, header excluded.
    pub fields: Vec<Vec<u8>>,
    /// Raw bytes the message occupied on the wire, without padding.
    pub len: usize,
}

impl Frame {
    /// Splits the 1-byte id and code header off a parsed field list.
    pub fn from_fields(mut fields: Vec<Vec<u8>>, len: usize) -> Result<Self, ProtocolError> {
        if fields.len() < 2 {
            return Err(ProtocolError::InvalidHeader(format!(
                "expected id and code, got {} field(s)",
                fields.len()
            )));
        }
        let data = fields.split_off(2);
        let (id, code) = match (fields[0].as_slice(), fields[1].as_slice()) {
            ([id], [code]) => (MessageId(*id), Code::try_from(*code)?),
            (id, code) => {
                return Err(ProtocolError::InvalidHeader(format!(
                    "id is {} byte(s), code is {} byte(s)",
                    id.len(),
                    code.len()
                )));
            }
        };
        Ok(Self {
            id,
            code,
            fields: data,
            len,
        })
    }
}

// ---------------------------------------------------------------------------
// FrameParser
// ---------------------------------------------------------------------------

/// Incremental parser with carry-over between reads.
///
/// The parser counts the raw bytes of the message in progress. Once that
/// exceeds `max_frame_len` it returns [`ProtocolError::FrameTooLong`],
/// drops what it collected and skips input up to the next `END`, after
/// which parsing resumes normally. The connection stays usable.
#[derive(Debug)]
pub struct FrameParser {
    carry: Vec<u8>,
    fields: Vec<Vec<u8>>,
    field: Vec<u8>,
    escaped: bool,
    frame_len: usize,
    max_frame_len: usize,
    discarding: bool,
    received: u64,
}

impl FrameParser {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            carry: Vec::new(),
            fields: Vec::new(),
            field: Vec::new(),
            escaped: false,
            frame_len: 0,
            max_frame_len,
            discarding: false,
            received: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn set_max_frame_len(&mut self, len: usize) {
        self.max_frame_len = len;
    }

    /// Bytes read past the last returned frame, waiting for the next call.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Total bytes pulled from the connection so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Scans `data` for the next complete frame.
    ///
    /// On `END` the frame is returned and every byte after it (minus
    /// directly following padding) goes to the carry buffer. Returns
    /// `Ok(None)` when `data` ran out mid-frame; the partial state is kept.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            i += 1;

            if self.discarding {
                if self.escaped {
                    self.escaped = false;
                } else if b == ESCAPE {
                    self.escaped = true;
                } else if b == END {
                    self.discarding = false;
                }
                continue;
            }

            let terminal = !self.escaped && b == END;
            if terminal && self.frame_len == 0 {
                // Padding between frames.
                continue;
            }

            if !terminal {
                self.frame_len += 1;
                if self.frame_len > self.max_frame_len {
                    let limit = self.max_frame_len;
                    let (id, code) = self.header();
                    let opens_escape = !self.escaped && b == ESCAPE;
                    self.reset_frame();
                    self.escaped = opens_escape;
                    self.discarding = true;
                    self.carry.extend_from_slice(&data[i..]);
                    return Err(ProtocolError::FrameTooLong { id, code, limit });
                }
            }

            if self.escaped {
                self.escaped = false;
                if !is_control(b) {
                    self.field.push(ESCAPE);
                }
                self.field.push(b);
                continue;
            }

            match b {
                ESCAPE => self.escaped = true,
                SEPARATOR => {
                    let field = mem::take(&mut self.field);
                    self.fields.push(field);
                }
                END => {
                    let field = mem::take(&mut self.field);
                    self.fields.push(field);
                    while i < data.len() && data[i] == END {
                        i += 1;
                    }
                    self.carry.extend_from_slice(&data[i..]);

                    let len = self.frame_len;
                    let fields = mem::take(&mut self.fields);
                    self.frame_len = 0;
                    return Frame::from_fields(fields, len).map(Some);
                }
                _ => self.field.push(b),
            }
        }
        Ok(None)
    }

    /// Id and code of the frame in progress, as far as they are parsed.
    fn header(&self) -> (Option<MessageId>, Option<Code>) {
        let byte = |i: usize| match self.fields.get(i).map(Vec::as_slice) {
            Some([b]) => Some(*b),
            _ => None,
        };
        let id = byte(0).map(MessageId);
        let code = byte(1).and_then(|c| Code::try_from(c).ok());
        (id, code)
    }

    /// Reads from `conn` until one complete frame is available.
    ///
    /// The carry buffer is consumed before the connection is touched.
    /// Reads are at most [`CHUNK_SIZE`] bytes.
    ///
    /// # Errors
    /// - [`ProtocolError::EofReached`] when the stream ends
    /// - [`ProtocolError::Transport`] on I/O failure
    /// - [`ProtocolError::FrameTooLong`], [`ProtocolError::InvalidHeader`]
    ///   or [`ProtocolError::UnknownCode`] for one bad message; the next
    ///   call continues with the following message
    pub async fn read_frame<C: Connection>(&mut self, conn: &C) -> Result<Frame, ProtocolError> {
        loop {
            if !self.carry.is_empty() {
                let pending = mem::take(&mut self.carry);
                if let Some(frame) = self.feed(&pending)? {
                    return Ok(frame);
                }
                continue;
            }

            let chunk = conn
                .recv(CHUNK_SIZE)
                .await?
                .ok_or(ProtocolError::EofReached)?;
            self.received += chunk.len() as u64;
            if let Some(frame) = self.feed(&chunk)? {
                return Ok(frame);
            }
        }
    }

    fn reset_frame(&mut self) {
        self.fields.clear();
        self.field.clear();
        self.frame_len = 0;
        self.escaped = false;
    }
}

// =========================================================================
// Tests
// =========================================================================
