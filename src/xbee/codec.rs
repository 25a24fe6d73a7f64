//! XBee API mode 2 framing (escaped) for the radio serial link.
//!
//! Wire layout:
//!
//!   `START | LEN_MSB | LEN_LSB | API_ID | FRAME_ID | PAYLOAD.. | CHECKSUM`
//!
//! `LEN` counts API_ID, FRAME_ID and the payload. Every byte after START is
//! escaped when it collides with one of the reserved values. The decoder is
//! fed one byte at a time and never blocks, so it can sit directly behind the
//! serial read loop.

use thiserror::Error;

pub const START_BYTE: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
const ESCAPE_XOR: u8 = 0x20;

/// Largest frame-data section (FRAME_ID + payload) the decoder will buffer.
pub const DEFAULT_MAX_FRAME_DATA: usize = 110;

/// Decoder outcome codes, numbered as the radio firmware libraries number them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStatus {
    NoError,
    ChecksumFailure,
    PacketExceedsByteArrayLength,
    UnexpectedStartByte,
}

impl DecodeStatus {
    pub fn code(self) -> u8 {
        match self {
            DecodeStatus::NoError => 0,
            DecodeStatus::ChecksumFailure => 1,
            DecodeStatus::PacketExceedsByteArrayLength => 2,
            DecodeStatus::UnexpectedStartByte => 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload of {0} bytes does not fit a 16-bit frame length")]
    PayloadTooLarge(usize),
}

/// Outbound frame. Immutable once built; the checksum is derived on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub api_id: u8,
    pub frame_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(api_id: u8, frame_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            api_id,
            frame_id,
            payload: payload.into(),
        }
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.api_id, self.frame_id, &self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self.api_id, self.frame_id, &self.payload)
    }
}

/// `0xFF - (api_id + frame_id + sum(payload)) & 0xFF`
pub fn checksum(api_id: u8, frame_id: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(api_id.wrapping_add(frame_id), |acc, b| acc.wrapping_add(*b));
    0xFF - sum
}

fn needs_escape(b: u8) -> bool {
    matches!(b, START_BYTE | ESCAPE | XON | XOFF)
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    if needs_escape(b) {
        out.push(ESCAPE);
        out.push(b ^ ESCAPE_XOR);
    } else {
        out.push(b);
    }
}

/// Serialize one frame into its escaped wire form.
pub fn encode(api_id: u8, frame_id: u8, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = payload.len() + 2;
    if len > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    // Worst case every byte after START doubles.
    let mut out = Vec::with_capacity(1 + (len + 3) * 2);
    out.push(START_BYTE);
    push_escaped(&mut out, (len >> 8) as u8);
    push_escaped(&mut out, (len & 0xFF) as u8);
    push_escaped(&mut out, api_id);
    push_escaped(&mut out, frame_id);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    push_escaped(&mut out, checksum(api_id, frame_id, payload));
    Ok(out)
}

/// Frame assembled by the decoder. `frame_data` is everything between API_ID
/// and CHECKSUM (FRAME_ID first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub api_id: u8,
    pub frame_data: Vec<u8>,
    pub checksum: u8,
    pub status: DecodeStatus,
    pub available: bool,
}

impl ResponseFrame {
    pub fn frame_id(&self) -> u8 {
        self.frame_data.first().copied().unwrap_or(0)
    }

    pub fn payload(&self) -> &[u8] {
        self.frame_data.get(1..).unwrap_or(&[])
    }

    pub fn is_ok(&self) -> bool {
        self.status == DecodeStatus::NoError
    }
}

/// What a single pushed byte produced, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A complete frame (valid, checksum failure, or aborted by a new START).
    Frame(ResponseFrame),
    /// A frame that cannot be represented; nothing is reported upstream.
    Dropped { status: DecodeStatus, declared_len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitStart,
    LenMsb,
    LenLsb,
    ApiId,
    Body,
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    escape: bool,
    declared_len: usize,
    api_id: u8,
    body: Vec<u8>,
    checksum_total: u8,
    max_frame_data: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_DATA)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_data: usize) -> Self {
        Self {
            state: State::AwaitStart,
            escape: false,
            declared_len: 0,
            api_id: 0,
            body: Vec::with_capacity(max_frame_data),
            checksum_total: 0,
            max_frame_data,
        }
    }

    pub fn max_frame_data(&self) -> usize {
        self.max_frame_data
    }

    /// True while a frame is partially assembled.
    pub fn in_frame(&self) -> bool {
        self.state != State::AwaitStart
    }

    fn reset(&mut self) {
        self.state = State::AwaitStart;
        self.escape = false;
        self.declared_len = 0;
        self.api_id = 0;
        self.body.clear();
        self.checksum_total = 0;
    }

    /// Feed exactly one byte from the wire.
    pub fn push(&mut self, byte: u8) -> Option<DecodeEvent> {
        let mut b = byte;

        if self.in_frame() {
            if self.escape {
                self.escape = false;
                b ^= ESCAPE_XOR;
            } else if b == START_BYTE {
                let aborted = ResponseFrame {
                    api_id: self.api_id,
                    frame_data: std::mem::take(&mut self.body),
                    checksum: 0,
                    status: DecodeStatus::UnexpectedStartByte,
                    available: false,
                };
                self.reset();
                // The START opens the next frame.
                self.state = State::LenMsb;
                return Some(DecodeEvent::Frame(aborted));
            } else if b == ESCAPE {
                self.escape = true;
                return None;
            }
        }

        match self.state {
            State::AwaitStart => {
                if b == START_BYTE {
                    self.state = State::LenMsb;
                }
                None
            }
            State::LenMsb => {
                self.declared_len = (b as usize) << 8;
                self.state = State::LenLsb;
                None
            }
            State::LenLsb => {
                self.declared_len |= b as usize;
                let declared_len = self.declared_len;
                if declared_len == 0 {
                    self.reset();
                    return Some(DecodeEvent::Dropped {
                        status: DecodeStatus::PacketExceedsByteArrayLength,
                        declared_len,
                    });
                }
                if declared_len - 1 > self.max_frame_data {
                    self.reset();
                    return Some(DecodeEvent::Dropped {
                        status: DecodeStatus::PacketExceedsByteArrayLength,
                        declared_len,
                    });
                }
                self.state = State::ApiId;
                None
            }
            State::ApiId => {
                self.api_id = b;
                self.checksum_total = b;
                self.state = State::Body;
                None
            }
            State::Body => {
                self.checksum_total = self.checksum_total.wrapping_add(b);
                if self.body.len() + 1 < self.declared_len {
                    self.body.push(b);
                    return None;
                }
                // This byte is the checksum.
                let status = if self.checksum_total == 0xFF {
                    DecodeStatus::NoError
                } else {
                    DecodeStatus::ChecksumFailure
                };
                let frame = ResponseFrame {
                    api_id: self.api_id,
                    frame_data: std::mem::take(&mut self.body),
                    checksum: b,
                    status,
                    available: status == DecodeStatus::NoError,
                };
                self.reset();
                Some(DecodeEvent::Frame(frame))
            }
        }
    }

    /// Convenience for feeding a buffer; collects every event produced.
    pub fn push_slice(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }
}
