//! Application messages carried as RF data. First byte is the tag; multi-byte
//! fields are big-endian.

use bytes::{Buf, BufMut};
use thiserror::Error;

pub mod tag {
    pub const HELLO: u8 = 0x01;
    pub const WRITE_REQUEST: u8 = 0x02;
    pub const WRITE_DATA: u8 = 0x03;
    pub const WRITE_DONE: u8 = 0x04;
    pub const WRITE_REQUEST_ACK: u8 = 0x13;
    pub const WRITE_DATA_ACK: u8 = 0x14;
    pub const WRITE_DONE_ACK: u8 = 0x15;
    pub const WRITE_RESEND: u8 = 0x16;
    pub const COMMAND: u8 = 0x17;
}

/// Tag + request id + sequence.
pub const WRITE_DATA_HEADER_LEN: usize = 1 + 1 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("message 0x{tag:02x} truncated: {len} bytes, need {need}")]
    Truncated { tag: u8, len: usize, need: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { text: String },
    WriteRequest { request_id: u8, total_length: u32, chunk_count: u32 },
    WriteData { request_id: u8, sequence: u32, chunk: Vec<u8> },
    WriteDone { request_id: u8, total_length: u32, chunk_count: u32 },
    WriteRequestAck { request_id: u8, total_length: u32 },
    WriteDataAck { request_id: u8, sequence: u32 },
    WriteDoneAck { request_id: u8 },
    WriteResend { request_id: u8, sequence: u32 },
    Command(u8),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Hello { .. } => tag::HELLO,
            Message::WriteRequest { .. } => tag::WRITE_REQUEST,
            Message::WriteData { .. } => tag::WRITE_DATA,
            Message::WriteDone { .. } => tag::WRITE_DONE,
            Message::WriteRequestAck { .. } => tag::WRITE_REQUEST_ACK,
            Message::WriteDataAck { .. } => tag::WRITE_DATA_ACK,
            Message::WriteDoneAck { .. } => tag::WRITE_DONE_ACK,
            Message::WriteResend { .. } => tag::WRITE_RESEND,
            Message::Command(_) => tag::COMMAND,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.put_u8(self.tag());
        match self {
            Message::Hello { text } => out.put_slice(text.as_bytes()),
            Message::WriteRequest {
                request_id,
                total_length,
                chunk_count,
            }
            | Message::WriteDone {
                request_id,
                total_length,
                chunk_count,
            } => {
                out.put_u8(*request_id);
                out.put_u32(*total_length);
                out.put_u32(*chunk_count);
            }
            Message::WriteData {
                request_id,
                sequence,
                chunk,
            } => {
                out.put_u8(*request_id);
                out.put_u32(*sequence);
                out.put_slice(chunk);
            }
            Message::WriteRequestAck {
                request_id,
                total_length,
            } => {
                out.put_u8(*request_id);
                out.put_u32(*total_length);
            }
            Message::WriteDataAck {
                request_id,
                sequence,
            }
            | Message::WriteResend {
                request_id,
                sequence,
            } => {
                out.put_u8(*request_id);
                out.put_u32(*sequence);
            }
            Message::WriteDoneAck { request_id } => out.put_u8(*request_id),
            Message::Command(cmd) => out.put_u8(*cmd),
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, MessageError> {
        let (&t, mut rest) = data.split_first().ok_or(MessageError::Empty)?;
        let need = |n: usize| -> Result<(), MessageError> {
            if data.len() < n + 1 {
                Err(MessageError::Truncated {
                    tag: t,
                    len: data.len(),
                    need: n + 1,
                })
            } else {
                Ok(())
            }
        };
        let msg = match t {
            tag::HELLO => Message::Hello {
                text: String::from_utf8_lossy(rest).into_owned(),
            },
            tag::WRITE_REQUEST | tag::WRITE_DONE => {
                need(9)?;
                let request_id = rest.get_u8();
                let total_length = rest.get_u32();
                let chunk_count = rest.get_u32();
                if t == tag::WRITE_REQUEST {
                    Message::WriteRequest {
                        request_id,
                        total_length,
                        chunk_count,
                    }
                } else {
                    Message::WriteDone {
                        request_id,
                        total_length,
                        chunk_count,
                    }
                }
            }
            tag::WRITE_DATA => {
                need(5)?;
                let request_id = rest.get_u8();
                let sequence = rest.get_u32();
                Message::WriteData {
                    request_id,
                    sequence,
                    chunk: rest.to_vec(),
                }
            }
            tag::WRITE_REQUEST_ACK => {
                need(5)?;
                Message::WriteRequestAck {
                    request_id: rest.get_u8(),
                    total_length: rest.get_u32(),
                }
            }
            tag::WRITE_DATA_ACK | tag::WRITE_RESEND => {
                need(5)?;
                let request_id = rest.get_u8();
                let sequence = rest.get_u32();
                if t == tag::WRITE_DATA_ACK {
                    Message::WriteDataAck {
                        request_id,
                        sequence,
                    }
                } else {
                    Message::WriteResend {
                        request_id,
                        sequence,
                    }
                }
            }
            tag::WRITE_DONE_ACK => {
                need(1)?;
                Message::WriteDoneAck {
                    request_id: rest.get_u8(),
                }
            }
            tag::COMMAND => {
                need(1)?;
                Message::Command(rest.get_u8())
            }
            other => return Err(MessageError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

/// WRITE_DATA payload straight from a borrowed chunk, without building a
/// [`Message`] first.
pub fn encode_write_data(request_id: u8, sequence: u32, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(WRITE_DATA_HEADER_LEN + chunk.len());
    out.put_u8(tag::WRITE_DATA);
    out.put_u8(request_id);
    out.put_u32(sequence);
    out.put_slice(chunk);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout_is_big_endian() {
        let m = Message::WriteRequest {
            request_id: 7,
            total_length: 0x0001_0203,
            chunk_count: 0x0A0B_0C0D,
        };
        assert_eq!(
            m.encode(),
            vec![0x02, 7, 0x00, 0x01, 0x02, 0x03, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(Message::parse(&m.encode()).unwrap(), m);
    }

    #[test]
    fn write_data_helper_matches_message() {
        let chunk = [0xAA, 0xBB];
        let m = Message::WriteData {
            request_id: 1,
            sequence: 7,
            chunk: chunk.to_vec(),
        };
        assert_eq!(encode_write_data(1, 7, &chunk), m.encode());
        assert_eq!(
            encode_write_data(1, 7, &chunk),
            vec![0x03, 0x01, 0, 0, 0, 7, 0xAA, 0xBB]
        );
    }

    #[test]
    fn acks_parse() {
        assert_eq!(
            Message::parse(&[0x14, 3, 0, 0, 0, 9]).unwrap(),
            Message::WriteDataAck {
                request_id: 3,
                sequence: 9
            }
        );
        assert_eq!(
            Message::parse(&[0x15, 4]).unwrap(),
            Message::WriteDoneAck { request_id: 4 }
        );
        assert_eq!(
            Message::parse(&[0x13, 4, 0, 0, 1, 0]).unwrap(),
            Message::WriteRequestAck {
                request_id: 4,
                total_length: 256
            }
        );
    }

    #[test]
    fn hello_text_is_lossy_utf8() {
        let m = Message::parse(b"\x01Hello Burst 12").unwrap();
        assert_eq!(
            m,
            Message::Hello {
                text: "Hello Burst 12".into()
            }
        );
    }

    #[test]
    fn malformed_inputs() {
        assert_eq!(Message::parse(&[]), Err(MessageError::Empty));
        assert_eq!(Message::parse(&[0x42]), Err(MessageError::UnknownTag(0x42)));
        assert!(matches!(
            Message::parse(&[0x14, 3, 0]),
            Err(MessageError::Truncated { tag: 0x14, .. })
        ));
        assert!(matches!(
            Message::parse(&[0x17]),
            Err(MessageError::Truncated { tag: 0x17, .. })
        ));
    }
}
