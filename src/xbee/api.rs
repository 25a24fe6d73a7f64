//! Typed views of the XBee API frames this crate speaks.
//!
//! Inbound frames are parsed once into [`ApiFrame`]; outbound RF data goes out
//! as a ZigBee Transmit Request built by [`TxRequest`].

use super::codec::{Frame, ResponseFrame};
use thiserror::Error;

pub const ZB_TX_REQUEST: u8 = 0x10;
pub const MODEM_STATUS: u8 = 0x8A;
pub const ZB_TX_STATUS: u8 = 0x8B;
pub const ZB_RX_RESPONSE: u8 = 0x90;
pub const ZB_EXPLICIT_RX_RESPONSE: u8 = 0x91;

/// 16-bit address to use when the destination's network address is unknown.
pub const ZB_BROADCAST_ADDRESS: u16 = 0xFFFE;

/// Delivery status codes carried in a transmit status frame.
pub mod delivery {
    pub const SUCCESS: u8 = 0x00;
    pub const CCA_FAILURE: u8 = 0x02;
    pub const NETWORK_ACK_FAILURE: u8 = 0x21;
    pub const NOT_JOINED_TO_NETWORK: u8 = 0x22;
    pub const ADDRESS_NOT_FOUND: u8 = 0x24;
    pub const ROUTE_NOT_FOUND: u8 = 0x25;
    pub const PAYLOAD_TOO_LARGE: u8 = 0x74;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("api frame 0x{api_id:02x} too short: {len} bytes, need {need}")]
    Truncated { api_id: u8, len: usize, need: usize },
}

fn need(api_id: u8, data: &[u8], need: usize) -> Result<(), ApiError> {
    if data.len() < need {
        Err(ApiError::Truncated {
            api_id,
            len: data.len(),
            need,
        })
    } else {
        Ok(())
    }
}

fn be_u64(b: &[u8]) -> u64 {
    b.iter().fold(0u64, |acc, &x| (acc << 8) | x as u64)
}

fn be_u16(b: &[u8]) -> u16 {
    ((b[0] as u16) << 8) | b[1] as u16
}

/// ZigBee Transmit Request (0x10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub frame_id: u8,
    pub dest64: u64,
    pub dest16: u16,
    pub broadcast_radius: u8,
    pub options: u8,
    pub data: Vec<u8>,
}

impl TxRequest {
    pub fn new(dest64: u64, frame_id: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_id,
            dest64,
            dest16: ZB_BROADCAST_ADDRESS,
            broadcast_radius: 0,
            options: 0,
            data: data.into(),
        }
    }

    /// Fixed bytes between FRAME_ID and the RF data.
    pub const HEADER_LEN: usize = 8 + 2 + 1 + 1;

    pub fn into_frame(self) -> Frame {
        let mut payload = Vec::with_capacity(Self::HEADER_LEN + self.data.len());
        payload.extend_from_slice(&self.dest64.to_be_bytes());
        payload.extend_from_slice(&self.dest16.to_be_bytes());
        payload.push(self.broadcast_radius);
        payload.push(self.options);
        payload.extend_from_slice(&self.data);
        Frame::new(ZB_TX_REQUEST, self.frame_id, payload)
    }

    /// Inverse of [`TxRequest::into_frame`]; used by the receiver role and tests.
    pub fn from_frame(frame: &Frame) -> Result<Self, ApiError> {
        need(ZB_TX_REQUEST, &frame.payload, Self::HEADER_LEN)?;
        let p = &frame.payload;
        Ok(Self {
            frame_id: frame.frame_id,
            dest64: be_u64(&p[0..8]),
            dest16: be_u16(&p[8..10]),
            broadcast_radius: p[10],
            options: p[11],
            data: p[Self::HEADER_LEN..].to_vec(),
        })
    }
}

/// Where transmit requests go and how the radio should route them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub address64: u64,
    pub broadcast_radius: u8,
    pub options: u8,
}

impl Destination {
    pub fn new(address64: u64) -> Self {
        Self {
            address64,
            broadcast_radius: 0,
            options: 0,
        }
    }

    pub fn request(&self, frame_id: u8, data: impl Into<Vec<u8>>) -> TxRequest {
        TxRequest {
            broadcast_radius: self.broadcast_radius,
            options: self.options,
            ..TxRequest::new(self.address64, frame_id, data)
        }
    }
}

/// ZigBee Transmit Status (0x8B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub frame_id: u8,
    pub remote16: u16,
    pub retry_count: u8,
    pub delivery_status: u8,
    pub discovery_status: u8,
}

impl TxStatus {
    pub fn is_success(&self) -> bool {
        self.delivery_status == delivery::SUCCESS
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = self.remote16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[
            self.retry_count,
            self.delivery_status,
            self.discovery_status,
        ]);
        Frame::new(ZB_TX_STATUS, self.frame_id, payload)
    }
}

/// ZigBee Receive Packet (0x90).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    pub src64: u64,
    pub src16: u16,
    pub options: u8,
    pub data: Vec<u8>,
}

impl RxPacket {
    const HEADER_LEN: usize = 8 + 2 + 1;

    /// Wrap RF data as the radio would deliver it. Receive packets carry no
    /// frame id, so the first source address byte occupies that position.
    pub fn to_frame(&self) -> Frame {
        let src = self.src64.to_be_bytes();
        let mut payload = src[1..].to_vec();
        payload.extend_from_slice(&self.src16.to_be_bytes());
        payload.push(self.options);
        payload.extend_from_slice(&self.data);
        Frame::new(ZB_RX_RESPONSE, src[0], payload)
    }
}

/// ZigBee Explicit Rx Indicator (0x91).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitRxPacket {
    pub src64: u64,
    pub src16: u16,
    pub src_endpoint: u8,
    pub dest_endpoint: u8,
    pub cluster_id: u16,
    pub profile_id: u16,
    pub options: u8,
    pub data: Vec<u8>,
}

impl ExplicitRxPacket {
    const HEADER_LEN: usize = 8 + 2 + 1 + 1 + 2 + 2 + 1;
}

/// Modem Status (0x8A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemStatus {
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFrame {
    TxStatus(TxStatus),
    Rx(RxPacket),
    ExplicitRx(ExplicitRxPacket),
    ModemStatus(ModemStatus),
    Unknown { api_id: u8, frame_data: Vec<u8> },
}

impl ApiFrame {
    /// Parse a decoded frame. Only call with frames whose checksum passed.
    pub fn parse(frame: &ResponseFrame) -> Result<Self, ApiError> {
        let d = frame.frame_data.as_slice();
        match frame.api_id {
            ZB_TX_STATUS => {
                need(ZB_TX_STATUS, d, 6)?;
                Ok(ApiFrame::TxStatus(TxStatus {
                    frame_id: d[0],
                    remote16: be_u16(&d[1..3]),
                    retry_count: d[3],
                    delivery_status: d[4],
                    discovery_status: d[5],
                }))
            }
            ZB_RX_RESPONSE => {
                need(ZB_RX_RESPONSE, d, RxPacket::HEADER_LEN)?;
                Ok(ApiFrame::Rx(RxPacket {
                    src64: be_u64(&d[0..8]),
                    src16: be_u16(&d[8..10]),
                    options: d[10],
                    data: d[RxPacket::HEADER_LEN..].to_vec(),
                }))
            }
            ZB_EXPLICIT_RX_RESPONSE => {
                need(ZB_EXPLICIT_RX_RESPONSE, d, ExplicitRxPacket::HEADER_LEN)?;
                Ok(ApiFrame::ExplicitRx(ExplicitRxPacket {
                    src64: be_u64(&d[0..8]),
                    src16: be_u16(&d[8..10]),
                    src_endpoint: d[10],
                    dest_endpoint: d[11],
                    cluster_id: be_u16(&d[12..14]),
                    profile_id: be_u16(&d[14..16]),
                    options: d[16],
                    data: d[ExplicitRxPacket::HEADER_LEN..].to_vec(),
                }))
            }
            MODEM_STATUS => {
                need(MODEM_STATUS, d, 1)?;
                Ok(ApiFrame::ModemStatus(ModemStatus { status: d[0] }))
            }
            api_id => Ok(ApiFrame::Unknown {
                api_id,
                frame_data: d.to_vec(),
            }),
        }
    }

    /// RF data of a receive frame, if this is one.
    pub fn rf_data(&self) -> Option<&[u8]> {
        match self {
            ApiFrame::Rx(rx) => Some(&rx.data),
            ApiFrame::ExplicitRx(rx) => Some(&rx.data),
            _ => None,
        }
    }

    pub fn source64(&self) -> Option<u64> {
        match self {
            ApiFrame::Rx(rx) => Some(rx.src64),
            ApiFrame::ExplicitRx(rx) => Some(rx.src64),
            _ => None,
        }
    }
}

/// Parse a 64-bit address written as hex, with or without a `0x` prefix.
pub fn parse_address64(s: &str) -> Option<u64> {
    let t = s.trim();
    let t = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    if t.is_empty() || t.len() > 16 {
        return None;
    }
    u64::from_str_radix(t, 16).ok()
}
