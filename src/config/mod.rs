//! # Configuration Management Module
//!
//! TOML configuration for both station roles. The camera side uses
//! `[radio]`, `[transfer]`, `[queues]` and `[capture]`; the receiving side
//! uses `[radio]` and `[listener]`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use zbcam::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("Serial Port: {}", config.radio.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [radio]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! peer_address = "0x0013A20041C17206"
//!
//! [transfer]
//! frame_payload = 80
//! chunk_timeout_ms = 200
//!
//! [capture]
//! source = "capture.jpg"
//! interval_secs = 30
//! ```
//!
//! Every field has a default, so sections may be omitted.

use crate::transfer::engine::{EngineConfig, DEFAULT_FRAME_PAYLOAD, DEFAULT_RING_CAPACITY};
use crate::transfer::events::QueueCapacities;
use crate::transfer::message::WRITE_DATA_HEADER_LEN;
use crate::xbee::api::{parse_address64, Destination, TxRequest};
use crate::xbee::codec::DEFAULT_MAX_FRAME_DATA;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_PEER_ADDRESS: &str = "0x0013A20041C17206";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub port: String,
    pub baud_rate: u32,
    /// 64-bit address of the other station, hex with or without `0x`.
    pub peer_address: String,
    /// Largest frame body accepted by the decoder.
    pub max_frame_data: usize,
    pub broadcast_radius: u8,
    pub transmit_options: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            peer_address: DEFAULT_PEER_ADDRESS.to_string(),
            max_frame_data: DEFAULT_MAX_FRAME_DATA,
            broadcast_radius: 0,
            transmit_options: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub ring_capacity: usize,
    /// RF data bytes per WRITE_DATA, header included.
    pub frame_payload: usize,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub chunk_timeout_ms: u64,
    pub completion_timeout_ms: u64,
    pub slot_poll_interval_ms: u64,
    pub slot_poll_attempts: u32,
    /// How long to keep recovering chunks before WRITE_DONE.
    pub settle_timeout_ms: u64,
    /// Resend WRITE_DONE until acknowledged instead of reporting once.
    pub retry_completion: bool,
    pub fast_retransmit: bool,
    /// 0 keeps trying forever.
    pub handshake_attempts: u32,
    /// 0 keeps trying forever.
    pub request_attempts: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            frame_payload: DEFAULT_FRAME_PAYLOAD,
            handshake_timeout_ms: 1000,
            request_timeout_ms: 200,
            chunk_timeout_ms: 200,
            completion_timeout_ms: 200,
            slot_poll_interval_ms: 100,
            slot_poll_attempts: 100,
            settle_timeout_ms: 5000,
            retry_completion: false,
            fast_retransmit: true,
            handshake_attempts: 0,
            request_attempts: 0,
        }
    }
}

impl TransferConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            ring_capacity: self.ring_capacity,
            frame_payload: self.frame_payload,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            completion_timeout: Duration::from_millis(self.completion_timeout_ms),
            slot_poll_interval: Duration::from_millis(self.slot_poll_interval_ms),
            slot_poll_attempts: self.slot_poll_attempts,
            settle_timeout: Duration::from_millis(self.settle_timeout_ms),
            retry_completion: self.retry_completion,
            fast_retransmit: self.fast_retransmit,
            handshake_attempts: self.handshake_attempts,
            request_attempts: self.request_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub status: usize,
    pub acks: usize,
    pub missing: usize,
    pub commands: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let caps = QueueCapacities::default();
        Self {
            status: caps.status,
            acks: caps.acks,
            missing: caps.missing,
            commands: caps.commands,
        }
    }
}

impl QueueConfig {
    pub fn capacities(&self) -> QueueCapacities {
        QueueCapacities {
            status: self.status,
            acks: self.acks,
            missing: self.missing,
            commands: self.commands,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// File re-read on every cycle and sent as one blob.
    pub source: String,
    pub interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "capture.jpg".to_string(),
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub output_dir: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            output_dir: "./received".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the radio or the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.peer_address()?;
        if self.radio.baud_rate == 0 {
            return Err(anyhow!("radio.baud_rate must be positive"));
        }
        if self.transfer.ring_capacity == 0 {
            return Err(anyhow!("transfer.ring_capacity must be at least 1"));
        }
        if self.transfer.frame_payload <= WRITE_DATA_HEADER_LEN {
            return Err(anyhow!(
                "transfer.frame_payload must exceed the {}-byte chunk header (got {})",
                WRITE_DATA_HEADER_LEN,
                self.transfer.frame_payload
            ));
        }
        // Transmit request header plus frame id must fit the decoder limit on
        // the receiving side.
        let frame_body = self.transfer.frame_payload + TxRequest::HEADER_LEN + 1;
        if frame_body > self.radio.max_frame_data {
            return Err(anyhow!(
                "transfer.frame_payload {} produces {}-byte frames, above radio.max_frame_data {}",
                self.transfer.frame_payload,
                frame_body,
                self.radio.max_frame_data
            ));
        }
        if self.transfer.chunk_timeout_ms == 0 || self.transfer.request_timeout_ms == 0 {
            return Err(anyhow!("transfer timeouts must be positive"));
        }
        Ok(())
    }

    pub fn peer_address(&self) -> Result<u64> {
        parse_address64(&self.radio.peer_address)
            .ok_or_else(|| anyhow!("Invalid radio.peer_address '{}'", self.radio.peer_address))
    }

    pub fn destination(&self) -> Result<Destination> {
        Ok(Destination {
            broadcast_radius: self.radio.broadcast_radius,
            options: self.radio.transmit_options,
            ..Destination::new(self.peer_address()?)
        })
    }
}
