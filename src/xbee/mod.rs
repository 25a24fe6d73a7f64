//! # XBee Radio Module
//!
//! Everything needed to talk to an XBee/Zigbee module in API mode 2:
//!
//! - [`codec`] - escaped, checksummed framing (encoder and byte-at-a-time decoder)
//! - [`api`] - typed API frames (transmit request, transmit status, receive packets)
//! - [`transport`] - frame-id allocation, serial writer and reader loop
//!
//! ## Configuration
//!
//! ```toml
//! [radio]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! peer_address = "0x0013A20041C17206"
//! ```

pub mod api;
pub mod codec;
pub mod transport;

pub use api::{ApiFrame, Destination, TxRequest, TxStatus};
pub use codec::{DecodeStatus, Frame, FrameDecoder, ResponseFrame};
pub use transport::{
    ActivityIndicator, FrameIdAllocator, FrameReader, FrameSink, FrameWriter, ReaderHandle,
    TransportError,
};
