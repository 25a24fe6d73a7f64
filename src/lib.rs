//! # zbcam - Reliable Blob Uplink over XBee Radios
//!
//! zbcam moves binary blobs (camera snapshots, typically) from a remote
//! station to a base station over a pair of XBee/Zigbee radios in API mode 2.
//! Each blob is announced, streamed in acknowledged chunks with a sliding
//! window of 24 in-flight slots, and closed with a completion handshake.
//!
//! ## Features
//!
//! - **Frame Codec**: Escaped, checksummed API framing with a resynchronizing byte-level decoder.
//! - **Reliable Transfer**: Per-chunk acknowledgement, timer-driven and peer-driven resends, stale-ack filtering.
//! - **Bounded Queues**: Drop-oldest queues between the serial reader, timers and the engine.
//! - **Both Roles**: The capture-and-send loop and the receiving listener share one codebase.
//! - **Loopback Peer**: Full protocol runs in-process for tests and the `selftest` command.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zbcam::transfer::{EngineConfig, EventQueues, ReliableSender};
//! use zbcam::transfer::loopback::LoopbackPeer;
//! use zbcam::xbee::Destination;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let peer_addr = 0x0013A20041C17206;
//!     let queues = EventQueues::default();
//!     let peer = LoopbackPeer::new(peer_addr, queues.clone());
//!     let mut sender =
//!         ReliableSender::new(peer, Destination::new(peer_addr), queues, EngineConfig::default());
//!     sender.handshake().await?;
//!     let report = sender.send_blob(b"snapshot bytes").await?;
//!     println!("{} chunks acked", report.acked_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`xbee`] - API frame codec, typed API frames, serial transport
//! - [`transfer`] - application messages, queues, timers, slot ring, sender and receiver state machines
//! - [`uplink`] - station roles: capture loop and listener
//! - [`config`] - TOML configuration and validation
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - log formatting helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌──────────────────┐
//! │  Uplink loop    │      │  Serial reader   │ ← blocking pool
//! │  (engine owner) │      │  + EventRouter   │
//! └─────────────────┘      └──────────────────┘
//!     │ frames ▲                  │
//!     ▼        │ status/ack/missing/command queues
//! ┌─────────────────┐             │
//! │  XBee codec     │ ◄───────────┘
//! └─────────────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod metrics;
pub mod transfer;
pub mod uplink;
pub mod xbee;
