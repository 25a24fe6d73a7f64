//! # Station Roles
//!
//! [`Uplink`] is the camera side: handshake once, then capture a blob and
//! deliver it every interval, applying command bytes the peer sends in
//! between. [`listener::Listener`] is the receiving side.
//!
//! Both roles are generic over [`FrameSink`] so they run unchanged against a
//! serial radio or the in-process loopback peer.

pub mod listener;

use crate::transfer::engine::{ReliableSender, TransferReport};
use crate::xbee::transport::{ActivityIndicator, FrameSink};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use listener::Listener;

/// Future returned by [`CaptureSource::capture`].
pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;

/// Produces the blob sent on each cycle.
pub trait CaptureSource: Send {
    fn capture(&mut self) -> CaptureFuture<'_>;

    /// Handle one command byte received from the peer.
    fn apply_command(&mut self, cmd: u8) -> Result<()> {
        debug!("capture source has no handler for command 0x{:02x}", cmd);
        Ok(())
    }
}

/// Re-reads a file on every capture, e.g. a snapshot another process keeps
/// refreshing.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CaptureSource for FileCapture {
    fn capture(&mut self) -> CaptureFuture<'_> {
        Box::pin(async move {
            tokio::fs::read(&self.path)
                .await
                .map_err(|e| anyhow!("Failed to read capture source {}: {}", self.path.display(), e))
        })
    }
}

/// Activity indicator that reports changes at debug level.
#[derive(Debug, Default)]
pub struct LogIndicator {
    on: AtomicBool,
}

impl LogIndicator {
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }
}

impl ActivityIndicator for LogIndicator {
    fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::Relaxed) != on {
            debug!("radio {}", if on { "busy" } else { "idle" });
        }
    }
}

pub struct Uplink<S: FrameSink> {
    sender: ReliableSender<S>,
    source: Box<dyn CaptureSource>,
    interval: Duration,
}

impl<S: FrameSink> Uplink<S> {
    pub fn new(sender: ReliableSender<S>, source: Box<dyn CaptureSource>, interval: Duration) -> Self {
        Self {
            sender,
            source,
            interval,
        }
    }

    pub fn sender(&self) -> &ReliableSender<S> {
        &self.sender
    }

    pub fn sender_mut(&mut self) -> &mut ReliableSender<S> {
        &mut self.sender
    }

    /// Apply queued command bytes. Returns how many were taken.
    pub fn apply_commands(&mut self) -> usize {
        let cmds = self.sender.queues().commands.drain();
        for &cmd in &cmds {
            info!("applying command 0x{:02x}", cmd);
            if let Err(e) = self.source.apply_command(cmd) {
                warn!("command 0x{:02x} failed: {}", cmd, e);
            }
        }
        cmds.len()
    }

    /// One capture-and-send cycle.
    pub async fn cycle(&mut self) -> Result<TransferReport> {
        self.apply_commands();
        let blob = self.source.capture().await?;
        let report = self.sender.send_blob(&blob).await?;
        Ok(report)
    }

    /// Handshake, then cycle every interval until `shutdown` resolves.
    /// Failed cycles are logged and the loop continues.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<u64>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => return Ok(0),
            r = self.sender.handshake() => { r?; }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut delivered = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("uplink stopping after {} delivered blob(s)", delivered);
                    break;
                }
                _ = ticker.tick() => {
                    match self.cycle().await {
                        Ok(report) if report.is_complete() => delivered += 1,
                        Ok(report) => warn!(
                            "blob {} incomplete: {}/{} chunks acked",
                            report.request_id, report.acked_count, report.chunk_count
                        ),
                        Err(e) => warn!("capture cycle failed: {}", e),
                    }
                }
            }
        }
        Ok(delivered)
    }
}

#[cfg(feature = "serial")]
mod serial {
    use super::LogIndicator;
    use crate::config::Config;
    use crate::transfer::engine::ReliableSender;
    use crate::transfer::events::{EventQueues, EventRouter};
    use crate::xbee::transport::{
        open_serial_port, split_port, ActivityIndicator, FrameReader, FrameWriter, ReaderHandle,
    };
    use anyhow::Result;
    use log::info;
    use std::sync::Arc;

    pub type SerialWriter = FrameWriter<Box<dyn serialport::SerialPort>>;
    pub type SerialReader = FrameReader<Box<dyn serialport::SerialPort>>;

    /// Open the configured port and split it. `port` overrides the config.
    pub async fn open_radio(
        config: &Config,
        port: Option<&str>,
    ) -> Result<(SerialWriter, SerialReader)> {
        let port_name = port.unwrap_or(&config.radio.port);
        let handle = open_serial_port(port_name, config.radio.baud_rate).await?;
        info!("Connected to radio on {} @ {} baud", port_name, config.radio.baud_rate);
        let indicator: Arc<dyn ActivityIndicator> = Arc::new(LogIndicator::default());
        split_port(handle, config.radio.max_frame_data, indicator)
    }

    /// Sender wired to a serial radio, with the reader already running.
    pub async fn connect_sender(
        config: &Config,
        port: Option<&str>,
    ) -> Result<(ReliableSender<SerialWriter>, ReaderHandle)> {
        let (writer, mut reader) = open_radio(config, port).await?;
        let queues = EventQueues::new(config.queues.capacities());
        reader.on_frame(
            EventRouter::new(queues.clone())
                .only_from(config.peer_address()?)
                .into_callback(),
        );
        let handle = ReaderHandle::spawn(reader);
        let sender = ReliableSender::new(
            writer,
            config.destination()?,
            queues,
            config.transfer.engine(),
        );
        Ok((sender, handle))
    }
}

#[cfg(feature = "serial")]
pub use serial::{connect_sender, open_radio, SerialReader, SerialWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::engine::EngineConfig;
    use crate::transfer::events::EventQueues;
    use crate::transfer::loopback::LoopbackPeer;
    use crate::xbee::api::Destination;
    use std::sync::{Arc, Mutex};

    const PEER: u64 = 0x0013A20041C17206;

    struct Counter {
        next: u8,
        applied: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureSource for Counter {
        fn capture(&mut self) -> CaptureFuture<'_> {
            self.next += 1;
            let blob = vec![self.next; 150];
            Box::pin(async move { Ok(blob) })
        }

        fn apply_command(&mut self, cmd: u8) -> Result<()> {
            self.applied.lock().unwrap().push(cmd);
            Ok(())
        }
    }

    #[test]
    fn indicator_tracks_state() {
        let ind = LogIndicator::default();
        ind.set(true);
        assert!(ind.is_on());
        ind.set(false);
        assert!(!ind.is_on());
    }

    #[tokio::test]
    async fn file_capture_reports_missing_file() {
        let mut src = FileCapture::new("/nonexistent/zbcam/capture.jpg");
        let err = src.capture().await.unwrap_err().to_string();
        assert!(err.contains("capture.jpg"));
    }

    #[tokio::test]
    async fn file_capture_rereads_each_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.jpg");
        std::fs::write(&path, b"first").unwrap();
        let mut src = FileCapture::new(&path);
        assert_eq!(src.capture().await.unwrap(), b"first");
        std::fs::write(&path, b"second frame").unwrap();
        assert_eq!(src.capture().await.unwrap(), b"second frame");
    }

    #[tokio::test]
    async fn cycle_applies_commands_then_sends() {
        let queues = EventQueues::default();
        let mut peer = LoopbackPeer::new(PEER, queues.clone());
        peer.send_command(0x21).unwrap();
        let sender = ReliableSender::new(peer, Destination::new(PEER), queues, EngineConfig::default());
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut uplink = Uplink::new(
            sender,
            Box::new(Counter {
                next: 0,
                applied: applied.clone(),
            }),
            Duration::from_secs(1),
        );
        let report = uplink.cycle().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.total_length, 150);
        let blobs = uplink.sender_mut().sink_mut().take_completed();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].data, vec![1u8; 150]);
        assert_eq!(*applied.lock().unwrap(), vec![0x21]);
    }
}
