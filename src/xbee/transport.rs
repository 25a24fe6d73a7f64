//! Serial-side plumbing: frame-id allocation, the outbound frame sink and the
//! inbound reader that drives the decoder.

use super::codec::{CodecError, DecodeEvent, DecodeStatus, Frame, FrameDecoder, ResponseFrame};
use crate::logutil::hex_snippet;
use crate::metrics;
use log::{debug, trace, warn};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode error: {0}")]
    Codec(#[from] CodecError),
    #[error("link closed")]
    Closed,
}

/// Hands out frame ids 1..=255 cyclically. Zero asks the radio for no
/// transmit status and is never issued.
#[derive(Debug, Clone)]
pub struct FrameIdAllocator {
    last: u8,
}

impl Default for FrameIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameIdAllocator {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next_id(&mut self) -> u8 {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        self.last
    }
}

/// On/off signal for "waiting on the radio". Set when a frame goes out,
/// cleared when any frame comes back.
pub trait ActivityIndicator: Send + Sync {
    fn set(&self, on: bool);
}

/// Indicator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl ActivityIndicator for NoIndicator {
    fn set(&self, _on: bool) {}
}

/// Anything that can put a frame on the air.
pub trait FrameSink {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError>;
}

/// Encodes frames onto a byte stream (normally the serial port).
pub struct FrameWriter<W: Write> {
    inner: W,
    indicator: Arc<dyn ActivityIndicator>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            indicator: Arc::new(NoIndicator),
        }
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn ActivityIndicator>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameSink for FrameWriter<W> {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let wire = frame.encode()?;
        trace!(
            "TX api=0x{:02x} fid={} {} bytes: {}",
            frame.api_id,
            frame.frame_id,
            wire.len(),
            hex_snippet(&wire, 48)
        );
        self.inner.write_all(&wire)?;
        self.inner.flush()?;
        self.indicator.set(true);
        metrics::inc_frames_sent();
        Ok(())
    }
}

pub type FrameCallback = Box<dyn FnMut(ResponseFrame) + Send>;

/// Feeds raw bytes through the decoder and hands every reported frame
/// (valid or not) to the registered callback.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    callback: Option<FrameCallback>,
    indicator: Arc<dyn ActivityIndicator>,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R, max_frame_data: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_data),
            callback: None,
            indicator: Arc::new(NoIndicator),
        }
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn ActivityIndicator>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: FnMut(ResponseFrame) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Process received bytes in order.
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            match self.decoder.push(b) {
                None => {}
                Some(DecodeEvent::Frame(frame)) => {
                    metrics::inc_frames_received();
                    match frame.status {
                        DecodeStatus::NoError => {}
                        DecodeStatus::ChecksumFailure => {
                            metrics::inc_checksum_failures();
                            debug!(
                                "checksum failure api=0x{:02x} len={}",
                                frame.api_id,
                                frame.frame_data.len()
                            );
                        }
                        DecodeStatus::UnexpectedStartByte => {
                            metrics::inc_unexpected_start();
                            debug!(
                                "frame aborted by start byte after {} body bytes",
                                frame.frame_data.len()
                            );
                        }
                        DecodeStatus::PacketExceedsByteArrayLength => {}
                    }
                    self.indicator.set(false);
                    if let Some(cb) = self.callback.as_mut() {
                        cb(frame);
                    }
                }
                Some(DecodeEvent::Dropped {
                    status,
                    declared_len,
                }) => {
                    metrics::inc_oversize_drops();
                    warn!(
                        "dropping frame with declared length {} (code {}, limit {})",
                        declared_len,
                        status.code(),
                        self.decoder.max_frame_data()
                    );
                }
            }
        }
    }
}

impl<R: Read> FrameReader<R> {
    /// Blocking read loop; returns when `stop` is raised or the reader is
    /// interrupted. Read timeouts are the normal idle path.
    pub fn run_blocking(mut self, stop: Arc<AtomicBool>) {
        debug!("frame reader started");
        let mut buffer = [0u8; 256];
        while !stop.load(Ordering::Relaxed) {
            match self.inner.read(&mut buffer) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => {
                    trace!("RAW {} bytes: {}", n, hex_snippet(&buffer[..n], 64));
                    self.feed(&buffer[..n]);
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    debug!("reader interrupted, likely shutdown in progress");
                    break;
                }
                Err(e) => {
                    warn!("serial read error (continuing): {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        debug!("frame reader stopped");
    }
}

/// Handle to a reader running on the blocking pool.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReaderHandle {
    pub fn spawn<R: Read + Send + 'static>(reader: FrameReader<R>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let task = tokio::task::spawn_blocking(move || reader.run_blocking(flag));
        Self { stop, task }
    }

    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.task.await {
            warn!("reader task ended abnormally: {}", e);
        }
    }
}

/// Open the radio's serial port, 8N1, with a short read timeout so the
/// reader loop can notice shutdown.
#[cfg(feature = "serial")]
pub async fn open_serial_port(
    port_name: &str,
    baud_rate: u32,
) -> anyhow::Result<Box<dyn serialport::SerialPort>> {
    use anyhow::anyhow;

    debug!("Opening serial port {} at {} baud", port_name, baud_rate);

    let mut port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(50))
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Drop whatever the module emitted before we were listening.
    if let Err(e) = port.clear(serialport::ClearBuffer::All) {
        debug!("could not purge serial buffers: {}", e);
    }

    debug!("Serial port initialized");
    Ok(port)
}

/// Split an opened port into a writer and a reader sharing one indicator.
#[cfg(feature = "serial")]
pub fn split_port(
    port: Box<dyn serialport::SerialPort>,
    max_frame_data: usize,
    indicator: Arc<dyn ActivityIndicator>,
) -> anyhow::Result<(
    FrameWriter<Box<dyn serialport::SerialPort>>,
    FrameReader<Box<dyn serialport::SerialPort>>,
)> {
    let read_half = port
        .try_clone()
        .map_err(|e| anyhow::anyhow!("Failed to clone serial port handle: {}", e))?;
    let writer = FrameWriter::new(port).with_indicator(indicator.clone());
    let reader = FrameReader::new(read_half, max_frame_data).with_indicator(indicator);
    Ok((writer, reader))
}
