//! Test utilities & fixtures.
//! Builds senders wired to the in-process loopback peer with short timers.

use std::time::Duration;
use zbcam::transfer::loopback::{Direction, LoopbackPeer};
use zbcam::transfer::{EngineConfig, EventQueues, Message, ReliableSender};
use zbcam::xbee::codec::Frame;
use zbcam::xbee::{Destination, FrameSink, TransportError, TxRequest};

#[allow(dead_code)]
pub const PEER: u64 = 0x0013A20041C17206;

#[allow(dead_code)]
/// Engine settings scaled down so lossy transfers finish quickly.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        handshake_timeout: Duration::from_millis(50),
        request_timeout: Duration::from_millis(40),
        chunk_timeout: Duration::from_millis(40),
        completion_timeout: Duration::from_millis(40),
        slot_poll_interval: Duration::from_millis(10),
        slot_poll_attempts: 200,
        settle_timeout: Duration::from_millis(2000),
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub fn loopback_sender(cfg: EngineConfig) -> ReliableSender<LoopbackPeer> {
    lossy_sender(cfg, |_, _| false)
}

#[allow(dead_code)]
pub fn lossy_sender<F>(cfg: EngineConfig, loss: F) -> ReliableSender<LoopbackPeer>
where
    F: FnMut(Direction, &Message) -> bool + Send + 'static,
{
    let queues = EventQueues::default();
    let peer = LoopbackPeer::new(PEER, queues.clone()).with_loss(loss);
    ReliableSender::new(peer, Destination::new(PEER), queues, cfg)
}

/// Deterministic, non-repeating-looking test data.
#[allow(dead_code)]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// Sink whose transmit fails whenever `fail` says so, like a serial write
/// error. Frames that fail never reach the wrapped sink.
#[allow(dead_code)]
pub struct FailingSink<S> {
    pub inner: S,
    pub failures: Vec<Message>,
    fail: Box<dyn FnMut(&Message) -> bool + Send>,
}

#[allow(dead_code)]
impl<S> FailingSink<S> {
    pub fn new<F>(inner: S, fail: F) -> Self
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        Self {
            inner,
            failures: Vec::new(),
            fail: Box::new(fail),
        }
    }
}

impl<S: FrameSink> FrameSink for FailingSink<S> {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let msg = TxRequest::from_frame(frame)
            .ok()
            .and_then(|req| Message::parse(&req.data).ok());
        if let Some(msg) = msg {
            if (self.fail)(&msg) {
                self.failures.push(msg);
                return Err(TransportError::Closed);
            }
        }
        self.inner.send_frame(frame)
    }
}

/// Loopback sender whose outgoing transmits fail on demand.
#[allow(dead_code)]
pub fn failing_sender<F>(cfg: EngineConfig, fail: F) -> ReliableSender<FailingSink<LoopbackPeer>>
where
    F: FnMut(&Message) -> bool + Send + 'static,
{
    let queues = EventQueues::default();
    let peer = LoopbackPeer::new(PEER, queues.clone());
    ReliableSender::new(
        FailingSink::new(peer, fail),
        Destination::new(PEER),
        queues,
        cfg,
    )
}
