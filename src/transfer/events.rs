//! Typed events flowing from the receive path and timers to the transfer
//! engine, the queues that carry them, and the router that classifies
//! decoded frames.

use super::message::{Message, MessageError};
use super::queue::BoundedQueue;
use crate::logutil::escape_log;
use crate::xbee::api::{ApiFrame, TxStatus};
use crate::xbee::codec::ResponseFrame;
use log::{debug, trace};
use std::fmt;
use std::sync::Arc;

/// Protocol phases that block on the ack queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Handshake,
    Request,
    Completion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Handshake => "handshake",
            Phase::Request => "write request",
            Phase::Completion => "write done",
        };
        f.write_str(s)
    }
}

/// Events on the ack queue. Peer replies are keyed by request id (and
/// sequence for data); timeouts carry the token of the wait they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Hello { text: String },
    WriteRequest { request_id: u8, total_length: u32 },
    WriteData { request_id: u8, sequence: u32 },
    WriteDone { request_id: u8 },
    Timeout { phase: Phase, token: u64 },
}

/// A chunk that should be sent again. `attempt` names the transmission the
/// notice refers to; `None` means "whatever is outstanding".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingNotice {
    pub request_id: u8,
    pub sequence: u32,
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueCapacities {
    pub status: usize,
    pub acks: usize,
    pub missing: usize,
    pub commands: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            status: 24,
            acks: 24,
            missing: 24,
            commands: 8,
        }
    }
}

/// The four named queues shared between producers and the engine.
#[derive(Debug, Clone)]
pub struct EventQueues {
    pub status: Arc<BoundedQueue<TxStatus>>,
    pub acks: Arc<BoundedQueue<AckEvent>>,
    pub missing: Arc<BoundedQueue<MissingNotice>>,
    pub commands: Arc<BoundedQueue<u8>>,
}

impl EventQueues {
    pub fn new(caps: QueueCapacities) -> Self {
        Self {
            status: Arc::new(BoundedQueue::new("status", caps.status)),
            acks: Arc::new(BoundedQueue::new("ack", caps.acks)),
            missing: Arc::new(BoundedQueue::new("missing", caps.missing)),
            commands: Arc::new(BoundedQueue::new("command", caps.commands)),
        }
    }

    pub fn overflow_drops(&self) -> u64 {
        self.status.dropped() + self.acks.dropped() + self.missing.dropped() + self.commands.dropped()
    }
}

impl Default for EventQueues {
    fn default() -> Self {
        Self::new(QueueCapacities::default())
    }
}

/// Receive callback for the sender role: turns decoded frames into queue
/// events and nothing else.
#[derive(Debug, Clone)]
pub struct EventRouter {
    queues: EventQueues,
    peer: Option<u64>,
}

impl EventRouter {
    pub fn new(queues: EventQueues) -> Self {
        Self { queues, peer: None }
    }

    /// Ignore receive frames from any other source address.
    pub fn only_from(mut self, peer: u64) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn handle(&self, frame: ResponseFrame) {
        if !frame.is_ok() {
            return;
        }
        let api = match ApiFrame::parse(&frame) {
            Ok(api) => api,
            Err(e) => {
                debug!("unparseable api frame: {}", e);
                return;
            }
        };
        match api {
            ApiFrame::TxStatus(status) => {
                trace!(
                    "tx status fid={} retries={} delivery=0x{:02x} discovery=0x{:02x}",
                    status.frame_id,
                    status.retry_count,
                    status.delivery_status,
                    status.discovery_status
                );
                self.queues.status.push(status);
            }
            ApiFrame::ModemStatus(m) => debug!("modem status 0x{:02x}", m.status),
            ApiFrame::Unknown { api_id, .. } => trace!("ignoring api frame 0x{:02x}", api_id),
            rx @ (ApiFrame::Rx(_) | ApiFrame::ExplicitRx(_)) => {
                if let (Some(peer), Some(src)) = (self.peer, rx.source64()) {
                    if peer != src {
                        debug!("ignoring rx from {:016x} (peer is {:016x})", src, peer);
                        return;
                    }
                }
                if let Some(data) = rx.rf_data() {
                    self.route_message(data);
                }
            }
        }
    }

    fn route_message(&self, data: &[u8]) {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(MessageError::UnknownTag(t)) => {
                trace!("dropping message with tag 0x{:02x}", t);
                return;
            }
            Err(e) => {
                debug!("dropping malformed message: {}", e);
                return;
            }
        };
        let ack = match msg {
            Message::Hello { text } => {
                debug!("hello from peer: {}", escape_log(&text));
                AckEvent::Hello { text }
            }
            Message::WriteRequest {
                request_id,
                total_length,
                ..
            }
            | Message::WriteRequestAck {
                request_id,
                total_length,
            } => AckEvent::WriteRequest {
                request_id,
                total_length,
            },
            Message::WriteData {
                request_id,
                sequence,
                ..
            }
            | Message::WriteDataAck {
                request_id,
                sequence,
            } => AckEvent::WriteData {
                request_id,
                sequence,
            },
            Message::WriteDone { request_id, .. } | Message::WriteDoneAck { request_id } => {
                AckEvent::WriteDone { request_id }
            }
            Message::WriteResend {
                request_id,
                sequence,
            } => {
                debug!("peer requests resend of {}/{}", request_id, sequence);
                self.queues.missing.push(MissingNotice {
                    request_id,
                    sequence,
                    attempt: None,
                });
                return;
            }
            Message::Command(cmd) => {
                debug!("command byte 0x{:02x} from peer", cmd);
                self.queues.commands.push(cmd);
                return;
            }
        };
        self.queues.acks.push(ack);
    }

    pub fn into_callback(self) -> impl FnMut(ResponseFrame) + Send + 'static {
        move |frame| self.handle(frame)
    }
}
