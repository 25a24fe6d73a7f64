//! In-process peer that stands in for the radio link and the remote station.
//!
//! Every frame handed to [`LoopbackPeer`] is serialized and decoded again so
//! the full codec is exercised. The peer answers with a transmit status and
//! whatever its [`Reassembler`] replies, routed into the sender's queues just
//! like frames read off a serial port. A loss filter can drop messages in
//! either direction.

use super::events::{EventQueues, EventRouter};
use super::message::Message;
use super::reassembly::{CompletedBlob, Reassembler};
use crate::xbee::api::{delivery, RxPacket, TxRequest, TxStatus};
use crate::xbee::codec::{DecodeEvent, Frame, FrameDecoder, ResponseFrame};
use crate::xbee::transport::{FrameSink, TransportError};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sender to peer.
    Uplink,
    /// Peer to sender.
    Downlink,
}

/// Returns true to lose the message.
pub type LossFilter = Box<dyn FnMut(Direction, &Message) -> bool + Send>;

pub struct LoopbackPeer {
    address: u64,
    router: EventRouter,
    reassembler: Reassembler,
    decoder: FrameDecoder,
    loss: Option<LossFilter>,
    completed: Vec<CompletedBlob>,
    data_seen: Vec<(u8, u32)>,
}

impl LoopbackPeer {
    pub fn new(address: u64, queues: EventQueues) -> Self {
        Self {
            address,
            router: EventRouter::new(queues).only_from(address),
            reassembler: Reassembler::default(),
            decoder: FrameDecoder::default(),
            loss: None,
            completed: Vec::new(),
            data_seen: Vec::new(),
        }
    }

    pub fn with_loss<F>(mut self, filter: F) -> Self
    where
        F: FnMut(Direction, &Message) -> bool + Send + 'static,
    {
        self.loss = Some(Box::new(filter));
        self
    }

    pub fn completed(&self) -> &[CompletedBlob] {
        &self.completed
    }

    pub fn take_completed(&mut self) -> Vec<CompletedBlob> {
        std::mem::take(&mut self.completed)
    }

    /// (request_id, sequence) of every WRITE_DATA that reached the peer, in
    /// arrival order.
    pub fn data_seen(&self) -> &[(u8, u32)] {
        &self.data_seen
    }

    /// Send a one-byte command toward the sender.
    pub fn send_command(&mut self, cmd: u8) -> Result<(), TransportError> {
        self.deliver(Message::Command(cmd))
    }

    fn lost(&mut self, direction: Direction, msg: &Message) -> bool {
        match self.loss.as_mut() {
            Some(filter) => filter(direction, msg),
            None => false,
        }
    }

    fn over_the_air(&mut self, frame: &Frame) -> Result<Vec<ResponseFrame>, TransportError> {
        let wire = frame.encode()?;
        Ok(self
            .decoder
            .push_slice(&wire)
            .into_iter()
            .filter_map(|ev| match ev {
                DecodeEvent::Frame(f) if f.is_ok() => Some(f),
                other => {
                    debug!("loopback decode dropped {:?}", other);
                    None
                }
            })
            .collect())
    }

    fn route(&mut self, frame: Frame) -> Result<(), TransportError> {
        for rf in self.over_the_air(&frame)? {
            self.router.handle(rf);
        }
        Ok(())
    }

    fn deliver(&mut self, msg: Message) -> Result<(), TransportError> {
        if self.lost(Direction::Downlink, &msg) {
            trace!("loopback: lost downlink 0x{:02x}", msg.tag());
            return Ok(());
        }
        let frame = RxPacket {
            src64: self.address,
            src16: 0x0001,
            options: 0x01,
            data: msg.encode(),
        }
        .to_frame();
        self.route(frame)
    }

    fn status(&mut self, frame_id: u8, delivery_status: u8) -> Result<(), TransportError> {
        let frame = TxStatus {
            frame_id,
            remote16: 0x0001,
            retry_count: 0,
            delivery_status,
            discovery_status: 0,
        }
        .to_frame();
        self.route(frame)
    }
}

impl FrameSink for LoopbackPeer {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        for rf in self.over_the_air(frame)? {
            let outbound = Frame::new(rf.api_id, rf.frame_id(), rf.payload().to_vec());
            let request = match TxRequest::from_frame(&outbound) {
                Ok(r) => r,
                Err(e) => {
                    debug!("loopback: not a transmit request: {}", e);
                    continue;
                }
            };
            let msg = match Message::parse(&request.data) {
                Ok(m) => m,
                Err(e) => {
                    debug!("loopback: bad rf data: {}", e);
                    self.status(request.frame_id, delivery::SUCCESS)?;
                    continue;
                }
            };
            if self.lost(Direction::Uplink, &msg) {
                trace!("loopback: lost uplink 0x{:02x}", msg.tag());
                self.status(request.frame_id, delivery::NETWORK_ACK_FAILURE)?;
                continue;
            }
            self.status(request.frame_id, delivery::SUCCESS)?;
            if let Message::WriteData {
                request_id,
                sequence,
                ..
            } = &msg
            {
                self.data_seen.push((*request_id, *sequence));
            }
            let reply = self.reassembler.handle(&msg);
            for response in reply.responses {
                self.deliver(response)?;
            }
            if let Some(blob) = reply.completed {
                self.completed.push(blob);
            }
        }
        Ok(())
    }
}
