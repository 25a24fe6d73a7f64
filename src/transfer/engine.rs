//! Sender side of the chunked transfer protocol.
//!
//! ```text
//! HELLO ──► (hello ack | delivery ok)          1000 ms, retried
//! WRITE_REQUEST ──► WRITE_REQUEST_ACK           200 ms, retried
//! WRITE_DATA[seq] ──► WRITE_DATA_ACK[seq]       200 ms per chunk, resent on loss
//! WRITE_DONE ──► WRITE_DONE_ACK                 200 ms, reported
//! ```
//!
//! The engine is the only owner of the slot ring and transfer state. The
//! receive path and timers reach it exclusively through [`EventQueues`].

use super::events::{AckEvent, EventQueues, MissingNotice, Phase};
use super::message::{encode_write_data, Message, WRITE_DATA_HEADER_LEN};
use super::ring::{AckMatch, SlotState, TransmitRing};
use super::timer::{self, CancelOutcome, TimerHandle};
use super::blob_crc;
use crate::metrics;
use crate::xbee::api::{Destination, TxStatus};
use crate::xbee::transport::{FrameIdAllocator, FrameSink, TransportError};
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_RING_CAPACITY: usize = 24;
/// RF data bytes per transmit request.
pub const DEFAULT_FRAME_PAYLOAD: usize = 80;
/// A frame id whose delivery status never arrived is reused after this.
const STATUS_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ring_capacity: usize,
    pub frame_payload: usize,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub completion_timeout: Duration,
    pub slot_poll_interval: Duration,
    pub slot_poll_attempts: u32,
    pub settle_timeout: Duration,
    pub retry_completion: bool,
    pub fast_retransmit: bool,
    /// 0 retries forever.
    pub handshake_attempts: u32,
    /// 0 retries forever.
    pub request_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            frame_payload: DEFAULT_FRAME_PAYLOAD,
            handshake_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(200),
            chunk_timeout: Duration::from_millis(200),
            completion_timeout: Duration::from_millis(200),
            slot_poll_interval: Duration::from_millis(100),
            slot_poll_attempts: 100,
            settle_timeout: Duration::from_millis(5000),
            retry_completion: false,
            fast_retransmit: true,
            handshake_attempts: 0,
            request_attempts: 0,
        }
    }
}

impl EngineConfig {
    /// Blob bytes carried by one WRITE_DATA.
    pub fn chunk_size(&self) -> usize {
        self.frame_payload.saturating_sub(WRITE_DATA_HEADER_LEN)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no free transmit slot for sequence {sequence} after {waited_ms} ms ({in_flight} chunks in flight)")]
    SlotsExhausted {
        sequence: u32,
        in_flight: usize,
        waited_ms: u64,
    },
    #[error("blob of {0} bytes does not fit the 32-bit length field")]
    BlobTooLarge(usize),
    #[error("frame payload of {0} bytes leaves no room for chunk data")]
    PayloadTooSmall(usize),
    #[error("peer did not answer {phase} after {attempts} attempts")]
    PeerUnresponsive { phase: Phase, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Init,
    Requested,
    Transferring,
    Done,
}

#[derive(Debug)]
struct Transfer {
    request_id: u8,
    total_length: u32,
    chunk_count: u32,
    acked_count: u32,
    state: TransferState,
    next_sequence: u32,
    highest_acked: Option<u32>,
    retransmissions: u32,
    stale_acks: u32,
}

impl Transfer {
    fn new(request_id: u8, total_length: u32, chunk_count: u32) -> Self {
        Self {
            request_id,
            total_length,
            chunk_count,
            acked_count: 0,
            state: TransferState::Init,
            next_sequence: 0,
            highest_acked: None,
            retransmissions: 0,
            stale_acks: 0,
        }
    }

    fn advance(&mut self, to: TransferState) {
        info!(
            "transfer {}: {:?} -> {:?} ({}/{} chunks acked)",
            self.request_id, self.state, to, self.acked_count, self.chunk_count
        );
        self.state = to;
    }

    fn all_acked(&self) -> bool {
        self.acked_count >= self.chunk_count
    }
}

/// Outcome of one blob delivery.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub request_id: u8,
    pub total_length: u32,
    pub chunk_count: u32,
    pub acked_count: u32,
    pub retransmissions: u32,
    pub stale_acks: u32,
    pub completion_acked: bool,
    pub crc32: u32,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.acked_count == self.chunk_count && self.completion_acked
    }
}

enum PhaseOutcome {
    Replied,
    TimedOut,
}

enum Wake {
    Ack(AckEvent),
    Status(TxStatus),
    Missing(MissingNotice),
    Deadline,
}

pub struct ReliableSender<S: FrameSink> {
    sink: S,
    dest: Destination,
    queues: EventQueues,
    frame_ids: FrameIdAllocator,
    /// Frame ids sent whose delivery status has not come back yet.
    awaiting_status: HashMap<u8, Instant>,
    next_request_id: u8,
    timer_token: u64,
    cfg: EngineConfig,
}

impl<S: FrameSink> ReliableSender<S> {
    pub fn new(sink: S, dest: Destination, queues: EventQueues, cfg: EngineConfig) -> Self {
        Self {
            sink,
            dest,
            queues,
            frame_ids: FrameIdAllocator::new(),
            awaiting_status: HashMap::new(),
            // Random start so a peer that outlived our reboot cannot
            // mistake the first new transfer for an old one.
            next_request_id: rand::random(),
            timer_token: 0,
            cfg,
        }
    }

    pub fn with_first_request_id(mut self, request_id: u8) -> Self {
        self.next_request_id = request_id;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn queues(&self) -> &EventQueues {
        &self.queues
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Next frame id, skipping ids whose previous status is still due so a
    /// late status cannot be mistaken for the new frame's.
    fn next_frame_id(&mut self) -> u8 {
        let mut fid = self.frame_ids.next_id();
        for _ in 1..u8::MAX {
            match self.awaiting_status.get(&fid) {
                Some(sent) if sent.elapsed() < STATUS_GRACE => fid = self.frame_ids.next_id(),
                _ => break,
            }
        }
        self.awaiting_status.insert(fid, Instant::now());
        fid
    }

    fn status_arrived(&mut self, frame_id: u8) {
        self.awaiting_status.remove(&frame_id);
    }

    fn send_rf(&mut self, frame_id: u8, data: Vec<u8>) -> Result<(), TransportError> {
        let frame = self.dest.request(frame_id, data).into_frame();
        let sent = self.sink.send_frame(&frame);
        if sent.is_err() {
            // The radio never saw it, so no status will follow.
            self.status_arrived(frame_id);
        }
        sent
    }

    fn arm_phase_timer(&mut self, phase: Phase, after: Duration) -> (u64, TimerHandle) {
        self.timer_token += 1;
        let token = self.timer_token;
        let handle = timer::schedule(
            after,
            self.queues.acks.clone(),
            AckEvent::Timeout { phase, token },
        );
        (token, handle)
    }

    fn cancel_phase_timer(timer: TimerHandle, phase: Phase) {
        if timer.cancel() == CancelOutcome::AlreadyFired {
            trace!("{} timer fired before cancel; its timeout is stale", phase);
        }
    }

    async fn next_wake(&self, deadline: Option<Instant>, with_missing: bool) -> Wake {
        tokio::select! {
            ev = self.queues.acks.pop() => Wake::Ack(ev),
            st = self.queues.status.pop() => Wake::Status(st),
            n = self.queues.missing.pop(), if with_missing => Wake::Missing(n),
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => Wake::Deadline,
        }
    }

    fn is_reply(phase: Phase, request_id: u8, ev: &AckEvent) -> bool {
        match (phase, ev) {
            (Phase::Handshake, AckEvent::Hello { .. }) => true,
            (Phase::Request, AckEvent::WriteRequest { request_id: r, .. }) => *r == request_id,
            (Phase::Completion, AckEvent::WriteDone { request_id: r }) => *r == request_id,
            _ => false,
        }
    }

    /// Block until the phase's reply, its timer, or (handshake only) a
    /// successful delivery report for `frame_id`. Data acks and delivery
    /// reports for chunks keep being applied when a transfer is in progress.
    async fn await_phase(
        &mut self,
        phase: Phase,
        token: u64,
        frame_id: u8,
        request_id: u8,
        mut active: Option<(&mut TransmitRing<'_>, &mut Transfer)>,
    ) -> PhaseOutcome {
        loop {
            match self.next_wake(None, false).await {
                Wake::Ack(AckEvent::Timeout { phase: p, token: t }) => {
                    if p == phase && t == token {
                        return PhaseOutcome::TimedOut;
                    }
                    trace!("ignoring stale {} timeout", p);
                }
                Wake::Ack(ev) => {
                    if Self::is_reply(phase, request_id, &ev) {
                        return PhaseOutcome::Replied;
                    }
                    match (ev, active.as_mut()) {
                        (
                            AckEvent::WriteData {
                                request_id,
                                sequence,
                            },
                            Some((ring, transfer)),
                        ) => self.apply_data_ack(ring, transfer, request_id, sequence),
                        (other, _) => debug!("{}: ignoring {:?}", phase, other),
                    }
                }
                Wake::Status(st) if st.frame_id == frame_id => {
                    self.status_arrived(st.frame_id);
                    if st.is_success() {
                        if phase == Phase::Handshake {
                            debug!("handshake: radio confirmed delivery of fid {}", frame_id);
                            return PhaseOutcome::Replied;
                        }
                        trace!("{}: delivered (fid {})", phase, frame_id);
                    } else {
                        warn!(
                            "{}: radio reports delivery failure 0x{:02x} for fid {}",
                            phase, st.delivery_status, frame_id
                        );
                    }
                }
                Wake::Status(st) => match active.as_mut() {
                    Some((ring, transfer)) => self.handle_status(ring, transfer, st),
                    None => {
                        self.status_arrived(st.frame_id);
                        trace!("{}: ignoring status for fid {}", phase, st.frame_id)
                    }
                },
                Wake::Missing(_) | Wake::Deadline => {}
            }
        }
    }

    /// HELLO until the peer answers. Returns the number of attempts used.
    pub async fn handshake(&mut self) -> Result<u32, TransferError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let fid = self.next_frame_id();
            let hello = Message::Hello {
                text: format!("Hello Burst {}", fid),
            };
            info!("handshake: sending HELLO (fid={}, attempt {})", fid, attempts);
            if let Err(e) = self.send_rf(fid, hello.encode()) {
                warn!("handshake: send failed: {}", e);
            }
            let (token, timer) = self.arm_phase_timer(Phase::Handshake, self.cfg.handshake_timeout);
            let outcome = self
                .await_phase(Phase::Handshake, token, fid, 0, None)
                .await;
            Self::cancel_phase_timer(timer, Phase::Handshake);
            if let PhaseOutcome::Replied = outcome {
                info!("handshake complete after {} attempt(s)", attempts);
                return Ok(attempts);
            }
            if self.cfg.handshake_attempts > 0 && attempts >= self.cfg.handshake_attempts {
                return Err(TransferError::PeerUnresponsive {
                    phase: Phase::Handshake,
                    attempts,
                });
            }
            debug!("handshake: no answer within {:?}, retrying", self.cfg.handshake_timeout);
        }
    }

    async fn request_phase(&mut self, transfer: &mut Transfer) -> Result<(), TransferError> {
        let request = Message::WriteRequest {
            request_id: transfer.request_id,
            total_length: transfer.total_length,
            chunk_count: transfer.chunk_count,
        }
        .encode();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let fid = self.next_frame_id();
            debug!(
                "transfer {}: WRITE_REQUEST fid={} attempt {}",
                transfer.request_id, fid, attempts
            );
            if let Err(e) = self.send_rf(fid, request.clone()) {
                warn!("transfer {}: WRITE_REQUEST send failed: {}", transfer.request_id, e);
            }
            if transfer.state == TransferState::Init {
                transfer.advance(TransferState::Requested);
            }
            let (token, timer) = self.arm_phase_timer(Phase::Request, self.cfg.request_timeout);
            let outcome = self
                .await_phase(Phase::Request, token, fid, transfer.request_id, None)
                .await;
            Self::cancel_phase_timer(timer, Phase::Request);
            if let PhaseOutcome::Replied = outcome {
                transfer.advance(TransferState::Transferring);
                return Ok(());
            }
            if self.cfg.request_attempts > 0 && attempts >= self.cfg.request_attempts {
                return Err(TransferError::PeerUnresponsive {
                    phase: Phase::Request,
                    attempts,
                });
            }
        }
    }

    /// (Re)transmit the chunk held in `idx` with a fresh frame id and arm its
    /// missing timer.
    fn transmit_slot(
        &mut self,
        ring: &mut TransmitRing<'_>,
        transfer: &mut Transfer,
        idx: usize,
        resend: bool,
    ) {
        if let Some(old) = ring.take_timer(idx) {
            if old.cancel() == CancelOutcome::AlreadyFired {
                trace!("slot {}: previous timer already fired", idx);
            }
        }
        let fid = self.next_frame_id();
        let slot = ring.slot_mut(idx);
        slot.frame_id = fid;
        slot.attempt += 1;
        slot.state = if resend {
            SlotState::Resending
        } else {
            SlotState::Sent
        };
        slot.sent_at = Some(std::time::Instant::now());
        let (request_id, sequence, attempt, data) =
            (slot.request_id, slot.sequence, slot.attempt, slot.data);

        let notice = MissingNotice {
            request_id,
            sequence,
            attempt: Some(attempt),
        };
        let timer = timer::schedule(self.cfg.chunk_timeout, self.queues.missing.clone(), notice);
        ring.set_timer(idx, timer);

        match self.send_rf(fid, encode_write_data(request_id, sequence, data)) {
            Ok(()) => {
                if resend {
                    transfer.retransmissions += 1;
                    metrics::inc_chunk_retransmits();
                    debug!(
                        "chunk {}/{} resent (fid={}, attempt {})",
                        request_id, sequence, fid, attempt
                    );
                } else {
                    metrics::inc_chunks_sent();
                    trace!("chunk {}/{} sent (fid={}, {} bytes)", request_id, sequence, fid, data.len());
                }
            }
            Err(e) => {
                warn!(
                    "chunk {}/{} transmit failed: {}; queued for resend",
                    request_id, sequence, e
                );
                if let Some(t) = ring.take_timer(idx) {
                    t.cancel();
                }
                self.queues.missing.push(notice);
            }
        }
    }

    fn apply_data_ack(
        &self,
        ring: &mut TransmitRing<'_>,
        transfer: &mut Transfer,
        request_id: u8,
        sequence: u32,
    ) {
        let (matched, timer) = ring.ack(request_id, sequence);
        match matched {
            AckMatch::Acked(idx) => {
                transfer.acked_count += 1;
                metrics::inc_chunk_acks();
                if let Some(sent_at) = ring.slot(idx).sent_at {
                    metrics::observe_ack_latency(sent_at);
                }
                if let Some(t) = timer {
                    if t.cancel() == CancelOutcome::AlreadyFired {
                        debug!(
                            "chunk {}/{}: missing timer fired before ack; notice will be ignored",
                            request_id, sequence
                        );
                    }
                }
                trace!(
                    "chunk {}/{} acked ({}/{})",
                    request_id,
                    sequence,
                    transfer.acked_count,
                    transfer.chunk_count
                );
                if self.cfg.fast_retransmit {
                    self.detect_gap(ring, transfer, sequence);
                }
                transfer.highest_acked = Some(transfer.highest_acked.map_or(sequence, |h| h.max(sequence)));
            }
            AckMatch::Duplicate => trace!("duplicate ack for {}/{}", request_id, sequence),
            AckMatch::Stale => {
                transfer.stale_acks += 1;
                metrics::inc_stale_acks();
                debug!(
                    "discarding ack for {}/{}: no matching slot",
                    request_id, sequence
                );
            }
        }
    }

    /// An ack for `sequence` that jumps past the highest acked sequence
    /// implies the chunks in between were lost.
    fn detect_gap(&self, ring: &TransmitRing<'_>, transfer: &Transfer, sequence: u32) {
        let from = transfer.highest_acked.map_or(0, |h| h + 1);
        for s in from..sequence {
            if let Some(idx) = ring.find(transfer.request_id, s) {
                let slot = ring.slot(idx);
                if slot.state == SlotState::Sent {
                    debug!("chunk {}/{} skipped by peer ack; resending", transfer.request_id, s);
                    self.queues.missing.push(MissingNotice {
                        request_id: transfer.request_id,
                        sequence: s,
                        attempt: Some(slot.attempt),
                    });
                }
            }
        }
    }

    fn handle_status(&mut self, ring: &mut TransmitRing<'_>, transfer: &mut Transfer, st: TxStatus) {
        self.status_arrived(st.frame_id);
        let Some(idx) = ring.find_by_frame_id(st.frame_id) else {
            trace!("status for untracked fid {}", st.frame_id);
            return;
        };
        let slot = ring.slot(idx);
        if slot.request_id != transfer.request_id || st.is_success() {
            return;
        }
        warn!(
            "chunk {}/{}: delivery failed (status 0x{:02x}, {} retries)",
            slot.request_id, slot.sequence, st.delivery_status, st.retry_count
        );
        self.queues.missing.push(MissingNotice {
            request_id: slot.request_id,
            sequence: slot.sequence,
            attempt: Some(slot.attempt),
        });
    }

    fn handle_transfer_ack(&self, ring: &mut TransmitRing<'_>, transfer: &mut Transfer, ev: AckEvent) {
        match ev {
            AckEvent::WriteData {
                request_id,
                sequence,
            } => self.apply_data_ack(ring, transfer, request_id, sequence),
            AckEvent::Timeout { phase, .. } => trace!("ignoring stale {} timeout", phase),
            other => debug!("transfer {}: ignoring {:?}", transfer.request_id, other),
        }
    }

    /// Apply everything already queued on the ack and status queues.
    fn service_events(&mut self, ring: &mut TransmitRing<'_>, transfer: &mut Transfer) {
        for st in self.queues.status.drain() {
            self.handle_status(ring, transfer, st);
        }
        while let Some(ev) = self.queues.acks.try_pop() {
            self.handle_transfer_ack(ring, transfer, ev);
        }
    }

    /// Returns the notice when its chunk has not been assigned yet and should
    /// be retried on a later pass.
    fn handle_missing(
        &mut self,
        ring: &mut TransmitRing<'_>,
        transfer: &mut Transfer,
        notice: MissingNotice,
    ) -> Option<MissingNotice> {
        if notice.request_id != transfer.request_id {
            debug!(
                "dropping missing notice for old transfer {}/{}",
                notice.request_id, notice.sequence
            );
            return None;
        }
        match ring.find(notice.request_id, notice.sequence) {
            Some(idx) => {
                let slot = ring.slot(idx);
                if slot.state == SlotState::Acked {
                    trace!("chunk {}/{} already acked", notice.request_id, notice.sequence);
                    return None;
                }
                if let Some(attempt) = notice.attempt {
                    if attempt != slot.attempt {
                        trace!(
                            "chunk {}/{}: notice for attempt {} superseded by {}",
                            notice.request_id,
                            notice.sequence,
                            attempt,
                            slot.attempt
                        );
                        return None;
                    }
                }
                self.transmit_slot(ring, transfer, idx, true);
                None
            }
            None if notice.sequence >= transfer.next_sequence
                && notice.sequence < transfer.chunk_count =>
            {
                trace!("chunk {}/{} not sent yet; deferring", notice.request_id, notice.sequence);
                Some(notice)
            }
            None => {
                debug!(
                    "dropping missing notice for {}/{}: slot no longer holds it",
                    notice.request_id, notice.sequence
                );
                None
            }
        }
    }

    /// One recovery pass over a snapshot of the missing queue.
    fn recover(&mut self, ring: &mut TransmitRing<'_>, transfer: &mut Transfer) {
        let pending = self.queues.missing.drain();
        if pending.is_empty() {
            return;
        }
        trace!("recovery pass over {} notice(s)", pending.len());
        let mut deferred = Vec::new();
        for notice in pending {
            if let Some(n) = self.handle_missing(ring, transfer, notice) {
                deferred.push(n);
            }
        }
        for n in deferred {
            self.queues.missing.push(n);
        }
    }

    async fn acquire_slot(
        &mut self,
        ring: &mut TransmitRing<'_>,
        transfer: &mut Transfer,
        sequence: u32,
    ) -> Result<usize, TransferError> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            if let Some(idx) = ring.acquire(sequence) {
                if polls > 0 {
                    debug!("slot {} free for sequence {} after {} poll(s)", idx, sequence, polls);
                }
                return Ok(idx);
            }
            if polls >= self.cfg.slot_poll_attempts {
                return Err(TransferError::SlotsExhausted {
                    sequence,
                    in_flight: ring.in_flight(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if polls == 0 {
                debug!(
                    "transfer {}: ring full at sequence {}, waiting for acks",
                    transfer.request_id, sequence
                );
            }
            polls += 1;
            tokio::time::sleep(self.cfg.slot_poll_interval).await;
            self.service_events(ring, transfer);
            self.recover(ring, transfer);
        }
    }

    async fn send_chunks<'b>(
        &mut self,
        ring: &mut TransmitRing<'b>,
        transfer: &mut Transfer,
        blob: &'b [u8],
        chunk_size: usize,
    ) -> Result<(), TransferError> {
        for sequence in 0..transfer.chunk_count {
            self.service_events(ring, transfer);
            let idx = self.acquire_slot(ring, transfer, sequence).await?;
            let start = sequence as usize * chunk_size;
            let end = (start + chunk_size).min(blob.len());
            ring.assign(idx, transfer.request_id, sequence, &blob[start..end]);
            transfer.next_sequence = sequence + 1;
            self.transmit_slot(ring, transfer, idx, false);
            self.service_events(ring, transfer);
            self.recover(ring, transfer);
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Keep servicing acks and resends until every chunk is acked or the
    /// settle window closes.
    async fn settle(&mut self, ring: &mut TransmitRing<'_>, transfer: &mut Transfer) {
        self.service_events(ring, transfer);
        self.recover(ring, transfer);
        let deadline = Instant::now() + self.cfg.settle_timeout;
        while !transfer.all_acked() {
            match self.next_wake(Some(deadline), true).await {
                Wake::Ack(ev) => self.handle_transfer_ack(ring, transfer, ev),
                Wake::Status(st) => self.handle_status(ring, transfer, st),
                Wake::Missing(n) => {
                    if let Some(n) = self.handle_missing(ring, transfer, n) {
                        self.queues.missing.push(n);
                    }
                }
                Wake::Deadline => {
                    warn!(
                        "transfer {}: {} of {} chunks unacked after {:?}",
                        transfer.request_id,
                        transfer.chunk_count - transfer.acked_count,
                        transfer.chunk_count,
                        self.cfg.settle_timeout
                    );
                    break;
                }
            }
        }
    }

    /// Returns whether WRITE_DONE was acknowledged.
    async fn completion_phase(
        &mut self,
        ring: &mut TransmitRing<'_>,
        transfer: &mut Transfer,
    ) -> Result<bool, TransferError> {
        let done = Message::WriteDone {
            request_id: transfer.request_id,
            total_length: transfer.total_length,
            chunk_count: transfer.chunk_count,
        }
        .encode();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let fid = self.next_frame_id();
            debug!(
                "transfer {}: WRITE_DONE fid={} attempt {}",
                transfer.request_id, fid, attempts
            );
            if let Err(e) = self.send_rf(fid, done.clone()) {
                warn!("transfer {}: WRITE_DONE send failed: {}", transfer.request_id, e);
            }
            let (token, timer) =
                self.arm_phase_timer(Phase::Completion, self.cfg.completion_timeout);
            let outcome = self
                .await_phase(
                    Phase::Completion,
                    token,
                    fid,
                    transfer.request_id,
                    Some((&mut *ring, &mut *transfer)),
                )
                .await;
            Self::cancel_phase_timer(timer, Phase::Completion);
            match outcome {
                PhaseOutcome::Replied => return Ok(true),
                PhaseOutcome::TimedOut if !self.cfg.retry_completion => {
                    warn!(
                        "transfer {}: WRITE_DONE not acknowledged within {:?}",
                        transfer.request_id, self.cfg.completion_timeout
                    );
                    return Ok(false);
                }
                PhaseOutcome::TimedOut => {
                    if self.cfg.request_attempts > 0 && attempts >= self.cfg.request_attempts {
                        return Err(TransferError::PeerUnresponsive {
                            phase: Phase::Completion,
                            attempts,
                        });
                    }
                    // The peer may have asked for chunks instead of acking.
                    self.recover(ring, transfer);
                }
            }
        }
    }

    /// Deliver one blob: request, chunks with recovery, completion.
    pub async fn send_blob(&mut self, blob: &[u8]) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        let chunk_size = self.cfg.chunk_size();
        if chunk_size == 0 {
            return Err(TransferError::PayloadTooSmall(self.cfg.frame_payload));
        }
        let total_length =
            u32::try_from(blob.len()).map_err(|_| TransferError::BlobTooLarge(blob.len()))?;
        let chunk_count = blob.len().div_ceil(chunk_size) as u32;

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let leftover = self.queues.missing.drain().len();
        if leftover > 0 {
            debug!("discarded {} missing notice(s) from an earlier transfer", leftover);
        }

        let mut transfer = Transfer::new(request_id, total_length, chunk_count);
        info!(
            "transfer {}: {} bytes in {} chunk(s) of up to {} bytes",
            request_id, total_length, chunk_count, chunk_size
        );

        if let Err(e) = self.request_phase(&mut transfer).await {
            metrics::inc_transfers_failed();
            error!("transfer {} aborted: {}", request_id, e);
            return Err(e);
        }

        let mut ring = TransmitRing::new(self.cfg.ring_capacity);
        if let Err(e) = self
            .send_chunks(&mut ring, &mut transfer, blob, chunk_size)
            .await
        {
            ring.cancel_all_timers();
            metrics::inc_transfers_failed();
            error!("transfer {} aborted: {}", request_id, e);
            return Err(e);
        }

        self.settle(&mut ring, &mut transfer).await;
        let completion = self.completion_phase(&mut ring, &mut transfer).await;
        ring.cancel_all_timers();
        let completion_acked = match completion {
            Ok(acked) => acked,
            Err(e) => {
                metrics::inc_transfers_failed();
                error!("transfer {} aborted: {}", request_id, e);
                return Err(e);
            }
        };
        transfer.advance(TransferState::Done);

        let report = TransferReport {
            request_id,
            total_length,
            chunk_count,
            acked_count: transfer.acked_count,
            retransmissions: transfer.retransmissions,
            stale_acks: transfer.stale_acks,
            completion_acked,
            crc32: blob_crc(blob),
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        };
        if report.is_complete() {
            metrics::inc_transfers_completed();
            info!(
                "transfer {} complete: {} bytes, {} resend(s), {} ms",
                request_id, total_length, report.retransmissions, report.elapsed_ms
            );
        } else {
            metrics::inc_transfers_failed();
            warn!(
                "transfer {} finished incomplete: {}/{} chunks acked, done ack {}",
                request_id, report.acked_count, chunk_count, completion_acked
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xbee::codec::Frame;

    /// Sink that records frames and never answers.
    #[derive(Default)]
    struct Silent {
        frames: Vec<Frame>,
    }

    impl FrameSink for Silent {
        fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
            self.frames.push(frame.clone());
            Ok(())
        }
    }

    fn fast_cfg() -> EngineConfig {
        EngineConfig {
            handshake_timeout: Duration::from_millis(20),
            request_timeout: Duration::from_millis(20),
            chunk_timeout: Duration::from_millis(20),
            completion_timeout: Duration::from_millis(20),
            slot_poll_interval: Duration::from_millis(5),
            slot_poll_attempts: 4,
            settle_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn default_chunk_size_leaves_room_for_header() {
        assert_eq!(EngineConfig::default().chunk_size(), 74);
    }

    #[tokio::test]
    async fn bounded_handshake_gives_up() {
        let cfg = EngineConfig {
            handshake_attempts: 3,
            ..fast_cfg()
        };
        let mut sender = ReliableSender::new(
            Silent::default(),
            Destination::new(0x0013A20041C17206),
            EventQueues::default(),
            cfg,
        );
        let err = sender.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::PeerUnresponsive {
                phase: Phase::Handshake,
                attempts: 3
            }
        ));
        assert_eq!(sender.sink().frames.len(), 3);
        // Each HELLO used a fresh frame id.
        let ids: Vec<u8> = sender.sink().frames.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn successful_delivery_status_completes_handshake() {
        let queues = EventQueues::default();
        let mut sender = ReliableSender::new(
            Silent::default(),
            Destination::new(1),
            queues.clone(),
            fast_cfg(),
        );
        queues.status.push(TxStatus {
            frame_id: 1,
            remote16: 0,
            retry_count: 0,
            delivery_status: 0,
            discovery_status: 0,
        });
        assert_eq!(sender.handshake().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slot_exhaustion_aborts_transfer() {
        let queues = EventQueues::default();
        let cfg = EngineConfig {
            ring_capacity: 2,
            request_attempts: 1,
            ..fast_cfg()
        };
        let mut sender =
            ReliableSender::new(Silent::default(), Destination::new(1), queues.clone(), cfg)
                .with_first_request_id(9);
        queues.acks.push(AckEvent::WriteRequest {
            request_id: 9,
            total_length: 400,
        });
        let blob = vec![0x55u8; 400];
        let err = sender.send_blob(&blob).await.unwrap_err();
        assert!(
            matches!(err, TransferError::SlotsExhausted { sequence: 2, in_flight: 2, .. }),
            "unexpected {:?}",
            err
        );
    }

    /// Sink whose writes always fail.
    struct Unplugged;

    impl FrameSink for Unplugged {
        fn send_frame(&mut self, _frame: &Frame) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn frame_id_with_status_outstanding_is_not_reused() {
        let mut sender = ReliableSender::new(
            Silent::default(),
            Destination::new(1),
            EventQueues::default(),
            fast_cfg(),
        );
        let first: Vec<u8> = (0..255).map(|_| sender.next_frame_id()).collect();
        assert_eq!(first, (1..=255).collect::<Vec<u8>>());

        // Only fid 3 has been answered; 1 and 2 are still due.
        sender.status_arrived(3);
        assert_eq!(sender.next_frame_id(), 3);
        sender.status_arrived(9);
        assert_eq!(sender.next_frame_id(), 9);
    }

    #[test]
    fn allocation_falls_back_when_every_id_is_due() {
        let mut sender = ReliableSender::new(
            Silent::default(),
            Destination::new(1),
            EventQueues::default(),
            fast_cfg(),
        );
        for _ in 0..255 {
            sender.next_frame_id();
        }
        assert_ne!(sender.next_frame_id(), 0);
        assert_eq!(sender.awaiting_status.len(), 255);
    }

    #[tokio::test]
    async fn failed_write_releases_its_frame_id() {
        let cfg = EngineConfig {
            handshake_attempts: 2,
            ..fast_cfg()
        };
        let mut sender =
            ReliableSender::new(Unplugged, Destination::new(1), EventQueues::default(), cfg);
        assert!(sender.handshake().await.is_err());
        assert!(sender.awaiting_status.is_empty());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let cfg = EngineConfig {
            frame_payload: 6,
            ..fast_cfg()
        };
        let mut sender =
            ReliableSender::new(Silent::default(), Destination::new(1), EventQueues::default(), cfg);
        assert!(matches!(
            sender.send_blob(b"abc").await,
            Err(TransferError::PayloadTooSmall(6))
        ));
    }
}
