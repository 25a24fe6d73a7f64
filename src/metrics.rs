//! Process-wide link and transfer counters.
//!
//! Counters are relaxed atomics; a [`snapshot`] is a best-effort view suitable
//! for logs and the CLI report, not a consistent cut.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static CHECKSUM_FAILURES: AtomicU64 = AtomicU64::new(0);
static UNEXPECTED_START: AtomicU64 = AtomicU64::new(0);
static OVERSIZE_DROPS: AtomicU64 = AtomicU64::new(0);
static CHUNKS_SENT: AtomicU64 = AtomicU64::new(0);
static CHUNK_RETRANSMITS: AtomicU64 = AtomicU64::new(0);
static CHUNK_ACKS: AtomicU64 = AtomicU64::new(0);
static STALE_ACKS: AtomicU64 = AtomicU64::new(0);
static QUEUE_OVERFLOW_DROPS: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_FAILED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_sent() {
    FRAMES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_checksum_failures() {
    CHECKSUM_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unexpected_start() {
    UNEXPECTED_START.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_oversize_drops() {
    OVERSIZE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunks_sent() {
    CHUNKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunk_retransmits() {
    CHUNK_RETRANSMITS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunk_acks() {
    CHUNK_ACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_stale_acks() {
    STALE_ACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_queue_overflow_drops() {
    QUEUE_OVERFLOW_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transfers_completed() {
    TRANSFERS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transfers_failed() {
    TRANSFERS_FAILED.fetch_add(1, Ordering::Relaxed);
}

/// Record time from a chunk's latest transmission to its ack.
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub checksum_failures: u64,
    pub unexpected_start: u64,
    pub oversize_drops: u64,
    pub chunks_sent: u64,
    pub chunk_retransmits: u64,
    pub chunk_acks: u64,
    pub stale_acks: u64,
    pub queue_overflow_drops: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
        frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
        checksum_failures: CHECKSUM_FAILURES.load(Ordering::Relaxed),
        unexpected_start: UNEXPECTED_START.load(Ordering::Relaxed),
        oversize_drops: OVERSIZE_DROPS.load(Ordering::Relaxed),
        chunks_sent: CHUNKS_SENT.load(Ordering::Relaxed),
        chunk_retransmits: CHUNK_RETRANSMITS.load(Ordering::Relaxed),
        chunk_acks: CHUNK_ACKS.load(Ordering::Relaxed),
        stale_acks: STALE_ACKS.load(Ordering::Relaxed),
        queue_overflow_drops: QUEUE_OVERFLOW_DROPS.load(Ordering::Relaxed),
        transfers_completed: TRANSFERS_COMPLETED.load(Ordering::Relaxed),
        transfers_failed: TRANSFERS_FAILED.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_increase() {
        let before = snapshot();
        inc_chunks_sent();
        inc_stale_acks();
        observe_ack_latency(Instant::now());
        let after = snapshot();
        assert!(after.chunks_sent > before.chunks_sent);
        assert!(after.stale_acks > before.stale_acks);
        assert!(after.ack_latency_avg_ms.is_some());
    }
}
