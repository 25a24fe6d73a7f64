//! End-to-end transfers against the loopback peer, with and without loss.

mod common;

use common::{failing_sender, fast_engine, loopback_sender, lossy_sender, pattern};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use zbcam::transfer::loopback::Direction;
use zbcam::transfer::{EngineConfig, Message};

fn counts(seen: &[(u8, u32)]) -> HashMap<u32, usize> {
    let mut m = HashMap::new();
    for &(_, seq) in seen {
        *m.entry(seq).or_insert(0) += 1;
    }
    m
}

#[tokio::test]
async fn blob_larger_than_ring_arrives_intact() {
    let blob = pattern(74 * 60 + 10);
    let mut sender = loopback_sender(fast_engine());
    sender.handshake().await.expect("handshake");
    let report = sender.send_blob(&blob).await.expect("transfer");

    assert_eq!(report.chunk_count, 61);
    assert!(report.is_complete(), "report: {:?}", report);
    assert_eq!(report.retransmissions, 0);

    let peer = sender.sink_mut();
    let seen: Vec<u32> = peer.data_seen().iter().map(|&(_, s)| s).collect();
    assert_eq!(seen, (0..61).collect::<Vec<u32>>());
    let blobs = peer.take_completed();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].data, blob);
    assert_eq!(blobs[0].crc32, report.crc32);
}

#[tokio::test]
async fn lost_data_ack_resends_only_that_chunk() {
    let mut dropped = false;
    let mut sender = lossy_sender(fast_engine(), move |dir, msg| match (dir, msg) {
        (Direction::Downlink, Message::WriteDataAck { sequence: 5, .. }) if !dropped => {
            dropped = true;
            true
        }
        _ => false,
    });
    let blob = pattern(74 * 30);
    let report = sender.send_blob(&blob).await.expect("transfer");
    assert!(report.is_complete());

    let seen = counts(sender.sink().data_seen());
    assert!(seen[&5] >= 2, "chunk 5 was not resent: {:?}", seen);
    for (seq, n) in &seen {
        if *seq != 5 {
            assert_eq!(*n, 1, "acked chunk {} was retransmitted", seq);
        }
    }
    assert_eq!(sender.sink_mut().take_completed()[0].data, blob);
}

#[tokio::test]
async fn chunk_lost_on_the_way_out_is_recovered() {
    let mut dropped = false;
    let mut sender = lossy_sender(fast_engine(), move |dir, msg| match (dir, msg) {
        (Direction::Uplink, Message::WriteData { sequence: 3, .. }) if !dropped => {
            dropped = true;
            true
        }
        _ => false,
    });
    let blob = pattern(500);
    let report = sender.send_blob(&blob).await.expect("transfer");
    assert!(report.is_complete());
    assert!(report.retransmissions >= 1);
    assert_eq!(sender.sink_mut().take_completed()[0].data, blob);
}

#[tokio::test]
async fn last_chunk_ack_loss_recovers_by_timer() {
    let blob = pattern(74 * 4);
    let mut dropped = false;
    let mut sender = lossy_sender(fast_engine(), move |dir, msg| match (dir, msg) {
        (Direction::Downlink, Message::WriteDataAck { sequence: 3, .. }) if !dropped => {
            dropped = true;
            true
        }
        _ => false,
    });
    let report = sender.send_blob(&blob).await.expect("transfer");
    assert!(report.is_complete(), "report: {:?}", report);
    assert_eq!(counts(sender.sink().data_seen())[&3], 2);
}

#[tokio::test]
async fn lost_request_ack_is_retried() {
    let mut dropped = false;
    let mut sender = lossy_sender(fast_engine(), move |dir, msg| match (dir, msg) {
        (Direction::Downlink, Message::WriteRequestAck { .. }) if !dropped => {
            dropped = true;
            true
        }
        _ => false,
    });
    let report = sender.send_blob(b"short blob").await.expect("transfer");
    assert!(report.is_complete());
    assert_eq!(report.chunk_count, 1);
}

#[tokio::test]
async fn missing_done_ack_is_reported_not_retried() {
    let mut sender = lossy_sender(fast_engine(), |dir, msg| {
        dir == Direction::Downlink && matches!(msg, Message::WriteDoneAck { .. })
    });
    let report = sender.send_blob(&pattern(300)).await.expect("transfer");
    assert_eq!(report.acked_count, report.chunk_count);
    assert!(!report.completion_acked);
    assert!(!report.is_complete());
}

#[tokio::test]
async fn completion_retry_when_enabled() {
    let cfg = EngineConfig {
        retry_completion: true,
        ..fast_engine()
    };
    let mut dropped = false;
    let mut sender = lossy_sender(cfg, move |dir, msg| match (dir, msg) {
        (Direction::Downlink, Message::WriteDoneAck { .. }) if !dropped => {
            dropped = true;
            true
        }
        _ => false,
    });
    let report = sender.send_blob(&pattern(300)).await.expect("transfer");
    assert!(report.completion_acked);
}

#[tokio::test]
async fn sustained_loss_still_converges() {
    let mut acks = 0u32;
    let mut chunks = 0u32;
    let mut sender = lossy_sender(fast_engine(), move |dir, msg| match (dir, msg) {
        (Direction::Downlink, Message::WriteDataAck { .. }) => {
            acks += 1;
            acks % 3 == 0
        }
        (Direction::Uplink, Message::WriteData { .. }) => {
            chunks += 1;
            chunks % 5 == 0
        }
        _ => false,
    });
    let blob = pattern(74 * 50);
    let report = sender.send_blob(&blob).await.expect("transfer");
    assert!(report.is_complete(), "report: {:?}", report);
    assert!(report.retransmissions > 0);
    assert_eq!(sender.sink_mut().take_completed()[0].data, blob);
}

#[tokio::test]
async fn empty_blob_completes() {
    let mut sender = loopback_sender(fast_engine());
    let report = sender.send_blob(&[]).await.expect("transfer");
    assert_eq!(report.chunk_count, 0);
    assert!(report.is_complete());
    assert_eq!(sender.sink_mut().take_completed()[0].data.len(), 0);
}

#[tokio::test]
async fn request_ids_increment_and_wrap() {
    let mut sender = loopback_sender(fast_engine()).with_first_request_id(255);
    let first = sender.send_blob(b"one").await.expect("first");
    let second = sender.send_blob(b"two").await.expect("second");
    assert_eq!(first.request_id, 255);
    assert_eq!(second.request_id, 0);
    let blobs = sender.sink_mut().take_completed();
    assert_eq!(blobs.len(), 2);
    assert_eq!(blobs[1].data, b"two");
}

#[tokio::test]
async fn peer_commands_land_in_command_queue() {
    let mut sender = loopback_sender(fast_engine());
    sender.sink_mut().send_command(0x42).expect("command");
    sender.sink_mut().send_command(0x43).expect("command");
    assert_eq!(sender.queues().commands.drain(), vec![0x42, 0x43]);
}

/// Chunk timers long enough that only the immediate failure path can
/// finish these transfers inside the settle window.
fn slow_timer_engine() -> EngineConfig {
    EngineConfig {
        chunk_timeout: Duration::from_secs(30),
        ..fast_engine()
    }
}

#[tokio::test]
async fn failed_transmit_is_queued_for_resend_at_once() {
    let mut failed = false;
    let mut sender = failing_sender(slow_timer_engine(), move |msg| match msg {
        Message::WriteData { sequence: 4, .. } if !failed => {
            failed = true;
            true
        }
        _ => false,
    });
    let blob = pattern(74 * 10);
    let started = Instant::now();
    let report = sender.send_blob(&blob).await.expect("transfer");

    assert!(report.is_complete(), "report: {:?}", report);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.retransmissions, 1);
    assert_eq!(sender.sink().failures.len(), 1);

    let seen = counts(sender.sink().inner.data_seen());
    assert_eq!(seen[&4], 1);
    assert_eq!(sender.sink_mut().inner.take_completed()[0].data, blob);
}

#[tokio::test]
async fn failed_resend_is_queued_again() {
    let mut failures = 0;
    let mut sender = failing_sender(slow_timer_engine(), move |msg| match msg {
        // First transmission and first resend of chunk 7 both fail.
        Message::WriteData { sequence: 7, .. } if failures < 2 => {
            failures += 1;
            true
        }
        _ => false,
    });
    let blob = pattern(74 * 12 + 3);
    let started = Instant::now();
    let report = sender.send_blob(&blob).await.expect("transfer");

    assert!(report.is_complete(), "report: {:?}", report);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sender.sink().failures.len(), 2);
    assert_eq!(report.retransmissions, 1);

    let seen = counts(sender.sink().inner.data_seen());
    assert_eq!(seen[&7], 1);
    for (seq, n) in &seen {
        assert_eq!(*n, 1, "chunk {} reached the peer {} times", seq, n);
    }
    assert_eq!(sender.sink_mut().inner.take_completed()[0].data, blob);
}
