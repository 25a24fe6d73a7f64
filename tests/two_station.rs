//! Sender and Listener talking through a simulated radio pair: every frame is
//! serialized, checksummed and parsed on both ends.

mod common;

use common::{fast_engine, pattern};
use tokio::sync::mpsc;
use zbcam::transfer::{EventQueues, EventRouter, ReliableSender};
use zbcam::uplink::Listener;
use zbcam::xbee::api::{delivery, RxPacket, TxRequest, TxStatus};
use zbcam::xbee::codec::{DecodeEvent, Frame, FrameDecoder};
use zbcam::xbee::{Destination, FrameReader, FrameSink, TransportError};

const CAMERA: u64 = 0x0013A200AAAA0001;
const BASE: u64 = 0x0013A200BBBB0002;

/// Serial line into a radio: encoded bytes go into a channel.
struct Wire(mpsc::UnboundedSender<Vec<u8>>);

impl FrameSink for Wire {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.0.send(bytes).map_err(|_| TransportError::Closed)
    }
}

/// What a radio does with bytes from its host: a transmit status back to
/// the host and a receive packet out of the far radio.
fn radio(bytes: &[u8], from: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    FrameDecoder::default()
        .push_slice(bytes)
        .into_iter()
        .filter_map(|ev| match ev {
            DecodeEvent::Frame(f) if f.is_ok() => {
                let frame = Frame::new(f.api_id, f.frame_id(), f.payload().to_vec());
                let req = TxRequest::from_frame(&frame).ok()?;
                let status = TxStatus {
                    frame_id: req.frame_id,
                    remote16: 0x0001,
                    retry_count: 0,
                    delivery_status: delivery::SUCCESS,
                    discovery_status: 0,
                }
                .to_frame()
                .encode()
                .ok()?;
                let rx = RxPacket {
                    src64: from,
                    src16: 0x0002,
                    options: 0x01,
                    data: req.data,
                }
                .to_frame()
                .encode()
                .ok()?;
                Some((status, rx))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn camera_blob_reaches_base_station_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (cam_tx, mut cam_out) = mpsc::unbounded_channel::<Vec<u8>>();
    let (base_tx, mut base_out) = mpsc::unbounded_channel::<Vec<u8>>();

    let queues = EventQueues::default();
    let mut cam_reader = FrameReader::new(std::io::empty(), 110);
    cam_reader.on_frame(EventRouter::new(queues.clone()).only_from(BASE).into_callback());

    let mut listener = Listener::new(Wire(base_tx), Destination::new(0), dir.path()).only_from(CAMERA);
    let air = tokio::spawn(async move {
        let mut base_decoder = FrameDecoder::default();
        let mut stored = Vec::new();
        loop {
            tokio::select! {
                bytes = cam_out.recv() => {
                    let Some(bytes) = bytes else { break };
                    for (status, rx) in radio(&bytes, CAMERA) {
                        cam_reader.feed(&status);
                        for ev in base_decoder.push_slice(&rx) {
                            if let DecodeEvent::Frame(f) = ev {
                                if let Some(path) = listener.handle_frame(f).await.expect("listener") {
                                    stored.push(path);
                                }
                            }
                        }
                    }
                }
                Some(bytes) = base_out.recv() => {
                    for (_status, rx) in radio(&bytes, BASE) {
                        cam_reader.feed(&rx);
                    }
                }
            }
        }
        stored
    });

    let mut camera =
        ReliableSender::new(Wire(cam_tx), Destination::new(BASE), queues, fast_engine());
    camera.handshake().await.expect("handshake");
    let blob = pattern(2000);
    let report = camera.send_blob(&blob).await.expect("transfer");
    assert!(report.is_complete(), "report: {:?}", report);
    assert_eq!(report.chunk_count, 28);

    // Closing the camera's line ends the air task.
    drop(camera);
    let stored = air.await.expect("air task");
    assert_eq!(stored.len(), 1);
    assert_eq!(std::fs::read(&stored[0]).expect("stored blob"), blob);
}
