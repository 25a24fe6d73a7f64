//! Decoder behaviour over generated traffic: arbitrary payloads survive the
//! wire, corruption is caught, and the decoder resynchronizes after noise.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zbcam::xbee::codec::{
    encode, DecodeEvent, DecodeStatus, FrameDecoder, DEFAULT_MAX_FRAME_DATA, START_BYTE,
};

fn frames(events: Vec<DecodeEvent>) -> Vec<zbcam::xbee::ResponseFrame> {
    events
        .into_iter()
        .filter_map(|ev| match ev {
            DecodeEvent::Frame(f) => Some(f),
            DecodeEvent::Dropped { .. } => None,
        })
        .collect()
}

#[test]
fn arbitrary_payloads_survive_the_wire() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut dec = FrameDecoder::default();
    for _ in 0..500 {
        let len = rng.gen_range(0..DEFAULT_MAX_FRAME_DATA);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let api_id: u8 = rng.gen();
        let fid: u8 = rng.gen();
        let wire = encode(api_id, fid, &payload).expect("encode");
        // Only the leading byte is an unescaped start byte.
        assert!(wire[1..].iter().all(|&b| b != START_BYTE));

        let got = frames(dec.push_slice(&wire));
        assert_eq!(got.len(), 1);
        let f = &got[0];
        assert_eq!(f.status, DecodeStatus::NoError);
        assert_eq!(f.api_id, api_id);
        assert_eq!(f.frame_id(), fid);
        assert_eq!(f.payload(), &payload[..]);
        assert!(!dec.in_frame());
    }
}

#[test]
fn any_single_bit_flip_in_the_body_fails_the_checksum() {
    let payload = b"\x14\x07\x00\x00\x00\x2a".to_vec();
    let wire = encode(0x90, 0x13, &payload).expect("encode");
    // Flip bits in API id, frame id and payload bytes, avoiding any byte
    // that would turn into a framing byte.
    for pos in 3..wire.len() - 1 {
        for bit in 0..8 {
            let mut corrupt = wire.clone();
            corrupt[pos] ^= 1 << bit;
            if [0x7E, 0x7D, 0x11, 0x13].contains(&corrupt[pos]) || [0x7D].contains(&wire[pos]) {
                continue;
            }
            let got = frames(FrameDecoder::default().push_slice(&corrupt));
            assert_eq!(got.len(), 1, "pos {} bit {}", pos, bit);
            assert_eq!(got[0].status, DecodeStatus::ChecksumFailure, "pos {} bit {}", pos, bit);
        }
    }
}

#[test]
fn resynchronizes_after_garbage_and_truncation() {
    let good = encode(0x8B, 7, &[0xFF, 0xFE, 0, 0, 0]).expect("encode");
    let mut stream = vec![0x00, 0x42, 0x13];
    // A frame cut short by the next start byte.
    stream.extend_from_slice(&good[..5]);
    stream.extend_from_slice(&good);
    stream.extend_from_slice(&[0xAA, 0xBB]);
    stream.extend_from_slice(&good);

    let got = frames(FrameDecoder::default().push_slice(&stream));
    let statuses: Vec<DecodeStatus> = got.iter().map(|f| f.status).collect();
    assert_eq!(
        statuses,
        vec![
            DecodeStatus::UnexpectedStartByte,
            DecodeStatus::NoError,
            DecodeStatus::NoError
        ]
    );
    assert_eq!(got[1].frame_id(), 7);
}

#[test]
fn oversized_declaration_is_dropped_and_decoder_recovers() {
    let mut dec = FrameDecoder::new(20);
    let events = dec.push_slice(&[START_BYTE, 0x00, 0x40]);
    assert!(matches!(
        events.as_slice(),
        [DecodeEvent::Dropped {
            status: DecodeStatus::PacketExceedsByteArrayLength,
            declared_len: 0x40
        }]
    ));
    let ok = encode(0x8A, 0, &[]).expect("encode");
    assert_eq!(frames(dec.push_slice(&ok)).len(), 1);
}
