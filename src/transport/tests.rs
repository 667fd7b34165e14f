use std::time::Duration;

use zeroize::Zeroizing;

use super::*;
use crate::protocol::rtp::RtpHeader;
use crate::session::keys::{KeyVault, derive_stream_key};
use crate::types::TransportConfig;

const SESSION: u64 = 9;
const CONNECTION_ID: u64 = 0x0102_0304_0506_0708;

fn vault() -> KeyVault {
    let vault = KeyVault::new();
    vault.install(Zeroizing::new([0x42; 32])).unwrap();
    vault
}

fn channel_with_hold(kind: StreamKind, startup_hold: Duration) -> TransportChannel {
    let config = TransportConfig {
        startup_hold,
        ..TransportConfig::default()
    };
    TransportChannel::new(SESSION, kind, CONNECTION_ID, &vault(), &config).unwrap()
}

/// A channel that starts releasing at its first packet
fn channel(kind: StreamKind) -> TransportChannel {
    channel_with_hold(kind, Duration::ZERO)
}

fn sealed(kind: StreamKind, extended: u64, marker: bool, body: &[u8]) -> Vec<u8> {
    let key = derive_stream_key(&[0x42; 32], kind, CONNECTION_ID).unwrap();
    let payload_type = match kind {
        StreamKind::Video => PayloadType::Video,
        StreamKind::Audio => PayloadType::Audio,
    };
    #[allow(clippy::cast_possible_truncation)]
    let header = RtpHeader::new(payload_type, extended as u16, 1000, 0xAB).with_marker(marker);
    let header = header.encode();
    let mut packet = header.to_vec();
    packet.extend(seal(&key, extended, &header, body).unwrap());
    packet
}

fn sequences(packets: &[PlainPacket]) -> Vec<u64> {
    packets.iter().map(|p| p.sequence).collect()
}

// --- ReorderBuffer ---

#[test]
fn test_in_order_passes_straight_through_once_released() {
    let mut buffer = ReorderBuffer::new(8);
    assert!(buffer.insert(0, 0).is_empty());
    assert!(buffer.is_holding());
    assert_eq!(buffer.release_held(), vec![0]);
    for seq in 1..5u64 {
        assert_eq!(buffer.insert(seq, seq), vec![seq]);
    }
    assert_eq!(buffer.pending_len(), 0);
    assert_eq!(buffer.stats().released, 5);
}

#[test]
fn test_earlier_packet_arriving_second_keeps_its_place() {
    let mut buffer = ReorderBuffer::new(32);
    let mut released = Vec::new();
    for seq in [1u64, 0, 2] {
        released.extend(buffer.insert(seq, seq));
    }
    released.extend(buffer.release_held());
    assert_eq!(released, vec![0, 1, 2]);
    assert_eq!(buffer.stats().late, 0);
    assert_eq!(buffer.next_expected(), Some(3));
}

#[test]
fn test_hold_ends_when_span_covers_window() {
    let mut buffer = ReorderBuffer::new(4);
    assert!(buffer.insert(3, 3).is_empty());
    assert!(buffer.insert(1, 1).is_empty());
    assert!(buffer.insert(2, 2).is_empty());
    assert_eq!(buffer.insert(0, 0), vec![0, 1, 2, 3]);
    assert!(!buffer.is_holding());
    assert!(buffer.release_held().is_empty());
}

#[test]
fn test_hold_bounds_span_to_window() {
    let mut buffer = ReorderBuffer::new(4);
    buffer.insert(10, 10);
    assert_eq!(buffer.classify(6), Admission::Late);
    assert_eq!(buffer.classify(7), Admission::Accept);
    assert_eq!(buffer.classify(10), Admission::Duplicate);
    assert_eq!(buffer.classify(14), Admission::Accept);
    assert_eq!(buffer.classify(15), Admission::TooFarAhead);
}

#[test]
fn test_swapped_packets_released_in_order() {
    let mut buffer = ReorderBuffer::new(8);
    assert!(buffer.insert(10, 10).is_empty());
    assert_eq!(buffer.release_held(), vec![10]);
    assert!(buffer.insert(12, 12).is_empty());
    assert!(buffer.insert(13, 13).is_empty());
    assert_eq!(buffer.insert(11, 11), vec![11, 12, 13]);
    assert_eq!(buffer.stats().reordered, 1);
}

#[test]
fn test_late_and_duplicate_rejected() {
    let mut buffer = ReorderBuffer::new(8);
    buffer.insert(5, 5);
    buffer.insert(7, 7);
    assert_eq!(buffer.release_held(), vec![5]);

    assert_eq!(buffer.classify(4), Admission::Late);
    assert_eq!(buffer.classify(5), Admission::Late);
    assert_eq!(buffer.classify(7), Admission::Duplicate);
    assert_eq!(buffer.classify(6), Admission::Accept);

    assert!(buffer.insert(4, 4).is_empty());
    assert!(buffer.insert(7, 7).is_empty());
    let stats = buffer.stats();
    assert_eq!(stats.late, 1);
    assert_eq!(stats.duplicates, 1);
}

#[test]
fn test_far_ahead_rejected() {
    let mut buffer = ReorderBuffer::new(4);
    buffer.insert(0, 0);
    assert_eq!(buffer.classify(4), Admission::Accept);
    assert_eq!(buffer.classify(5), Admission::TooFarAhead);
}

#[test]
fn test_saturated_window_skips_gap() {
    let mut buffer = ReorderBuffer::new(4);
    buffer.insert(0, 0);
    assert_eq!(buffer.release_held(), vec![0]);
    // 1 is lost
    assert!(buffer.insert(2, 2).is_empty());
    assert!(buffer.insert(3, 3).is_empty());
    assert!(buffer.insert(4, 4).is_empty());
    assert_eq!(buffer.insert(5, 5), vec![2, 3, 4, 5]);
    assert_eq!(buffer.stats().lost, 1);
    assert_eq!(buffer.next_expected(), Some(6));
}

#[test]
fn test_sequence_extension_across_wrap() {
    let mut buffer = ReorderBuffer::new(32);
    assert_eq!(buffer.extend(65_534), Some(65_534));
    buffer.insert(65_534, ());
    buffer.insert(65_535, ());
    assert_eq!(buffer.extend(0), Some(65_536));
    assert_eq!(buffer.extend(65_533), Some(65_533));
}

#[test]
fn test_extension_before_stream_start_is_none() {
    let mut buffer = ReorderBuffer::new(32);
    buffer.insert(2, ());
    assert_eq!(buffer.extend(65_535), None);
}

#[test]
fn test_reset_keeps_extension_base() {
    let mut buffer = ReorderBuffer::new(32);
    buffer.insert(65_535, 1);
    assert!(buffer.insert(65_537, 3).is_empty());
    buffer.reset();
    assert_eq!(buffer.pending_len(), 0);
    assert!(!buffer.is_holding());
    assert_eq!(buffer.extend(5), Some(65_541));
    // the window no longer constrains where the stream resumes
    assert_eq!(buffer.classify(70_000), Admission::Accept);
    assert!(buffer.insert(65_541, 5).is_empty());
    assert_eq!(buffer.release_held(), vec![5]);
}

// --- TransportChannel ---

#[test]
fn test_channel_decrypts_and_orders() {
    let mut channel = channel(StreamKind::Video);

    let first = channel.on_packet(SESSION, &sealed(StreamKind::Video, 100, false, b"a")).unwrap();
    assert_eq!(sequences(&first), vec![100]);
    assert_eq!(first[0].payload.as_ref(), b"a");

    assert!(
        channel
            .on_packet(SESSION, &sealed(StreamKind::Video, 102, true, b"c"))
            .unwrap()
            .is_empty()
    );
    let released = channel
        .on_packet(SESSION, &sealed(StreamKind::Video, 101, false, b"b"))
        .unwrap();
    assert_eq!(sequences(&released), vec![101, 102]);
    assert!(released[1].marker);

    let stats = channel.stats();
    assert_eq!(stats.packets_received, 3);
    assert_eq!(stats.packets_delivered, 3);
}

#[test]
fn test_channel_rejects_foreign_session() {
    let mut channel = channel(StreamKind::Audio);
    let packet = sealed(StreamKind::Audio, 1, true, b"x");
    assert!(matches!(
        channel.on_packet(SESSION + 1, &packet),
        Err(TransportError::ForeignSession { expected: SESSION, actual: 10 })
    ));
    assert_eq!(channel.stats().packets_received, 0);
}

#[test]
fn test_channel_integrity_failure_dropped_and_counted() {
    let mut channel = channel(StreamKind::Audio);
    let mut packet = sealed(StreamKind::Audio, 1, true, b"samples");
    let last = packet.len() - 1;
    packet[last] ^= 0xFF;

    let err = channel.on_packet(SESSION, &packet).unwrap_err();
    assert!(matches!(err, TransportError::Decryption(DecryptionError::AuthenticationFailed)));
    assert_eq!(channel.stats().integrity_failures, 1);
    assert_eq!(channel.stats().packets_delivered, 0);
}

#[test]
fn test_rewritten_header_fails_authentication() {
    let mut channel = channel(StreamKind::Video);
    let mut packet = sealed(StreamKind::Video, 7, false, b"frag");
    // flip the marker bit in the authenticated header
    packet[1] ^= 0x80;
    assert!(matches!(
        channel.on_packet(SESSION, &packet),
        Err(TransportError::Decryption(_))
    ));
}

#[test]
fn test_three_consecutive_failures_exceed_threshold() {
    let mut channel = channel(StreamKind::Video);
    channel.on_packet(SESSION, &sealed(StreamKind::Video, 1, true, b"ok")).unwrap();

    let corrupt = |seq| {
        let mut p = sealed(StreamKind::Video, seq, true, b"bad");
        p[13] ^= 0x01;
        p
    };
    assert!(matches!(
        channel.on_packet(SESSION, &corrupt(2)),
        Err(TransportError::Decryption(_))
    ));
    assert!(matches!(
        channel.on_packet(SESSION, &corrupt(3)),
        Err(TransportError::Decryption(_))
    ));
    let err = channel.on_packet(SESSION, &corrupt(4)).unwrap_err();
    assert!(matches!(
        err,
        TransportError::ThresholdExceeded { count: 3, last: FailureKind::Integrity }
    ));
    assert_eq!(crate::MirrorError::from(err).category(), "integrity");
}

#[test]
fn test_success_resets_failure_run() {
    let mut channel = channel(StreamKind::Audio);
    for seq in 1..=10u64 {
        let mut bad = sealed(StreamKind::Audio, seq * 2, true, b"x");
        bad[12] ^= 0x01;
        assert!(channel.on_packet(SESSION, &bad).is_err());
        assert!(!matches!(
            channel.on_packet(SESSION, &bad),
            Err(TransportError::ThresholdExceeded { .. })
        ));
        channel
            .on_packet(SESSION, &sealed(StreamKind::Audio, seq * 2 + 1, true, b"y"))
            .unwrap();
    }
}

#[test]
fn test_late_packet_counts_as_window_violation() {
    let mut channel = channel(StreamKind::Audio);
    channel.on_packet(SESSION, &sealed(StreamKind::Audio, 50, true, b"a")).unwrap();
    channel.on_packet(SESSION, &sealed(StreamKind::Audio, 51, true, b"b")).unwrap();

    let err = channel
        .on_packet(SESSION, &sealed(StreamKind::Audio, 50, true, b"a"))
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::OutOfWindow { sequence: 50, admission: Admission::Late }
    ));
    assert_eq!(channel.stats().reorder.late, 1);
}

#[test]
fn test_audio_packet_on_video_channel_is_malformed() {
    let mut channel = channel(StreamKind::Video);
    let err = channel
        .on_packet(SESSION, &sealed(StreamKind::Audio, 1, true, b"a"))
        .unwrap_err();
    assert!(matches!(err, TransportError::UnexpectedPayload { .. }));
    assert_eq!(channel.stats().malformed, 1);
}

#[test]
fn test_truncated_packet_is_malformed() {
    let mut channel = channel(StreamKind::Video);
    assert!(matches!(
        channel.on_packet(SESSION, &[0x80, 0x6E, 0x00]),
        Err(TransportError::Malformed(_))
    ));
}

#[test]
fn test_flush_restarts_release_point() {
    let mut channel = channel(StreamKind::Video);
    channel.on_packet(SESSION, &sealed(StreamKind::Video, 1, false, b"a")).unwrap();
    assert!(
        channel
            .on_packet(SESSION, &sealed(StreamKind::Video, 3, false, b"c"))
            .unwrap()
            .is_empty()
    );
    channel.flush();
    let released = channel
        .on_packet(SESSION, &sealed(StreamKind::Video, 10, true, b"j"))
        .unwrap();
    assert_eq!(sequences(&released), vec![10]);
    assert!(released[0].discontinuity);

    let next = channel
        .on_packet(SESSION, &sealed(StreamKind::Video, 11, true, b"k"))
        .unwrap();
    assert!(!next[0].discontinuity);
}

#[test]
fn test_sequence_jump_without_flush_is_rejected() {
    let mut channel = channel(StreamKind::Audio);
    channel.on_packet(SESSION, &sealed(StreamKind::Audio, 1, true, b"a")).unwrap();
    assert!(matches!(
        channel.on_packet(SESSION, &sealed(StreamKind::Audio, 5_000, true, b"b")),
        Err(TransportError::OutOfWindow {
            admission: Admission::TooFarAhead,
            ..
        })
    ));
}

#[test]
fn test_flush_then_sequence_jump_spends_no_budget() {
    let mut channel = channel(StreamKind::Audio);
    for seq in 1..=3 {
        channel.on_packet(SESSION, &sealed(StreamKind::Audio, seq, true, b"a")).unwrap();
    }
    channel.flush();

    let mut delivered = Vec::new();
    for seq in 5_000..5_005 {
        delivered.extend(
            channel
                .on_packet(SESSION, &sealed(StreamKind::Audio, seq, true, b"b"))
                .unwrap(),
        );
    }
    assert_eq!(sequences(&delivered), (5_000..5_005).collect::<Vec<_>>());
    let stats = channel.stats();
    assert_eq!(stats.reorder.too_far_ahead, 0);
    assert_eq!(stats.reorder.late, 0);
    assert_eq!(stats.packets_delivered, 8);
}

#[test]
fn test_startup_hold_releases_lowest_first() {
    let mut channel = channel_with_hold(StreamKind::Video, Duration::from_millis(50));
    assert!(channel.hold_deadline().is_none());
    assert!(
        channel
            .on_packet(SESSION, &sealed(StreamKind::Video, 101, true, b"b"))
            .unwrap()
            .is_empty()
    );
    let deadline = channel.hold_deadline().unwrap();
    assert!(
        channel
            .on_packet(SESSION, &sealed(StreamKind::Video, 100, false, b"a"))
            .unwrap()
            .is_empty()
    );
    // the deadline is set by the first held packet
    assert_eq!(channel.hold_deadline(), Some(deadline));

    let released = channel.release_held();
    assert_eq!(sequences(&released), vec![100, 101]);
    assert_eq!(released[0].payload.as_ref(), b"a");
    assert!(channel.hold_deadline().is_none());

    let next = channel
        .on_packet(SESSION, &sealed(StreamKind::Video, 102, true, b"c"))
        .unwrap();
    assert_eq!(sequences(&next), vec![102]);
    assert_eq!(channel.stats().reorder.late, 0);
}

#[test]
fn test_wiped_vault_refuses_channel() {
    let vault = vault();
    vault.wipe();
    assert!(matches!(
        TransportChannel::new(SESSION, StreamKind::Video, 1, &vault, &TransportConfig::default()),
        Err(TransportError::Key(_))
    ));
}
