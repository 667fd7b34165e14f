use super::*;

#[test]
fn test_header_encode_decode() {
    let header = RtpHeader::new(PayloadType::Video, 100, 90_000, 0x1234_5678).with_marker(true);

    let encoded = header.encode();
    let (decoded, len) = RtpHeader::decode(&encoded).unwrap();

    assert_eq!(len, RtpHeader::SIZE);
    assert_eq!(decoded, header);
}

#[test]
fn test_payload_type_values() {
    assert_eq!(PayloadType::Audio as u8, 0x60);
    assert_eq!(PayloadType::Video as u8, 0x6E);
    assert_eq!(PayloadType::VideoConfig as u8, 0x6F);
    // marker bit is ignored
    assert_eq!(PayloadType::from_byte(0xEE), Some(PayloadType::Video));
    assert!(PayloadType::VideoConfig.is_video());
    assert!(!PayloadType::Audio.is_video());
}

#[test]
fn test_decode_invalid_version() {
    let mut buf = RtpHeader::new(PayloadType::Audio, 1, 0, 0).encode();
    buf[0] = 0x40;
    assert_eq!(
        RtpHeader::decode(&buf).unwrap_err(),
        RtpDecodeError::InvalidVersion(1)
    );
}

#[test]
fn test_decode_unknown_payload_type() {
    let mut buf = RtpHeader::new(PayloadType::Audio, 1, 0, 0).encode();
    buf[1] = 0x52;
    assert_eq!(
        RtpHeader::decode(&buf).unwrap_err(),
        RtpDecodeError::UnknownPayloadType(0x52)
    );
}

#[test]
fn test_decode_too_small() {
    assert!(matches!(
        RtpHeader::decode(&[0x80, 0x60, 0x00]),
        Err(RtpDecodeError::BufferTooSmall { needed: 12, have: 3 })
    ));
}

#[test]
fn test_csrc_and_extension_extend_header() {
    let mut buf = RtpHeader::new(PayloadType::Audio, 7, 352, 9).encode().to_vec();
    // one CSRC and an extension of one word
    buf[0] |= 0x10 | 0x01;
    buf.extend_from_slice(&[0xAA; 4]);
    buf.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]);
    buf.extend_from_slice(&[0x11; 4]);
    buf.extend_from_slice(b"payload");

    let (header, packet) = split_packet(&buf).unwrap();
    assert_eq!(header.sequence, 7);
    assert_eq!(packet.aad.len(), 12 + 4 + 8);
    assert_eq!(packet.payload, b"payload");
}

#[test]
fn test_truncated_extension_rejected() {
    let mut buf = RtpHeader::new(PayloadType::Audio, 7, 352, 9).encode().to_vec();
    buf[0] |= 0x10;
    buf.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x04]);
    assert!(matches!(
        split_packet(&buf),
        Err(RtpDecodeError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_padding_is_stripped() {
    let mut buf = RtpHeader::new(PayloadType::Video, 1, 0, 0).encode().to_vec();
    buf[0] |= 0x20;
    buf.extend_from_slice(b"abc");
    buf.extend_from_slice(&[0, 0, 3]);

    let (_, packet) = split_packet(&buf).unwrap();
    assert_eq!(packet.payload, b"abc");
}

#[test]
fn test_bad_padding_rejected() {
    let mut buf = RtpHeader::new(PayloadType::Video, 1, 0, 0).encode().to_vec();
    buf[0] |= 0x20;
    buf.push(0x40);
    assert_eq!(
        split_packet(&buf).unwrap_err(),
        RtpDecodeError::InvalidPadding(0x40)
    );
}
