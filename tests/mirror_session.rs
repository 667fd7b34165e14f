use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use airplay_mirror::pipeline::passthrough_video_decoder;
use airplay_mirror::protocol::rtp::PayloadType;
use airplay_mirror::testing::h264::{PPS, SpsBuilder, avcc_record, idr_unit, slice_unit};
use airplay_mirror::testing::{CollectingSink, MockAudio, MockSender, RecordingPublisher};
use airplay_mirror::{MacSource, MirrorReceiver, ReceiverConfig, ReceiverEvent, SessionState};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    receiver: MirrorReceiver,
    sink: Arc<CollectingSink>,
    publisher: Arc<RecordingPublisher>,
    events: broadcast::Receiver<ReceiverEvent>,
    addr: SocketAddr,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("airplay_mirror=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn start(name: &str) -> Harness {
    init_tracing();
    let config = ReceiverConfig::builder()
        .display_name(name)
        .mac_source(MacSource::Random)
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .rtsp_port(0)
        .build();
    let sink = Arc::new(CollectingSink::new());
    let publisher = Arc::new(RecordingPublisher::new());
    // the synthetic units carry no real pictures, so keep them coded
    let receiver = MirrorReceiver::builder(config)
        .sink(sink.clone())
        .publisher(publisher.clone())
        .video_decoder(passthrough_video_decoder())
        .build()
        .unwrap();
    let events = receiver.subscribe();
    let addr = receiver.start().await.unwrap();
    Harness {
        receiver,
        sink,
        publisher,
        events,
        addr,
    }
}

async fn streaming_sender(addr: SocketAddr, audio: Option<MockAudio>) -> MockSender {
    let mut sender = MockSender::connect(addr).await.unwrap();
    sender.info().await.unwrap();
    sender.pair().await.unwrap();
    sender.setup(true, audio).await.unwrap();
    sender.record().await.unwrap();
    sender
}

async fn send_config(sender: &mut MockSender, width: u32, height: u32) {
    let sps = SpsBuilder::new(width, height).build();
    sender.send_video_config(&avcc_record(&sps, &PPS)).await.unwrap();
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<ReceiverEvent>, mut wanted: F) -> ReceiverEvent
where
    F: FnMut(&ReceiverEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_full_session_delivers_video_and_audio() {
    let mut h = start("Living Room").await;
    let mut sender = streaming_sender(h.addr, Some(MockAudio::pcm())).await;
    assert_eq!(h.receiver.state(), SessionState::Streaming);

    send_config(&mut sender, 1280, 720).await;
    sender.send_access_unit(0, &idr_unit(3000), 1000).await.unwrap();
    sender.send_access_unit(3000, &slice_unit(800), 1000).await.unwrap();

    let pcm: Vec<u8> = (0..352 * 2).flat_map(|i: i16| i.to_be_bytes()).collect();
    sender.send_audio(0, &pcm).await.unwrap();
    sender.send_audio(352, &pcm).await.unwrap();

    assert!(h.sink.wait_for(2, 2, WAIT).await);
    assert_eq!(h.receiver.width(), 1280);
    assert_eq!(h.receiver.height(), 720);

    let video = h.sink.video_frames();
    assert!(video[0].keyframe);
    assert!(!video[1].keyframe);
    assert_eq!(video[0].pts, Duration::ZERO);
    assert!(video[1].pts > video[0].pts);
    // parameter sets are prepended to the keyframe in Annex B form
    assert!(video[0].data.starts_with(&[0, 0, 0, 1, 0x67]));

    let audio = h.sink.audio_frames();
    assert_eq!(audio[0].sample_rate, 44_100);
    assert_eq!(audio[0].channels, 2);
    assert_eq!(audio[0].samples.len(), 704);
    assert_eq!(audio[0].samples[5], 5);
    assert!(audio[1].pts > audio[0].pts);

    let formats = h.sink.formats();
    assert!(formats.iter().any(|f| f.width == 1280 && f.height == 720));

    sender.teardown().await.unwrap();
    let ended = wait_for_event(&mut h.events, |e| matches!(e, ReceiverEvent::SessionEnded { .. })).await;
    assert!(matches!(
        ended,
        ReceiverEvent::SessionEnded {
            state: SessionState::Closed,
            ..
        }
    ));
    wait_until(|| h.receiver.width() == 0).await;
    assert_eq!(h.receiver.height(), 0);
    wait_until(|| h.receiver.state() == SessionState::AwaitingConnection).await;

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_reordered_fragments_are_reassembled_in_order() {
    let h = start("Reorder").await;
    let mut sender = streaming_sender(h.addr, None).await;
    send_config(&mut sender, 640, 480).await;

    let unit = idr_unit(900);
    let fragments: Vec<&[u8]> = unit.chunks(300).collect();
    let first = sender.seal_video(PayloadType::Video, false, 0, fragments[0]).unwrap();
    let second = sender.seal_video(PayloadType::Video, false, 0, fragments[1]).unwrap();
    let third = sender.seal_video(PayloadType::Video, false, 0, fragments[2]).unwrap();
    let last = sender.seal_video(PayloadType::Video, true, 0, fragments[3]).unwrap();

    for packet in [&first, &third, &last, &second] {
        sender.write_video(packet).await.unwrap();
    }

    assert!(h.sink.wait_for(1, 0, WAIT).await);
    let frame = &h.sink.video_frames()[0];
    let idr_start = frame
        .data
        .windows(5)
        .position(|w| w == [0, 0, 0, 1, 0x65])
        .unwrap();
    // every payload byte survives in its original position
    assert_eq!(&frame.data[idr_start + 4..], &unit[4..]);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_flush_then_sequence_jump_keeps_streaming() {
    let h = start("Flush").await;
    let mut sender = streaming_sender(h.addr, None).await;
    send_config(&mut sender, 640, 480).await;
    sender.send_access_unit(0, &idr_unit(200), 1400).await.unwrap();
    assert!(h.sink.wait_for(1, 0, WAIT).await);

    // far past the reorder window, and an older timestamp
    sender.flush(5_000).await.unwrap();
    for i in 0..4u32 {
        sender.send_access_unit(i * 3000, &idr_unit(200), 1400).await.unwrap();
    }

    assert!(h.sink.wait_for(5, 0, WAIT).await);
    assert_eq!(h.receiver.state(), SessionState::Streaming);
    let pts: Vec<_> = h.sink.video_frames().iter().map(|f| f.pts).collect();
    assert!(pts.windows(2).all(|w| w[0] <= w[1]));

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_corrupt_access_unit_is_skipped() {
    let h = start("Skip").await;
    let mut sender = streaming_sender(h.addr, None).await;
    send_config(&mut sender, 640, 480).await;

    sender.send_access_unit(0, &idr_unit(200), 1400).await.unwrap();
    // NAL length runs past the end of the unit
    sender.send_access_unit(3000, &[0, 0, 0, 99, 0x41, 1, 2], 1400).await.unwrap();
    sender.send_access_unit(6000, &slice_unit(200), 1400).await.unwrap();

    assert!(h.sink.wait_for(2, 0, WAIT).await);
    let frames = h.sink.video_frames();
    assert_eq!(frames[1].pts, Duration::from_nanos(66_666_666));
    assert_eq!(h.receiver.state(), SessionState::Streaming);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_tampered_packets_error_session_and_keep_advertising() {
    let mut h = start("Tamper").await;
    let mut sender = streaming_sender(h.addr, None).await;
    send_config(&mut sender, 640, 480).await;

    for ts in 0..3u32 {
        let mut packet = sender.seal_video(PayloadType::Video, true, ts * 3000, &idr_unit(64)).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x55;
        sender.write_video(&packet).await.unwrap();
    }

    let ended = wait_for_event(&mut h.events, |e| matches!(e, ReceiverEvent::SessionEnded { .. })).await;
    assert!(matches!(
        ended,
        ReceiverEvent::SessionEnded {
            state: SessionState::Errored { .. },
            ..
        }
    ));
    assert!(h.sink.video_frames().is_empty());
    assert!(h.receiver.is_advertising());
    assert_eq!(h.publisher.active().len(), 2);
    wait_until(|| h.receiver.state() == SessionState::AwaitingConnection).await;

    // the slot is free for the next sender
    let _next = streaming_sender(h.addr, None).await;
    assert_eq!(h.receiver.state(), SessionState::Streaming);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_each_session_gets_fresh_keys() {
    let mut h = start("Keys").await;

    let mut first = streaming_sender(h.addr, None).await;
    let first_secret = first.shared_secret().unwrap();
    first.teardown().await.unwrap();
    wait_for_event(&mut h.events, |e| matches!(e, ReceiverEvent::SessionEnded { .. })).await;
    wait_until(|| h.receiver.state() == SessionState::AwaitingConnection).await;

    let mut second = streaming_sender(h.addr, None).await;
    assert_ne!(second.shared_secret().unwrap(), first_secret);

    send_config(&mut second, 640, 480).await;
    second.send_access_unit(0, &idr_unit(100), 1400).await.unwrap();
    assert!(h.sink.wait_for(1, 0, WAIT).await);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_resolution_change_announced_before_frames() {
    let h = start("Rotate").await;
    let mut sender = streaming_sender(h.addr, None).await;

    send_config(&mut sender, 1920, 1080).await;
    sender.send_access_unit(0, &idr_unit(100), 1400).await.unwrap();
    assert!(h.sink.wait_for(1, 0, WAIT).await);
    assert_eq!(h.receiver.width(), 1920);

    send_config(&mut sender, 1080, 1920).await;
    sender.send_access_unit(3000, &idr_unit(100), 1400).await.unwrap();
    assert!(h.sink.wait_for(2, 0, WAIT).await);

    let frames = h.sink.video_frames();
    assert_eq!((frames[0].width, frames[0].height), (1920, 1080));
    assert_eq!((frames[1].width, frames[1].height), (1080, 1920));
    assert_eq!((h.receiver.width(), h.receiver.height()), (1080, 1920));

    let video_formats: Vec<_> = h
        .sink
        .formats()
        .into_iter()
        .filter(|f| f.width != 0)
        .map(|f| (f.width, f.height))
        .collect();
    assert_eq!(video_formats, vec![(1920, 1080), (1080, 1920)]);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_rename_during_session_keeps_streaming() {
    let mut h = start("Before").await;
    let mut sender = streaming_sender(h.addr, None).await;

    let mut config = h.receiver.config();
    config.display_name = "After".to_string();
    h.receiver.update(config).await.unwrap();

    let updated = wait_for_event(&mut h.events, |e| {
        matches!(e, ReceiverEvent::AdvertisementUpdated { .. })
    })
    .await;
    assert!(matches!(updated, ReceiverEvent::AdvertisementUpdated { name, .. } if name == "After"));
    assert!(h.publisher.active().iter().any(|r| r.instance_name == "After"));
    assert_eq!(h.receiver.state(), SessionState::Streaming);

    send_config(&mut sender, 640, 480).await;
    sender.send_access_unit(0, &idr_unit(100), 1400).await.unwrap();
    assert!(h.sink.wait_for(1, 0, WAIT).await);

    h.receiver.stop().await;
}

#[tokio::test]
async fn test_volume_is_reported() {
    let mut h = start("Volume").await;
    let mut sender = streaming_sender(h.addr, None).await;

    assert!(sender.set_volume(-20.0).await.unwrap().is_success());
    let event = wait_for_event(&mut h.events, |e| matches!(e, ReceiverEvent::VolumeChanged { .. })).await;
    assert!(matches!(event, ReceiverEvent::VolumeChanged { db, .. } if (db + 20.0).abs() < f32::EPSILON));

    assert_eq!(sender.set_volume(12.0).await.unwrap().status.as_u16(), 400);
    assert_eq!(h.receiver.state(), SessionState::Streaming);

    h.receiver.stop().await;
}
