use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::testing::{CollectingSink, MockSender, RecordingPublisher};
use crate::types::MacSource;

fn config(name: &str) -> ReceiverConfig {
    ReceiverConfig::builder()
        .display_name(name)
        .mac_source(MacSource::Random)
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .rtsp_port(0)
        .build()
}

fn receiver(name: &str) -> (MirrorReceiver, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::new());
    let receiver = MirrorReceiver::builder(config(name))
        .sink(Arc::new(CollectingSink::new()))
        .publisher(publisher.clone())
        .build()
        .unwrap();
    (receiver, publisher)
}

async fn wait_for_state(receiver: &MirrorReceiver, wanted: &SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while receiver.state() != *wanted {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("receiver never reached {wanted}"));
}

#[test]
fn test_build_rejects_invalid_config() {
    let mut config = config("Studio");
    config.transport.reorder_window = 0;
    let result = MirrorReceiver::builder(config)
        .publisher(Arc::new(RecordingPublisher::new()))
        .build();
    assert!(matches!(result, Err(MirrorError::InvalidConfig { .. })));
}

#[tokio::test]
async fn test_start_publishes_and_stop_withdraws() {
    let (receiver, publisher) = receiver("Studio");
    assert_eq!(receiver.state(), SessionState::Idle);

    let addr = receiver.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(receiver.state(), SessionState::AwaitingConnection);
    assert!(receiver.is_advertising());

    let active = publisher.active();
    assert_eq!(active.len(), 2);
    assert!(active.iter().all(|r| r.port == addr.port()));

    receiver.stop().await;
    assert_eq!(receiver.state(), SessionState::Idle);
    assert!(publisher.active().is_empty());
    assert!(!receiver.is_advertising());
}

#[tokio::test]
async fn test_start_twice_is_invalid() {
    let (receiver, _) = receiver("Studio");
    receiver.start().await.unwrap();
    assert!(matches!(
        receiver.start().await,
        Err(MirrorError::InvalidState { .. })
    ));
    receiver.stop().await;
}

#[tokio::test]
async fn test_update_with_new_name_republishes() {
    let (receiver, publisher) = receiver("Studio");
    receiver.start().await.unwrap();
    let mut events = receiver.subscribe();
    let before = receiver.identity();

    let mut updated = receiver.config();
    updated.display_name = "Kitchen".to_string();
    receiver.update(updated).await.unwrap();

    let identity = receiver.identity();
    assert_eq!(identity.display_name, "Kitchen");
    assert_ne!(identity.mac, before.mac);
    let active = publisher.active();
    assert_eq!(active.len(), 2);
    assert!(active.iter().any(|r| r.instance_name == "Kitchen"));
    assert!(matches!(
        events.try_recv(),
        Ok(ReceiverEvent::AdvertisementUpdated { name, .. }) if name == "Kitchen"
    ));
    receiver.stop().await;
}

#[tokio::test]
async fn test_update_without_identity_change_keeps_advertisement() {
    let (receiver, publisher) = receiver("Studio");
    receiver.start().await.unwrap();
    let published = publisher.publish_count();

    let mut updated = receiver.config();
    updated.transport.reorder_window = 64;
    receiver.update(updated).await.unwrap();

    assert_eq!(publisher.publish_count(), published);
    assert_eq!(receiver.config().transport.reorder_window, 64);
    receiver.stop().await;
}

#[tokio::test]
async fn test_update_without_auto_apply_defers_publication() {
    let (receiver, publisher) = receiver("Studio");
    receiver.start().await.unwrap();
    let published = publisher.publish_count();

    let mut updated = receiver.config();
    updated.display_name = "Kitchen".to_string();
    updated.auto_apply = false;
    receiver.update(updated).await.unwrap();
    assert_eq!(publisher.publish_count(), published);
    assert_eq!(receiver.identity().display_name, "Studio");

    receiver.apply_settings().await.unwrap();
    assert_eq!(receiver.identity().display_name, "Kitchen");
    assert!(publisher.publish_count() > published);
    receiver.stop().await;
}

#[tokio::test]
async fn test_invalid_update_keeps_config() {
    let (receiver, _) = receiver("Studio");
    let mut updated = receiver.config();
    updated.pipeline.queue_capacity = 0;

    assert!(receiver.update(updated).await.is_err());
    assert_eq!(receiver.config().pipeline.queue_capacity, 256);
}

#[tokio::test]
async fn test_update_from_host_settings_json() {
    let (receiver, _) = receiver("Studio");
    receiver
        .update_from_json(r#"{"server_name": "Den", "use_random_mac": false}"#)
        .await
        .unwrap();

    assert_eq!(receiver.config().display_name, "Den");
    assert_eq!(receiver.identity().mac_source, MacSource::System);
    assert!(receiver.update_from_json("{not json").await.is_err());
}

#[tokio::test]
async fn test_apply_settings_generates_fresh_random_mac() {
    let (receiver, _) = receiver("Studio");
    let first = receiver.identity().mac;
    receiver.apply_settings().await.unwrap();
    assert_ne!(receiver.identity().mac, first);
}

#[tokio::test]
async fn test_second_connection_is_rejected() {
    let (receiver, _) = receiver("Studio");
    let addr = receiver.start().await.unwrap();
    let mut events = receiver.subscribe();

    let mut first = MockSender::connect(addr).await.unwrap();
    first.options().await.unwrap();
    wait_for_state(&receiver, &SessionState::Negotiating).await;
    let live = receiver.session().unwrap().id;

    let mut second = MockSender::connect(addr).await.unwrap();
    assert!(second.options().await.is_err());

    assert_eq!(receiver.session().unwrap().id, live);
    first.options().await.unwrap();

    let rejected = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ReceiverEvent::SessionRejected { peer }) = events.recv().await {
                return peer;
            }
        }
    })
    .await
    .unwrap();
    assert!(rejected.ip().is_loopback());
    receiver.stop().await;
}

#[tokio::test]
async fn test_slot_is_released_after_disconnect() {
    let (receiver, _) = receiver("Studio");
    let addr = receiver.start().await.unwrap();

    let mut first = MockSender::connect(addr).await.unwrap();
    first.options().await.unwrap();
    drop(first);
    wait_for_state(&receiver, &SessionState::AwaitingConnection).await;

    let mut second = MockSender::connect(addr).await.unwrap();
    second.options().await.unwrap();
    receiver.stop().await;
}

#[tokio::test]
async fn test_stop_closes_live_session() {
    let (receiver, _) = receiver("Studio");
    let addr = receiver.start().await.unwrap();
    let mut sender = MockSender::connect(addr).await.unwrap();
    sender.options().await.unwrap();
    sender.pair().await.unwrap();

    receiver.stop().await;
    assert!(receiver.session().is_none());
    assert_eq!(receiver.state(), SessionState::Idle);
    assert!(sender.is_closed().await.unwrap());
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let publisher = Arc::new(RecordingPublisher::new());
    let mut config = config("Studio");
    config.session_idle_timeout = Duration::from_millis(200);
    let receiver = MirrorReceiver::builder(config)
        .publisher(publisher)
        .build()
        .unwrap();
    let addr = receiver.start().await.unwrap();
    let mut events = receiver.subscribe();

    let mut sender = MockSender::connect(addr).await.unwrap();
    sender.options().await.unwrap();
    assert!(sender.is_closed().await.unwrap());

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ReceiverEvent::SessionEnded { state, .. }) = events.recv().await {
                return state;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(ended, SessionState::Errored { .. }));
    receiver.stop().await;
}
