use super::txt::{AIRPLAY_SERVICE_TYPE, RAOP_SERVICE_TYPE, to_hex, txt_keys};
use super::*;
use crate::identity::{Identity, MacAddress};
use crate::testing::{PublisherCall, RecordingPublisher};
use crate::types::MacSource;
use std::time::Duration;

fn advert(name: &str) -> Advertisement {
    Advertisement {
        identity: Identity {
            display_name: name.to_string(),
            mac: MacAddress::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]),
            mac_source: MacSource::Random,
        },
        port: 7000,
        public_key: [0xAB; 32],
        model: "AppleTV3,2".to_string(),
    }
}

#[test]
fn test_airplay_record_contents() {
    let record = advert("Studio").airplay_record();
    assert_eq!(record.service_type, AIRPLAY_SERVICE_TYPE);
    assert_eq!(record.instance_name, "Studio");
    assert_eq!(record.port, 7000);
    assert_eq!(
        record.property(txt_keys::DEVICE_ID),
        Some("02:11:22:33:44:55")
    );
    assert_eq!(record.property(txt_keys::FEATURES), Some("0x5A7FFEE6"));
    assert_eq!(
        record.property(txt_keys::PUBLIC_KEY),
        Some(to_hex(&[0xAB; 32]).as_str())
    );
}

#[test]
fn test_raop_record_instance_name() {
    let record = advert("Studio").raop_record();
    assert_eq!(record.service_type, RAOP_SERVICE_TYPE);
    assert_eq!(record.instance_name, "021122334455@Studio");
    assert_eq!(record.property("am"), Some("AppleTV3,2"));
}

#[test]
fn test_to_hex() {
    assert_eq!(to_hex(&[0x00, 0x0f, 0xff]), "000fff");
}

#[tokio::test]
async fn test_start_publishes_both_records() {
    let publisher = Arc::new(RecordingPublisher::new());
    let service = DiscoveryService::new(publisher.clone(), BackoffConfig::default());

    let outcome = service.start(&advert("Studio")).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Published);
    assert_eq!(publisher.active().len(), 2);
    assert_eq!(
        service.state(),
        AdvertisementState::Published {
            instance_name: "Studio".into()
        }
    );
}

#[tokio::test]
async fn test_stop_withdraws_everything() {
    let publisher = Arc::new(RecordingPublisher::new());
    let service = DiscoveryService::new(publisher.clone(), BackoffConfig::default());
    service.start(&advert("Studio")).await.unwrap();

    service.stop().await;

    assert!(publisher.active().is_empty());
    assert!(!service.is_advertising());
    let withdrawals = publisher
        .history()
        .into_iter()
        .filter(|c| matches!(c, PublisherCall::Withdraw(_)))
        .count();
    assert_eq!(withdrawals, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_publication_is_retried_with_backoff() {
    let publisher = Arc::new(RecordingPublisher::failing(3));
    let service = DiscoveryService::new(publisher.clone(), BackoffConfig::default());

    let outcome = service.start(&advert("Studio")).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Retrying);
    assert!(!service.is_advertising());

    // 500ms + 1s + 2s of backoff covers the remaining failures
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(service.is_advertising());
    assert_eq!(publisher.active().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_retry() {
    let publisher = Arc::new(RecordingPublisher::failing(100));
    let service = DiscoveryService::new(publisher.clone(), BackoffConfig::default());
    service.start(&advert("Studio")).await.unwrap();

    service.stop().await;
    publisher.fail_next(0);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(publisher.active().is_empty());
    assert_eq!(service.state(), AdvertisementState::Withdrawn);
}

#[tokio::test]
async fn test_partial_publication_is_rolled_back() {
    struct SecondFails(RecordingPublisher);

    #[async_trait::async_trait]
    impl ServicePublisher for SecondFails {
        async fn publish(&self, record: &ServiceRecord) -> Result<String, DiscoveryError> {
            if record.service_type == RAOP_SERVICE_TYPE {
                return Err(DiscoveryError::InvalidRecord("bad label".into()));
            }
            self.0.publish(record).await
        }

        async fn withdraw(&self, fullname: &str) -> Result<(), DiscoveryError> {
            self.0.withdraw(fullname).await
        }
    }

    let publisher = Arc::new(SecondFails(RecordingPublisher::new()));
    let service = DiscoveryService::new(publisher.clone(), BackoffConfig::default());

    let result = service.start(&advert("Studio")).await;

    assert!(matches!(result, Err(DiscoveryError::InvalidRecord(_))));
    assert!(publisher.0.active().is_empty());
}
