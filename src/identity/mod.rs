//! Receiver identity and its advertisement
//!
//! The identity (display name plus hardware address) is what senders see in
//! their device picker. It is replaced wholesale whenever the host
//! reconfigures the receiver; all writes go through [`IdentityManager`].

mod mac;

pub use mac::{MacAddress, MacError};

use sha2::{Digest, Sha512};
use std::sync::{PoisonError, RwLock};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::discovery::{Advertisement, DiscoveryError, DiscoveryService, PublishOutcome};
use crate::types::{DEFAULT_DISPLAY_NAME, MacSource};

/// Longest instance label DNS-SD allows, in bytes
pub const MAX_NAME_BYTES: usize = 63;

/// The name and hardware address the receiver advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Name shown on senders
    pub display_name: String,
    /// Advertised hardware address
    pub mac: MacAddress,
    /// Where `mac` came from
    pub mac_source: MacSource,
}

impl Identity {
    /// Build an identity, resolving the MAC from its source
    #[must_use]
    pub fn resolve(display_name: &str, mac_source: MacSource) -> Self {
        let mac = match mac_source {
            MacSource::Random => MacAddress::random_local(),
            MacSource::System => MacAddress::system(),
        };
        Self {
            display_name: normalize_name(display_name),
            mac,
            mac_source,
        }
    }

    /// `deviceid` as senders expect it (`AA:BB:CC:DD:EE:FF`)
    #[must_use]
    pub fn device_id(&self) -> String {
        self.mac.to_string()
    }

    /// RAOP instance label (`AABBCCDDEEFF@Name`)
    #[must_use]
    pub fn raop_instance_name(&self) -> String {
        format!("{}@{}", self.mac.to_compact_hex(), self.display_name)
    }

    /// Pairing identity derived from the device id
    #[must_use]
    pub fn pairing_uuid(&self) -> String {
        let digest = Sha512::digest(self.mac.octets());
        let b = &digest[..16];
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// Trim, default and truncate a display name to a valid instance label
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return DEFAULT_DISPLAY_NAME.to_string();
    }
    if trimmed.len() <= MAX_NAME_BYTES {
        return trimmed.to_string();
    }
    let mut end = MAX_NAME_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].trim_end().to_string()
}

/// Owns the current identity and the advertisement published for it
pub struct IdentityManager {
    identity: RwLock<Identity>,
    discovery: DiscoveryService,
    public_key: [u8; 32],
    model: String,
    port: AtomicU16,
    write_lock: tokio::sync::Mutex<()>,
}

impl IdentityManager {
    /// Create a manager with an initial identity
    #[must_use]
    pub fn new(
        initial: Identity,
        discovery: DiscoveryService,
        public_key: [u8; 32],
        model: impl Into<String>,
    ) -> Self {
        Self {
            identity: RwLock::new(initial),
            discovery,
            public_key,
            model: model.into(),
            port: AtomicU16::new(0),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the current identity
    #[must_use]
    pub fn current(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The discovery service publishing this identity
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    /// Set the control port advertised from the next `apply`
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Release);
    }

    /// Replace the identity
    ///
    /// A `Random` source yields a fresh address on every call. The
    /// advertisement is not touched until [`apply`](Self::apply).
    pub async fn configure(&self, display_name: &str, mac_source: MacSource) -> Identity {
        let _guard = self.write_lock.lock().await;
        let identity = Identity::resolve(display_name, mac_source);
        tracing::info!(
            name = %identity.display_name,
            mac = %identity.mac,
            source = ?identity.mac_source,
            "Identity configured"
        );
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity.clone();
        identity
    }

    /// Withdraw any existing advertisement and publish the current identity
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError` only for non-retryable failures.
    pub async fn apply(&self) -> Result<PublishOutcome, DiscoveryError> {
        let _guard = self.write_lock.lock().await;
        let advert = Advertisement {
            identity: self.current(),
            port: self.port.load(Ordering::Acquire),
            public_key: self.public_key,
            model: self.model.clone(),
        };
        self.discovery.start(&advert).await
    }

    /// Withdraw the advertisement
    pub async fn withdraw(&self) {
        let _guard = self.write_lock.lock().await;
        self.discovery.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPublisher;
    use crate::types::BackoffConfig;
    use std::sync::Arc;

    fn manager(publisher: Arc<RecordingPublisher>) -> IdentityManager {
        IdentityManager::new(
            Identity::resolve("Initial", MacSource::Random),
            DiscoveryService::new(publisher, BackoffConfig::default()),
            [7u8; 32],
            "AppleTV3,2",
        )
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Studio  "), "Studio");
        assert_eq!(normalize_name("   "), "OBS");
        let long = "é".repeat(40);
        let normalized = normalize_name(&long);
        assert!(normalized.len() <= MAX_NAME_BYTES);
        assert!(normalized.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_raop_instance_name() {
        let identity = Identity {
            display_name: "Desk".into(),
            mac: MacAddress::new([0x58, 0x55, 0xCA, 0x1A, 0xE2, 0x88]),
            mac_source: MacSource::System,
        };
        assert_eq!(identity.raop_instance_name(), "5855CA1AE288@Desk");
        assert_eq!(identity.device_id(), "58:55:CA:1A:E2:88");
    }

    #[test]
    fn test_pairing_uuid_is_stable() {
        let identity = Identity::resolve("A", MacSource::Random);
        let uuid = identity.pairing_uuid();
        assert_eq!(uuid, identity.pairing_uuid());
        assert_eq!(uuid.len(), 36);
    }

    #[tokio::test]
    async fn test_configure_random_generates_fresh_mac() {
        let manager = manager(Arc::new(RecordingPublisher::new()));
        let first = manager.configure("Studio", MacSource::Random).await;
        let second = manager.configure("Studio", MacSource::Random).await;
        assert_ne!(first.mac, second.mac);
        assert!(second.mac.is_locally_administered());
        assert_eq!(manager.current(), second);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let publisher = Arc::new(RecordingPublisher::new());
        let manager = manager(publisher.clone());
        manager.set_port(7000);

        manager.apply().await.unwrap();
        manager.apply().await.unwrap();

        assert_eq!(publisher.active().len(), 2);
        assert!(manager.discovery().is_advertising());
    }

    #[tokio::test]
    async fn test_apply_replaces_previous_advertisement() {
        let publisher = Arc::new(RecordingPublisher::new());
        let manager = manager(publisher.clone());
        manager.apply().await.unwrap();

        manager.configure("Studio", MacSource::Random).await;
        manager.apply().await.unwrap();

        let active = publisher.active();
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|r| r.instance_name == "Studio"));
        assert!(active.iter().all(|r| !r.instance_name.ends_with("Initial")));
    }
}
