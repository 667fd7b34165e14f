//! Service records advertised for a mirroring receiver

use std::collections::BTreeMap;

use crate::identity::Identity;

/// mDNS service type for `AirPlay`
pub const AIRPLAY_SERVICE_TYPE: &str = "_airplay._tcp.local.";

/// mDNS service type for RAOP (audio companion service)
pub const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";

/// Feature bitmask advertised to senders (video mirroring, audio, legacy pairing)
pub const FEATURES: u64 = 0x5A7F_FEE6;

/// Source version string reported to senders
pub const SOURCE_VERSION: &str = "220.68";

/// Status flags: no problem, no PIN, supports legacy pairing
pub const STATUS_FLAGS: u32 = 0x4;

/// TXT record keys
pub mod txt_keys {
    /// Device ID (MAC address)
    pub const DEVICE_ID: &str = "deviceid";
    /// Feature bitmask
    pub const FEATURES: &str = "features";
    /// Status flags
    pub const FLAGS: &str = "flags";
    /// Model identifier
    pub const MODEL: &str = "model";
    /// Ed25519 public key (hex)
    pub const PUBLIC_KEY: &str = "pk";
    /// Pairing identity UUID
    pub const PAIRING_ID: &str = "pi";
    /// Source version
    pub const SOURCE_VERSION: &str = "srcvers";
    /// Protocol variant
    pub const VV: &str = "vv";
}

/// A single mDNS service registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Fully qualified service type, e.g. `_airplay._tcp.local.`
    pub service_type: String,
    /// Instance label shown to users
    pub instance_name: String,
    /// Advertised port
    pub port: u16,
    /// TXT properties
    pub properties: BTreeMap<String, String>,
}

impl ServiceRecord {
    /// Look up a TXT property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Everything needed to publish the receiver's service pair
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Identity to advertise
    pub identity: Identity,
    /// RTSP control port
    pub port: u16,
    /// Long-term Ed25519 public key used during pairing
    pub public_key: [u8; 32],
    /// Model identifier
    pub model: String,
}

impl Advertisement {
    /// `_airplay._tcp` record
    #[must_use]
    pub fn airplay_record(&self) -> ServiceRecord {
        let mut properties = BTreeMap::new();
        let mut add = |k: &str, v: String| {
            properties.insert(k.to_string(), v);
        };

        add(txt_keys::DEVICE_ID, self.identity.device_id());
        add(txt_keys::FEATURES, format!("0x{FEATURES:X}"));
        add(txt_keys::FLAGS, format!("0x{STATUS_FLAGS:x}"));
        add(txt_keys::MODEL, self.model.clone());
        add(txt_keys::PUBLIC_KEY, to_hex(&self.public_key));
        add(txt_keys::PAIRING_ID, self.identity.pairing_uuid());
        add(txt_keys::SOURCE_VERSION, SOURCE_VERSION.to_string());
        add(txt_keys::VV, "2".to_string());

        ServiceRecord {
            service_type: AIRPLAY_SERVICE_TYPE.to_string(),
            instance_name: self.identity.display_name.clone(),
            port: self.port,
            properties,
        }
    }

    /// `_raop._tcp` record, instance `MAC@Name`
    #[must_use]
    pub fn raop_record(&self) -> ServiceRecord {
        let fields: [(&str, String); 19] = [
            ("txtvers", "1".into()),
            ("ch", "2".into()),
            ("cn", "0,1,2,3".into()),
            ("da", "true".into()),
            ("et", "0,3,5".into()),
            ("ft", format!("0x{FEATURES:X}")),
            ("md", "0,1,2".into()),
            ("am", self.model.clone()),
            ("pk", to_hex(&self.public_key)),
            ("pw", "false".into()),
            ("rhd", "5.6.0.0".into()),
            ("sf", format!("0x{STATUS_FLAGS:x}")),
            ("sr", "44100".into()),
            ("ss", "16".into()),
            ("sv", "false".into()),
            ("tp", "UDP".into()),
            ("vn", "65537".into()),
            ("vs", SOURCE_VERSION.into()),
            ("vv", "2".into()),
        ];

        ServiceRecord {
            service_type: RAOP_SERVICE_TYPE.to_string(),
            instance_name: self.identity.raop_instance_name(),
            port: self.port,
            properties: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Both records, `_airplay` first
    #[must_use]
    pub fn records(&self) -> [ServiceRecord; 2] {
        [self.airplay_record(), self.raop_record()]
    }
}

/// Lowercase hex encoding
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
