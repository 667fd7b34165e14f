use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::MirrorError;

/// Name advertised when the host supplies none
pub const DEFAULT_DISPLAY_NAME: &str = "OBS";

/// Default RTSP control port
pub const DEFAULT_RTSP_PORT: u16 = 7000;

/// Setting keys understood by [`HostSettings`]
pub mod keys {
    /// Advertised receiver name
    pub const SERVER_NAME: &str = "server_name";
    /// Whether to advertise a random MAC instead of the system one
    pub const USE_RANDOM_MAC: &str = "use_random_mac";
}

/// Where the advertised hardware address comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacSource {
    /// The host's primary network interface
    System,
    /// A fresh locally-administered address per configuration
    #[default]
    Random,
}

impl MacSource {
    /// Map the host's `use_random_mac` flag
    #[must_use]
    pub fn from_random_flag(random: bool) -> Self {
        if random { Self::Random } else { Self::System }
    }
}

/// What a decode queue does when its consumer falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// The network reader waits for space
    #[default]
    Block,
    /// The oldest queued packet is discarded
    DropOldest,
}

/// Settings object as persisted by the host application
///
/// Missing keys keep the value already in the [`ReceiverConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Advertised receiver name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Advertise a random MAC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_random_mac: Option<bool>,
}

impl HostSettings {
    /// Parse the host's JSON settings object
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the JSON is malformed or has wrongly typed keys.
    pub fn from_json(json: &str) -> Result<Self, MirrorError> {
        serde_json::from_str(json).map_err(|e| MirrorError::InvalidConfig {
            name: "settings".to_string(),
            message: e.to_string(),
        })
    }

    /// Serialize back to JSON
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Transport layer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Reorder window in packets
    pub reorder_window: u16,
    /// Consecutive packet failures before the session is errored
    pub integrity_threshold: u32,
    /// How long the first packets of a stream are held so reordered
    /// startup packets keep their place; zero releases immediately
    pub startup_hold: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reorder_window: 32,
            integrity_threshold: 3,
            startup_hold: Duration::from_millis(50),
        }
    }
}

/// Decode pipeline tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Packets buffered between network reader and decoder, per stream
    pub queue_capacity: usize,
    /// Behaviour when a queue is full
    pub queue_policy: QueuePolicy,
    /// Consecutive decode failures before the session is errored
    pub decode_failure_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            queue_policy: QueuePolicy::Block,
            decode_failure_threshold: 30,
        }
    }
}

/// Retry schedule for mDNS publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First retry delay
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Multiplier applied after each failure
    pub factor: u32,
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (starting at 0)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1).saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2,
        }
    }
}

/// Display capabilities reported to senders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Maximum width in pixels
    pub width: u32,
    /// Maximum height in pixels
    pub height: u32,
    /// Refresh rate in Hz
    pub refresh_rate: u32,
    /// Maximum frames per second requested from the sender
    pub max_fps: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_rate: 60,
            max_fps: 30,
        }
    }
}

/// Configuration for the mirroring receiver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Name shown on senders (default: "OBS")
    pub display_name: String,

    /// Source of the advertised hardware address (default: random)
    pub mac_source: MacSource,

    /// Address to bind listeners on (default: all interfaces)
    pub bind_address: IpAddr,

    /// RTSP control port (default: 7000, 0 picks a free port)
    pub rtsp_port: u16,

    /// Device model reported in discovery and `/info`
    pub model: String,

    /// Display modes reported to senders
    pub display: DisplayConfig,

    /// Transport tuning
    pub transport: TransportConfig,

    /// Decode pipeline tuning
    pub pipeline: PipelineConfig,

    /// Advertisement retry schedule
    pub discovery_backoff: BackoffConfig,

    /// Close a session after this long without control or media traffic
    pub session_idle_timeout: Duration,

    /// Republish automatically when `update` changes the identity
    pub auto_apply: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            mac_source: MacSource::Random,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtsp_port: DEFAULT_RTSP_PORT,
            model: "AppleTV3,2".to_string(),
            display: DisplayConfig::default(),
            transport: TransportConfig::default(),
            pipeline: PipelineConfig::default(),
            discovery_backoff: BackoffConfig::default(),
            session_idle_timeout: Duration::from_secs(30),
            auto_apply: true,
        }
    }
}

impl ReceiverConfig {
    /// Create with a display name
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            ..Default::default()
        }
    }

    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ReceiverConfigBuilder {
        ReceiverConfigBuilder::default()
    }

    /// Build from the host's JSON settings, on top of defaults
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the JSON cannot be parsed.
    pub fn from_settings_json(json: &str) -> Result<Self, MirrorError> {
        let mut config = Self::default();
        config.apply_host_settings(&HostSettings::from_json(json)?);
        Ok(config)
    }

    /// Overlay host settings onto this config
    pub fn apply_host_settings(&mut self, settings: &HostSettings) {
        if let Some(name) = &settings.server_name {
            self.display_name.clone_from(name);
        }
        if let Some(random) = settings.use_random_mac {
            self.mac_source = MacSource::from_random_flag(random);
        }
    }

    /// The subset of this config that a host persists
    #[must_use]
    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            server_name: Some(self.display_name.clone()),
            use_random_mac: Some(self.mac_source == MacSource::Random),
        }
    }

    /// Whether `other` advertises a different identity than `self`
    #[must_use]
    pub fn identity_differs(&self, other: &Self) -> bool {
        self.display_name != other.display_name || self.mac_source != other.mac_source
    }

    /// Check values that would make the receiver unusable
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending setting.
    pub fn validate(&self) -> Result<(), MirrorError> {
        let invalid = |name: &str, message: &str| MirrorError::InvalidConfig {
            name: name.to_string(),
            message: message.to_string(),
        };
        if self.transport.reorder_window == 0 || self.transport.reorder_window > 1024 {
            return Err(invalid("reorder_window", "must be between 1 and 1024"));
        }
        if self.transport.integrity_threshold == 0 {
            return Err(invalid("integrity_threshold", "must be at least 1"));
        }
        if self.transport.startup_hold > Duration::from_secs(1) {
            return Err(invalid("startup_hold", "must be at most one second"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.pipeline.decode_failure_threshold == 0 {
            return Err(invalid("decode_failure_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for `ReceiverConfig`
#[derive(Debug, Clone, Default)]
pub struct ReceiverConfigBuilder {
    config: ReceiverConfig,
}

impl ReceiverConfigBuilder {
    /// Set the advertised name
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.display_name = name.into();
        self
    }

    /// Set the MAC source
    #[must_use]
    pub fn mac_source(mut self, source: MacSource) -> Self {
        self.config.mac_source = source;
        self
    }

    /// Set the bind address
    #[must_use]
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Set the RTSP control port
    #[must_use]
    pub fn rtsp_port(mut self, port: u16) -> Self {
        self.config.rtsp_port = port;
        self
    }

    /// Set transport tuning
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Set pipeline tuning
    #[must_use]
    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.config.pipeline = pipeline;
        self
    }

    /// Set display capabilities
    #[must_use]
    pub fn display(mut self, display: DisplayConfig) -> Self {
        self.config.display = display;
        self
    }

    /// Set the advertisement retry schedule
    #[must_use]
    pub fn discovery_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.discovery_backoff = backoff;
        self
    }

    /// Set session idle timeout
    #[must_use]
    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    /// Enable or disable automatic republish on `update`
    #[must_use]
    pub fn auto_apply(mut self, enabled: bool) -> Self {
        self.config.auto_apply = enabled;
        self
    }

    /// Build the config
    #[must_use]
    pub fn build(self) -> ReceiverConfig {
        self.config
    }
}
