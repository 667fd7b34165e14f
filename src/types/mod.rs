//! Core types module

mod config;

pub use config::{
    BackoffConfig, DEFAULT_DISPLAY_NAME, DEFAULT_RTSP_PORT, DisplayConfig, HostSettings,
    MacSource, PipelineConfig, QueuePolicy, ReceiverConfig, ReceiverConfigBuilder,
    TransportConfig, keys,
};
