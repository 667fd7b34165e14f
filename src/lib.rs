//! # airplay-mirror
//!
//! A pure Rust core for receiving `AirPlay` screen-mirroring sessions.
//!
//! ## Features
//!
//! - mDNS advertisement (`_airplay._tcp` and `_raop._tcp`) with background retry
//! - Legacy pair-setup / pair-verify authentication
//! - ChaCha20-Poly1305 media transport with reordering and an error budget
//! - H.264 access-unit assembly and parameter-set parsing
//! - PCM and AAC (LC / ELD) audio decoding
//! - Decoded frames pushed to a host-supplied [`FrameSink`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use airplay_mirror::{MirrorReceiver, NullSink, ReceiverConfig};
//!
//! # async fn example() -> Result<(), airplay_mirror::MirrorError> {
//! let receiver = MirrorReceiver::create(ReceiverConfig::with_name("Studio"), Arc::new(NullSink))?;
//! receiver.start().await?;
//!
//! // Later, from the host's settings page
//! receiver.update_from_json(r#"{"server_name": "Kitchen"}"#).await?;
//!
//! println!("{}x{}", receiver.width(), receiver.height());
//! receiver.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Host surface**: [`MirrorReceiver`], [`FrameSink`], [`ReceiverEvent`]
//! - **Session**: handshake state machine, pairing and key derivation
//! - **Data path**: `transport` (decrypt, reorder) feeding `pipeline`
//!   (assemble, decode, timestamp) on dedicated worker threads
//! - **Low-level**: `protocol` modules for RTSP, binary plists, RTP and crypto

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
/// Error types
pub mod error;
/// Core types
pub mod types;

/// Testing utilities
pub mod testing;

pub mod discovery;
pub mod identity;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod sink;
pub mod transport;

// Re-exports
pub use error::{MirrorError, Result};
pub use identity::{Identity, MacAddress};
pub use receiver::{MirrorReceiver, ReceiverBuilder, ReceiverEvent};
pub use session::SessionState;
pub use sink::{AudioFrame, FrameSink, NullSink, PictureFormat, StreamDescriptor, StreamKind, VideoFrame};
pub use types::{HostSettings, MacSource, QueuePolicy, ReceiverConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AudioFrame, FrameSink, MirrorError, MirrorReceiver, NullSink, ReceiverConfig,
        ReceiverEvent, SessionState, StreamDescriptor, VideoFrame,
    };
}
