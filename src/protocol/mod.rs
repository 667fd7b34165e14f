//! Wire protocols spoken by the receiver

pub mod crypto;
pub mod plist;
pub mod rtp;
pub mod rtsp;
