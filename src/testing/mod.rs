//! Test doubles for exercising the receiver without real senders or a
//! real mDNS responder

mod collecting_sink;
pub mod h264;
mod mock_publisher;
mod sender;

pub use collecting_sink::CollectingSink;
pub use mock_publisher::{PublisherCall, RecordingPublisher};
pub use sender::{MockAudio, MockSender, MockSenderError, SenderPairing, StreamPorts};
