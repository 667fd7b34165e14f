//! Frame sink that records everything it receives

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::sink::{AudioFrame, FrameSink, StreamDescriptor, VideoFrame};

#[derive(Default)]
struct Collected {
    video: Vec<VideoFrame>,
    audio: Vec<AudioFrame>,
    formats: Vec<StreamDescriptor>,
}

/// Records frames and format changes for assertions
#[derive(Default)]
pub struct CollectingSink {
    collected: Mutex<Collected>,
    notify: Notify,
}

impl CollectingSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Video frames received so far
    #[must_use]
    pub fn video_frames(&self) -> Vec<VideoFrame> {
        self.lock().video.clone()
    }

    /// Audio frames received so far
    #[must_use]
    pub fn audio_frames(&self) -> Vec<AudioFrame> {
        self.lock().audio.clone()
    }

    /// Format announcements received so far
    #[must_use]
    pub fn formats(&self) -> Vec<StreamDescriptor> {
        self.lock().formats.clone()
    }

    /// Wait until at least `video` video frames and `audio` audio frames
    /// have arrived
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, video: usize, audio: usize, timeout: Duration) -> bool {
        let reached = async {
            loop {
                let notified = self.notify.notified();
                {
                    let collected = self.lock();
                    if collected.video.len() >= video && collected.audio.len() >= audio {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }
}

impl FrameSink for CollectingSink {
    fn on_video_frame(&self, frame: VideoFrame) {
        self.lock().video.push(frame);
        self.notify.notify_waiters();
    }

    fn on_audio_frame(&self, frame: AudioFrame) {
        self.lock().audio.push(frame);
        self.notify.notify_waiters();
    }

    fn on_format_changed(&self, descriptor: &StreamDescriptor) {
        self.lock().formats.push(descriptor.clone());
        self.notify.notify_waiters();
    }
}
