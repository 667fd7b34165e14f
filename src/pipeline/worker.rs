//! Decode worker threads
//!
//! Each stream gets one OS thread that drains its queue, so a slow
//! decoder never stalls the network readers on the runtime.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::MirrorError;
use crate::session::SessionControl;
use crate::sink::StreamKind;
use crate::transport::PlainPacket;

use super::queue::PacketReceiver;

/// Per-stream decode logic driven by a worker
pub trait PacketStage {
    /// Stream this stage decodes
    fn kind(&self) -> StreamKind;

    /// Process one packet, returning the number of frames delivered
    ///
    /// # Errors
    ///
    /// Returns a decode error for a unit that had to be skipped.
    fn handle(&mut self, packet: &PlainPacket) -> Result<usize, MirrorError>;

    /// Drop in-flight decode state after the stream was flushed
    fn reset(&mut self);
}

/// Builds a stage on the worker thread
pub type StageFactory = Box<dyn FnOnce() -> Result<Box<dyn PacketStage>, MirrorError> + Send>;

/// Counters shared between a worker and its owner
#[derive(Debug, Default)]
pub struct PipelineStats {
    packets: AtomicU64,
    frames: AtomicU64,
    decode_failures: AtomicU64,
    queue_dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    /// Packets taken from the queue
    pub packets: u64,
    /// Frames delivered to the sink
    pub frames: u64,
    /// Units skipped because decoding failed
    pub decode_failures: u64,
    /// Packets discarded by a `DropOldest` queue
    pub queue_dropped: u64,
}

impl PipelineStats {
    /// Read all counters
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A running decode worker
#[derive(Debug)]
pub struct DecodeWorker {
    kind: StreamKind,
    handle: JoinHandle<()>,
    stats: Arc<PipelineStats>,
}

impl DecodeWorker {
    /// Stream this worker decodes
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Live counters
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Whether the thread has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return its final counters
    ///
    /// Blocks; the worker exits once its queue sender is dropped.
    pub fn join(self) -> PipelineSnapshot {
        if self.handle.join().is_err() {
            tracing::error!(stream = %self.kind, "Decode worker panicked");
        }
        self.stats.snapshot()
    }
}

/// Start a decode worker for one stream
///
/// The worker stops when the queue closes or the session ends, and
/// fails the session after `failure_threshold` consecutive decode errors.
///
/// # Errors
///
/// Returns an I/O error if the thread cannot be spawned.
pub fn spawn_worker(
    kind: StreamKind,
    factory: StageFactory,
    rx: PacketReceiver<PlainPacket>,
    control: SessionControl,
    failure_threshold: u32,
) -> io::Result<DecodeWorker> {
    let stats = Arc::new(PipelineStats::default());
    let thread_stats = stats.clone();
    let handle = thread::Builder::new()
        .name(format!("mirror-{kind}-decode"))
        .spawn(move || run(kind, factory, rx, &control, failure_threshold, &thread_stats))?;
    Ok(DecodeWorker {
        kind,
        handle,
        stats,
    })
}

fn run(
    kind: StreamKind,
    factory: StageFactory,
    mut rx: PacketReceiver<PlainPacket>,
    control: &SessionControl,
    failure_threshold: u32,
    stats: &PipelineStats,
) {
    let mut stage = match factory() {
        Ok(stage) => stage,
        Err(e) => {
            tracing::error!(stream = %kind, error = %e, "Failed to create decoder");
            control.fail(&e);
            return;
        }
    };
    tracing::debug!(session_id = control.id(), stream = %kind, "Decode worker started");

    let mut consecutive = 0u32;
    while let Some(packet) = rx.blocking_recv() {
        if control.is_ended() {
            break;
        }
        stats.packets.fetch_add(1, Ordering::Relaxed);

        if packet.discontinuity {
            tracing::debug!(stream = %kind, sequence = packet.sequence, "Stream restarted");
            stage.reset();
            consecutive = 0;
        }

        match stage.handle(&packet) {
            Ok(frames) => {
                consecutive = 0;
                stats.frames.fetch_add(frames as u64, Ordering::Relaxed);
            }
            Err(e) => {
                consecutive += 1;
                stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    stream = %kind,
                    sequence = packet.sequence,
                    consecutive,
                    error = %e,
                    "Skipping undecodable unit"
                );
                if consecutive >= failure_threshold {
                    control.fail(&MirrorError::Decode {
                        message: format!("{consecutive} consecutive {kind} decode failures: {e}"),
                    });
                    break;
                }
            }
        }
    }

    stats.queue_dropped.store(rx.dropped(), Ordering::Relaxed);
    tracing::debug!(session_id = control.id(), stream = %kind, "Decode worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::bounded;
    use crate::protocol::rtp::PayloadType;
    use crate::session::{SessionManager, SessionState};
    use crate::types::QueuePolicy;
    use bytes::Bytes;
    use std::net::SocketAddr;

    struct Scripted {
        fail: bool,
        broken: bool,
    }

    impl Scripted {
        fn boxed(fail: bool) -> Box<dyn PacketStage> {
            Box::new(Self { fail, broken: false })
        }
    }

    impl PacketStage for Scripted {
        fn kind(&self) -> StreamKind {
            StreamKind::Video
        }

        fn handle(&mut self, packet: &PlainPacket) -> Result<usize, MirrorError> {
            // "!" wedges the stage until the next reset
            self.broken |= packet.payload.as_ref() == b"!";
            if self.fail || self.broken || packet.payload.is_empty() {
                return Err(MirrorError::Decode {
                    message: "bad unit".into(),
                });
            }
            Ok(1)
        }

        fn reset(&mut self) {
            self.broken = false;
        }
    }

    fn control() -> SessionControl {
        let manager = SessionManager::new();
        manager.set_accepting(true);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        manager.begin(peer).unwrap()
    }

    fn packet(sequence: u64, payload: &'static [u8]) -> PlainPacket {
        PlainPacket {
            kind: StreamKind::Video,
            payload_type: PayloadType::Video,
            sequence,
            timestamp: 0,
            marker: true,
            discontinuity: false,
            payload: Bytes::from_static(payload),
        }
    }

    fn restart(sequence: u64, payload: &'static [u8]) -> PlainPacket {
        PlainPacket {
            discontinuity: true,
            ..packet(sequence, payload)
        }
    }

    fn run_worker(fail: bool, packets: Vec<PlainPacket>, threshold: u32) -> (SessionControl, PipelineSnapshot) {
        let control = control();
        let (tx, rx) = bounded(64, QueuePolicy::Block);
        let worker = spawn_worker(
            StreamKind::Video,
            Box::new(move || Ok(Scripted::boxed(fail))),
            rx,
            control.clone(),
            threshold,
        )
        .unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            for p in packets {
                if tx.send(p).await.is_err() {
                    break;
                }
            }
        });
        (control, worker.join())
    }

    #[test]
    fn test_isolated_failures_are_skipped() {
        let packets = vec![packet(1, b"a"), packet(2, b""), packet(3, b"b"), packet(4, b"")];
        let (control, stats) = run_worker(false, packets, 2);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.decode_failures, 2);
        assert!(!control.is_ended());
    }

    #[test]
    fn test_sustained_failures_error_session() {
        let packets = (0..10).map(|i| packet(i, b"x")).collect();
        let (control, stats) = run_worker(true, packets, 3);
        assert_eq!(stats.decode_failures, 3);
        assert!(control.is_ended());
        assert!(matches!(control.state(), SessionState::Errored { .. }));
    }

    #[test]
    fn test_discontinuity_resets_stage() {
        let packets = vec![packet(1, b"a"), packet(2, b"!"), packet(3, b"b"), restart(90, b"c"), packet(91, b"d")];
        let (control, stats) = run_worker(false, packets, 5);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.decode_failures, 2);
        assert!(!control.is_ended());
    }

    #[test]
    fn test_worker_stops_after_session_closed() {
        let control = control();
        control.close("test");
        let (tx, rx) = bounded(4, QueuePolicy::Block);
        let worker = spawn_worker(
            StreamKind::Video,
            Box::new(|| Ok(Scripted::boxed(false))),
            rx,
            control,
            3,
        )
        .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            let _ = tx.send(packet(1, b"a")).await;
        });
        assert_eq!(worker.join().frames, 0);
    }

    #[test]
    fn test_factory_failure_errors_session() {
        let control = control();
        let (_tx, rx) = bounded(4, QueuePolicy::Block);
        let worker = spawn_worker(
            StreamKind::Audio,
            Box::new(|| {
                Err(MirrorError::Decode {
                    message: "no decoder".into(),
                })
            }),
            rx,
            control.clone(),
            3,
        )
        .unwrap();
        worker.join();
        assert!(control.is_ended());
    }
}
