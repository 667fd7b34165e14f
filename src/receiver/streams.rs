//! Data-path plumbing for the streams of one session

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::MirrorError;
use crate::pipeline::{
    AudioDecoderFactory, AudioStage, DecodeWorker, PacketStage, PipelineSnapshot, StageFactory,
    VideoDecoderFactory, VideoDimensions, VideoStage, bounded, spawn_worker,
};
use crate::session::{SessionControl, StreamBinding, StreamRequest};
use crate::sink::FrameSink;
use crate::transport::io::{Activity, serve_audio, serve_video};
use crate::transport::{PlainPacket, TransportChannel, TransportStats};
use crate::types::{PipelineConfig, TransportConfig};

/// Everything a session needs to start its streams
#[derive(Clone)]
pub(super) struct StreamEnv {
    pub local_ip: IpAddr,
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
    pub sink: Arc<dyn FrameSink>,
    pub video_decoder: VideoDecoderFactory,
    pub audio_decoder: AudioDecoderFactory,
    pub dimensions: Arc<VideoDimensions>,
    pub activity: Arc<Activity>,
}

enum Listener {
    Video(TcpListener),
    Audio(UdpSocket),
}

impl Listener {
    fn port(&self) -> std::io::Result<u16> {
        match self {
            Self::Video(l) => l.local_addr().map(|a| a.port()),
            Self::Audio(s) => s.local_addr().map(|a| a.port()),
        }
    }
}

/// Reader tasks and decode workers running for one session
pub(super) struct SessionStreams {
    readers: Vec<JoinHandle<TransportStats>>,
    workers: Vec<DecodeWorker>,
    // bumped on every FLUSH; readers restart their channel when it moves
    flush_epoch: watch::Sender<u64>,
}

impl Default for SessionStreams {
    fn default() -> Self {
        let (flush_epoch, _) = watch::channel(0);
        Self {
            readers: Vec::new(),
            workers: Vec::new(),
            flush_epoch,
        }
    }
}

impl SessionStreams {
    /// Bind a data listener for every requested stream and start its
    /// reader and worker
    ///
    /// Returns the bound ports in request order. Nothing is started
    /// unless every listener binds and every stream key derives.
    pub async fn bind(
        &mut self,
        binding: &StreamBinding,
        control: &SessionControl,
        env: &StreamEnv,
    ) -> Result<Vec<u16>, MirrorError> {
        let any = SocketAddr::new(env.local_ip, 0);
        let mut prepared = Vec::with_capacity(binding.streams.len());
        for request in &binding.streams {
            let listener = match request {
                StreamRequest::Video { .. } => Listener::Video(TcpListener::bind(any).await?),
                StreamRequest::Audio { .. } => Listener::Audio(UdpSocket::bind(any).await?),
            };
            let channel = TransportChannel::new(
                control.id(),
                request.kind(),
                request.stream_connection_id(),
                control.vault(),
                &env.transport,
            )?;
            prepared.push((request.clone(), listener, channel));
        }

        let mut ports = Vec::with_capacity(prepared.len());
        for (request, listener, channel) in prepared {
            let port = listener.port()?;
            self.start(request, listener, channel, control, env)?;
            tracing::debug!(session_id = control.id(), port, "Data listener bound");
            ports.push(port);
        }
        Ok(ports)
    }

    fn start(
        &mut self,
        request: StreamRequest,
        listener: Listener,
        channel: TransportChannel,
        control: &SessionControl,
        env: &StreamEnv,
    ) -> Result<(), MirrorError> {
        let (tx, rx) = bounded::<PlainPacket>(env.pipeline.queue_capacity, env.pipeline.queue_policy);
        let kind = request.kind();

        let factory: StageFactory = match request {
            StreamRequest::Video { .. } => {
                let decoder = env.video_decoder.clone();
                let sink = env.sink.clone();
                let dimensions = env.dimensions.clone();
                let session_id = control.id();
                Box::new(move || {
                    let decoder = decoder()?;
                    Ok(Box::new(VideoStage::new(session_id, decoder, sink, dimensions)) as Box<dyn PacketStage>)
                })
            }
            StreamRequest::Audio { format, .. } => {
                let decoder = env.audio_decoder.clone();
                let sink = env.sink.clone();
                Box::new(move || {
                    let decoder = decoder(&format)?;
                    Ok(Box::new(AudioStage::new(decoder, format, sink)) as Box<dyn PacketStage>)
                })
            }
        };
        let worker = spawn_worker(
            kind,
            factory,
            rx,
            control.clone(),
            env.pipeline.decode_failure_threshold,
        )?;
        self.workers.push(worker);

        let control = control.clone();
        let activity = env.activity.clone();
        let flushes = self.flush_epoch.subscribe();
        let reader = match listener {
            Listener::Video(listener) => {
                tokio::spawn(serve_video(listener, channel, tx, control, activity, flushes))
            }
            Listener::Audio(socket) => {
                tokio::spawn(serve_audio(socket, channel, tx, control, activity, flushes))
            }
        };
        self.readers.push(reader);
        tracing::debug!(stream = %kind, "Stream started");
        Ok(())
    }

    /// Restart every stream after `FLUSH`
    ///
    /// Each reader drops its buffered packets and marks the next one it
    /// releases, so its worker resets the decoder state in order.
    pub fn flush(&self) {
        self.flush_epoch.send_modify(|epoch| *epoch += 1);
        tracing::debug!(epoch = *self.flush_epoch.borrow(), "Streams flushed");
    }

    /// Wait for readers and workers to stop
    ///
    /// Call after the session token has been cancelled; readers exit on
    /// cancellation and workers exit once their queues close.
    pub async fn shutdown(self, session_id: u64) {
        for reader in self.readers {
            match reader.await {
                Ok(stats) => tracing::debug!(session_id, ?stats, "Reader stopped"),
                Err(e) => tracing::error!(session_id, error = %e, "Reader task failed"),
            }
        }
        for worker in self.workers {
            let kind = worker.kind();
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(PipelineSnapshot {
                    packets,
                    frames,
                    decode_failures,
                    queue_dropped,
                }) => {
                    tracing::info!(
                        session_id,
                        stream = %kind,
                        packets,
                        frames,
                        decode_failures,
                        queue_dropped,
                        "Decode worker stopped"
                    );
                }
                Err(e) => tracing::error!(session_id, error = %e, "Failed to join decode worker"),
            }
        }
    }
}
