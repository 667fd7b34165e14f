//! Host-facing receiver
//!
//! [`MirrorReceiver`] ties the pieces together: it owns the identity and
//! its advertisement, accepts control connections on the RTSP port, runs
//! one session at a time and exposes the negotiated video size.

mod connection;
mod events;
mod streams;

#[cfg(test)]
mod tests;

pub use events::ReceiverEvent;

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use self::connection::ConnectionParams;
use self::streams::StreamEnv;
use crate::discovery::{DiscoveryService, MdnsPublisher, PublishOutcome, ServicePublisher};
use crate::error::MirrorError;
use crate::identity::{Identity, IdentityManager};
use crate::pipeline::{
    AudioDecoderFactory, VideoDecoderFactory, VideoDimensions, default_audio_decoder,
    default_video_decoder,
};
use crate::protocol::crypto::Ed25519KeyPair;
use crate::session::{HandshakeContext, SessionEvent, SessionInfo, SessionManager, SessionState};
use crate::sink::{AudioFrame, FrameSink, StreamDescriptor, VideoFrame};
use crate::transport::io::Activity;
use crate::types::{HostSettings, ReceiverConfig};

/// Forwards frames to the host sink and reports format changes as events
struct EventSink {
    inner: Arc<dyn FrameSink>,
    events: broadcast::Sender<ReceiverEvent>,
}

impl FrameSink for EventSink {
    fn on_video_frame(&self, frame: VideoFrame) {
        self.inner.on_video_frame(frame);
    }

    fn on_audio_frame(&self, frame: AudioFrame) {
        self.inner.on_audio_frame(frame);
    }

    fn on_format_changed(&self, descriptor: &StreamDescriptor) {
        self.inner.on_format_changed(descriptor);
        let _ = self.events.send(ReceiverEvent::FormatChanged(descriptor.clone()));
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
    forward: JoinHandle<()>,
}

struct Inner {
    config: RwLock<ReceiverConfig>,
    identity: IdentityManager,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn FrameSink>,
    video_decoder: VideoDecoderFactory,
    audio_decoder: AudioDecoderFactory,
    dimensions: Arc<VideoDimensions>,
    signing_key: Arc<Ed25519KeyPair>,
    events: broadcast::Sender<ReceiverEvent>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Inner {
    fn config(&self) -> ReceiverConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }

    fn connection_params(&self, local_addr: SocketAddr) -> ConnectionParams {
        let config = self.config();
        ConnectionParams {
            context: HandshakeContext {
                identity: self.identity.current(),
                signing_key: self.signing_key.clone(),
                model: config.model.clone(),
                display: config.display,
            },
            env: StreamEnv {
                local_ip: local_addr.ip(),
                transport: config.transport,
                pipeline: config.pipeline,
                sink: self.sink.clone(),
                video_decoder: self.video_decoder.clone(),
                audio_decoder: self.audio_decoder.clone(),
                dimensions: self.dimensions.clone(),
                activity: Arc::new(Activity::new()),
            },
            idle_timeout: config.session_idle_timeout,
        }
    }

    /// Publish the current identity and report it
    async fn publish(&self) -> Result<(), MirrorError> {
        let outcome = self.identity.apply().await?;
        let identity = self.identity.current();
        if outcome == PublishOutcome::Published {
            tracing::info!(name = %identity.display_name, "Advertisement published");
        }
        self.emit(ReceiverEvent::AdvertisementUpdated {
            name: identity.display_name.clone(),
            device_id: identity.device_id(),
        });
        Ok(())
    }
}

/// Builder for [`MirrorReceiver`]
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use airplay_mirror::{MirrorReceiver, NullSink, ReceiverConfig};
///
/// # async fn example() -> Result<(), airplay_mirror::MirrorError> {
/// let receiver = MirrorReceiver::builder(ReceiverConfig::with_name("Studio"))
///     .sink(Arc::new(NullSink))
///     .build()?;
/// receiver.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct ReceiverBuilder {
    config: ReceiverConfig,
    sink: Option<Arc<dyn FrameSink>>,
    publisher: Option<Arc<dyn ServicePublisher>>,
    video_decoder: Option<VideoDecoderFactory>,
    audio_decoder: Option<AudioDecoderFactory>,
    signing_key: Option<Ed25519KeyPair>,
}

impl ReceiverBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            sink: None,
            publisher: None,
            video_decoder: None,
            audio_decoder: None,
            signing_key: None,
        }
    }

    /// Where decoded frames go (default: discarded)
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publish through `publisher` instead of mDNS
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn ServicePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace the built-in video decoder
    ///
    /// Pass [`passthrough_video_decoder`](crate::pipeline::passthrough_video_decoder)
    /// to receive still-coded Annex-B units instead of I420 pictures.
    #[must_use]
    pub fn video_decoder(mut self, factory: VideoDecoderFactory) -> Self {
        self.video_decoder = Some(factory);
        self
    }

    /// Replace the built-in audio decoders
    #[must_use]
    pub fn audio_decoder(mut self, factory: AudioDecoderFactory) -> Self {
        self.audio_decoder = Some(factory);
        self
    }

    /// Use a persistent signing key instead of a fresh one
    #[must_use]
    pub fn signing_key(mut self, key: Ed25519KeyPair) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Build the receiver; nothing is bound or published yet
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the configuration fails validation.
    pub fn build(self) -> Result<MirrorReceiver, MirrorError> {
        self.config.validate()?;

        let (events, _) = broadcast::channel(128);
        let sink: Arc<dyn FrameSink> = Arc::new(EventSink {
            inner: self.sink.unwrap_or_else(|| Arc::new(crate::sink::NullSink)),
            events: events.clone(),
        });
        let signing_key = Arc::new(self.signing_key.unwrap_or_else(Ed25519KeyPair::generate));
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(MdnsPublisher::new()));

        let identity = IdentityManager::new(
            Identity::resolve(&self.config.display_name, self.config.mac_source),
            DiscoveryService::new(publisher, self.config.discovery_backoff),
            *signing_key.public_key().as_bytes(),
            self.config.model.clone(),
        );

        Ok(MirrorReceiver {
            inner: Arc::new(Inner {
                config: RwLock::new(self.config),
                identity,
                sessions: SessionManager::new(),
                sink,
                video_decoder: self.video_decoder.unwrap_or_else(default_video_decoder),
                audio_decoder: self.audio_decoder.unwrap_or_else(default_audio_decoder),
                dimensions: Arc::new(VideoDimensions::new()),
                signing_key,
                events,
                running: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

/// A screen-mirroring receiver
///
/// Cheap to clone; clones share the same receiver.
#[derive(Clone)]
pub struct MirrorReceiver {
    inner: Arc<Inner>,
}

impl MirrorReceiver {
    /// Create a receiver advertising over mDNS with built-in decoders
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the configuration fails validation.
    pub fn create(config: ReceiverConfig, sink: Arc<dyn FrameSink>) -> Result<Self, MirrorError> {
        ReceiverBuilder::new(config).sink(sink).build()
    }

    /// Start building a receiver
    #[must_use]
    pub fn builder(config: ReceiverConfig) -> ReceiverBuilder {
        ReceiverBuilder::new(config)
    }

    /// Subscribe to receiver events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.inner.events.subscribe()
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> ReceiverConfig {
        self.inner.config()
    }

    /// Current identity
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.inner.identity.current()
    }

    /// Receiver long-term public key, as advertised in `pk`
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        *self.inner.signing_key.public_key().as_bytes()
    }

    /// Receiver-level state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.sessions.phase()
    }

    /// The live session, if any
    #[must_use]
    pub fn session(&self) -> Option<SessionInfo> {
        self.inner.sessions.current()
    }

    /// Whether the advertisement is on the network
    #[must_use]
    pub fn is_advertising(&self) -> bool {
        self.inner.identity.discovery().is_advertising()
    }

    /// Negotiated video width, 0 when nothing is streaming
    #[must_use]
    pub fn width(&self) -> u32 {
        self.inner.dimensions.get().0
    }

    /// Negotiated video height, 0 when nothing is streaming
    #[must_use]
    pub fn height(&self) -> u32 {
        self.inner.dimensions.get().1
    }

    /// Address the control port is bound to while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the control port, publish the advertisement and start
    /// accepting senders
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if already running, `NetworkError` if the
    /// port cannot be bound and `Discovery` for a publication failure that
    /// retrying cannot fix.
    pub async fn start(&self) -> Result<SocketAddr, MirrorError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(MirrorError::InvalidState {
                message: "receiver already running".to_string(),
                current_state: self.state().to_string(),
            });
        }

        let config = self.inner.config();
        let listener = TcpListener::bind((config.bind_address, config.rtsp_port)).await?;
        let local_addr = listener.local_addr()?;
        self.inner.identity.set_port(local_addr.port());

        if let Err(e) = self.inner.publish().await {
            tracing::error!(error = %e, "Failed to publish advertisement");
            return Err(e);
        }
        self.inner.sessions.set_accepting(true);

        let shutdown = CancellationToken::new();
        let forward = tokio::spawn(forward_session_events(
            self.inner.clone(),
            self.inner.sessions.subscribe(),
            shutdown.clone(),
        ));
        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown.clone()));

        *running = Some(Running {
            local_addr,
            shutdown,
            accept,
            forward,
        });
        drop(running);

        let name = self.identity().display_name;
        tracing::info!(%local_addr, %name, "Receiver started");
        self.inner.emit(ReceiverEvent::Started {
            name,
            port: local_addr.port(),
        });
        Ok(local_addr)
    }

    /// Close the live session, withdraw the advertisement and stop
    /// accepting senders. Does nothing when not running.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        self.inner.sessions.set_accepting(false);
        self.inner.sessions.close_active("receiver stopped");
        running.shutdown.cancel();
        if let Err(e) = running.accept.await {
            tracing::error!(error = %e, "Accept loop failed");
        }
        let _ = running.forward.await;
        self.inner.identity.withdraw().await;

        tracing::info!("Receiver stopped");
        self.inner.emit(ReceiverEvent::Stopped);
    }

    /// Replace the configuration
    ///
    /// Identity settings (name, MAC source) are re-resolved when they
    /// changed; with `auto_apply` the advertisement is republished right
    /// away. A live session is not interrupted. Transport, pipeline and
    /// display settings apply from the next session.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration, leaving the
    /// current one in place, or `Discovery` if republishing fails.
    pub async fn update(&self, config: ReceiverConfig) -> Result<(), MirrorError> {
        config.validate()?;
        let (identity_changed, auto_apply) = {
            let mut current = self.inner.config.write().unwrap_or_else(PoisonError::into_inner);
            let changed = current.identity_differs(&config);
            let auto_apply = config.auto_apply;
            *current = config;
            (changed, auto_apply)
        };
        tracing::debug!(identity_changed, auto_apply, "Configuration updated");

        if identity_changed && auto_apply {
            self.apply_settings().await?;
        }
        Ok(())
    }

    /// Apply the host's JSON settings object on top of the current
    /// configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed JSON, otherwise as for
    /// [`update`](Self::update).
    pub async fn update_from_json(&self, json: &str) -> Result<(), MirrorError> {
        let settings = HostSettings::from_json(json)?;
        let mut config = self.config();
        config.apply_host_settings(&settings);
        self.update(config).await
    }

    /// Re-resolve the identity from the current configuration and
    /// republish it when running
    ///
    /// With a random MAC source this always produces a new address.
    ///
    /// # Errors
    ///
    /// Returns `Discovery` for a publication failure retrying cannot fix.
    pub async fn apply_settings(&self) -> Result<(), MirrorError> {
        let config = self.inner.config();
        self.inner
            .identity
            .configure(&config.display_name, config.mac_source)
            .await;

        // Hold the lock so a concurrent stop cannot interleave
        let running = self.inner.running.lock().await;
        if running.is_some() {
            self.inner.publish().await?;
        }
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                inner.emit(ReceiverEvent::Error {
                    message: format!("accept failed: {e}"),
                });
                continue;
            }
        };

        let control = match inner.sessions.begin(peer) {
            Ok(control) => control,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Connection refused");
                drop(stream);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                control.fail(&MirrorError::NetworkError(e));
                control.release();
                continue;
            }
        };

        let params = inner.connection_params(local_addr);
        connections.spawn(connection::serve(stream, control, params));
    }

    // Sessions were closed before shutdown; wait for their cleanup
    while connections.join_next().await.is_some() {}
}

async fn forward_session_events(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            () = shutdown.cancelled() => break,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let forwarded = match event {
            SessionEvent::Started { session_id, peer } => {
                ReceiverEvent::SessionStarted { session_id, peer }
            }
            SessionEvent::Rejected { peer } => ReceiverEvent::SessionRejected { peer },
            SessionEvent::StateChanged {
                session_id,
                state: SessionState::Streaming,
            } => ReceiverEvent::StreamingStarted { session_id },
            SessionEvent::StateChanged { .. } => continue,
            SessionEvent::VolumeChanged { session_id, volume } => ReceiverEvent::VolumeChanged {
                session_id,
                db: volume,
            },
            SessionEvent::Ended { session_id, state } => {
                if let SessionState::Errored { reason } = &state {
                    inner.emit(ReceiverEvent::Error {
                        message: format!("session {session_id}: {reason}"),
                    });
                }
                ReceiverEvent::SessionEnded { session_id, state }
            }
        };
        inner.emit(forwarded);
    }
}
