//! Control-channel request handling for one session
//!
//! The handshake performs no I/O. Each decoded request goes in and an
//! [`Outcome`] comes out; the connection task writes responses and binds
//! data sockets when asked to.

use std::sync::Arc;

use bytes::Bytes;

use super::pairing::{LegacyPairingServer, PairingError, VerifyStep};
use super::manager::SessionControl;
use super::state::SessionState;
use crate::discovery::txt::{FEATURES, SOURCE_VERSION, STATUS_FLAGS};
use crate::error::MirrorError;
use crate::identity::Identity;
use crate::pipeline::{AudioCodec, AudioFormat};
use crate::protocol::crypto::Ed25519KeyPair;
use crate::protocol::plist::{self, PlistValue};
use crate::protocol::rtsp::{
    Method, ResponseBuilder, RtspRequest, RtspResponse, StatusCode, content_types, headers::names,
};
use crate::sink::StreamKind;
use crate::types::DisplayConfig;

/// SETUP stream type for screen video
pub const STREAM_TYPE_VIDEO: i64 = 110;
/// SETUP stream type for audio
pub const STREAM_TYPE_AUDIO: i64 = 96;

/// Volume reported before the sender sets one
const DEFAULT_VOLUME: f32 = 0.0;
/// Volume the sender uses for mute
const MUTE_VOLUME: f32 = -144.0;

const PUBLIC_METHODS: &str =
    "SETUP, RECORD, FLUSH, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER, POST, GET";

/// Everything about the receiver a session reports to its sender
#[derive(Clone)]
pub struct HandshakeContext {
    /// Identity at the time the connection was accepted
    pub identity: Identity,
    /// Receiver's long-term signing key
    pub signing_key: Arc<Ed25519KeyPair>,
    /// Reported device model
    pub model: String,
    /// Reported display capabilities
    pub display: DisplayConfig,
}

impl HandshakeContext {
    /// Receiver public key bytes
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        *self.signing_key.public_key().as_bytes()
    }
}

/// A stream the sender asked for at SETUP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    /// H.264 screen video
    Video {
        /// Identifier mixed into the stream key
        stream_connection_id: u64,
    },
    /// Audio in the negotiated format
    Audio {
        /// Identifier mixed into the stream key
        stream_connection_id: u64,
        /// Negotiated format
        format: AudioFormat,
    },
}

impl StreamRequest {
    /// Stream kind
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Video { .. } => StreamKind::Video,
            Self::Audio { .. } => StreamKind::Audio,
        }
    }

    /// Identifier mixed into the stream key
    #[must_use]
    pub fn stream_connection_id(&self) -> u64 {
        match self {
            Self::Video {
                stream_connection_id,
            }
            | Self::Audio {
                stream_connection_id,
                ..
            } => *stream_connection_id,
        }
    }
}

/// Streams waiting for data sockets
#[derive(Debug, Clone)]
pub struct StreamBinding {
    /// `CSeq` of the SETUP being answered
    pub cseq: u32,
    /// Requested streams, in request order
    pub streams: Vec<StreamRequest>,
}

/// What the connection task should do with a request
#[derive(Debug)]
pub enum Outcome {
    /// Write the response and keep going
    Respond(RtspResponse),
    /// Write the response, then close the connection
    RespondAndClose(RtspResponse),
    /// Restart every stream's receive and decode state, then write the
    /// response
    Flush(RtspResponse),
    /// Bind a data listener per stream, then answer with
    /// [`Handshake::complete_setup`], or with [`Handshake::setup_failed`]
    /// and close
    BindStreams(StreamBinding),
}

impl Outcome {
    /// The response to write, if one is ready
    #[must_use]
    pub fn response(&self) -> Option<&RtspResponse> {
        match self {
            Self::Respond(r) | Self::RespondAndClose(r) | Self::Flush(r) => Some(r),
            Self::BindStreams(_) => None,
        }
    }
}

/// Drives one session from accept to teardown
pub struct Handshake {
    control: SessionControl,
    context: HandshakeContext,
    pairing: LegacyPairingServer,
    streams: Vec<StreamKind>,
    volume: f32,
}

impl Handshake {
    /// Start handling requests for a freshly accepted session
    #[must_use]
    pub fn new(control: SessionControl, context: HandshakeContext) -> Self {
        let pairing = LegacyPairingServer::new(context.signing_key.clone());
        Self {
            control,
            context,
            pairing,
            streams: Vec::new(),
            volume: DEFAULT_VOLUME,
        }
    }

    /// Session this handshake belongs to
    #[must_use]
    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    /// Streams set up so far
    #[must_use]
    pub fn streams(&self) -> &[StreamKind] {
        &self.streams
    }

    /// Last volume set by the sender
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Handle one request
    pub fn handle(&mut self, request: &RtspRequest) -> Outcome {
        let cseq = request.cseq();
        let path = request.path();
        let state = self.control.state();

        if state.is_terminal() {
            return Outcome::RespondAndClose(error(StatusCode::METHOD_NOT_VALID, cseq));
        }
        if !state.allows(request.method, path) {
            let message = format!("{} {path} not allowed in state {state}", request.method);
            return self.violation(cseq, StatusCode::METHOD_NOT_VALID, message);
        }

        tracing::debug!(
            session_id = self.control.id(),
            method = %request.method,
            path,
            cseq,
            "Control request"
        );

        match (request.method, path) {
            (Method::Options, _) => Outcome::Respond(
                ok(cseq).header(names::PUBLIC, PUBLIC_METHODS).build(),
            ),
            (Method::Get, _) => self.info(request, cseq),
            (Method::Post, "/pair-setup") => self.pair_setup(&request.body, cseq),
            (Method::Post, "/pair-verify") => self.pair_verify(&request.body, cseq),
            (Method::Post, _) => Outcome::Respond(ok(cseq).build()),
            (Method::Flush, _) => self.flush(cseq),
            (Method::Setup, _) => self.setup(request, cseq),
            (Method::Record, _) => self.record(cseq),
            (Method::GetParameter, _) => self.get_parameter(request, cseq),
            (Method::SetParameter, _) => self.set_parameter(request, cseq),
            (Method::Teardown, _) => {
                self.control.close("teardown");
                Outcome::RespondAndClose(ok(cseq).build())
            }
        }
    }

    /// Answer a SETUP once its data listeners are bound
    ///
    /// `ports` holds one local port per stream in `binding`, in order.
    pub fn complete_setup(&mut self, binding: &StreamBinding, ports: &[u16]) -> RtspResponse {
        let mut entries = Vec::with_capacity(binding.streams.len());
        for (stream, port) in binding.streams.iter().zip(ports) {
            self.streams.push(stream.kind());
            let mut entry = vec![
                ("dataPort", PlistValue::from(*port)),
                ("streamConnectionID", stream_id_value(stream.stream_connection_id())),
            ];
            match stream {
                StreamRequest::Video { .. } => {
                    entry.push(("type", PlistValue::Integer(STREAM_TYPE_VIDEO)));
                }
                StreamRequest::Audio { .. } => {
                    entry.push(("type", PlistValue::Integer(STREAM_TYPE_AUDIO)));
                    entry.push(("controlPort", PlistValue::Integer(0)));
                }
            }
            entries.push(PlistValue::dict(entry));
        }

        tracing::info!(
            session_id = self.control.id(),
            streams = ?self.streams,
            "Streams set up"
        );
        ok(binding.cseq)
            .plist_body(&PlistValue::dict([("streams", PlistValue::Array(entries))]))
            .build()
    }

    /// Answer a SETUP whose listeners could not be bound
    ///
    /// Ends the session; the connection should close after writing this.
    pub fn setup_failed(&mut self, binding: &StreamBinding, err: &MirrorError) -> RtspResponse {
        self.control.fail(err);
        error(StatusCode::INTERNAL_ERROR, binding.cseq)
    }

    fn violation(&mut self, cseq: u32, status: StatusCode, message: String) -> Outcome {
        self.control.fail(&MirrorError::negotiation(message));
        Outcome::RespondAndClose(error(status, cseq))
    }

    fn info(&mut self, request: &RtspRequest, cseq: u32) -> Outcome {
        if !request.body.is_empty() {
            match plist::decode(&request.body) {
                Ok(qualifiers) => {
                    tracing::debug!(?qualifiers, "Sender info qualifiers");
                }
                Err(e) => {
                    let err = MirrorError::from(e);
                    self.control.fail(&err);
                    return Outcome::RespondAndClose(error(StatusCode::BAD_REQUEST, cseq));
                }
            }
        }
        Outcome::Respond(ok(cseq).plist_body(&self.info_document()).build())
    }

    /// Capability document answered to `GET /info`
    #[must_use]
    pub fn info_document(&self) -> PlistValue {
        let identity = &self.context.identity;
        let display = &self.context.display;
        let display_entry = PlistValue::dict([
            ("uuid", PlistValue::from(identity.pairing_uuid())),
            ("width", PlistValue::from(display.width)),
            ("height", PlistValue::from(display.height)),
            ("widthPixels", PlistValue::from(display.width)),
            ("heightPixels", PlistValue::from(display.height)),
            ("refreshRate", PlistValue::Real(f64::from(display.refresh_rate))),
            ("maxFPS", PlistValue::from(display.max_fps)),
            ("rotation", PlistValue::Boolean(false)),
            ("overscanned", PlistValue::Boolean(false)),
            ("features", PlistValue::Integer(14)),
        ]);
        let audio_format = |kind: i64| {
            PlistValue::dict([
                ("type", PlistValue::Integer(kind)),
                ("audioInputFormats", PlistValue::Integer(0x03FF_FFFC)),
                ("audioOutputFormats", PlistValue::Integer(0x03FF_FFFC)),
            ])
        };
        let latency = |kind: i64| {
            PlistValue::dict([
                ("type", PlistValue::Integer(kind)),
                ("audioType", PlistValue::from("default")),
                ("inputLatencyMicros", PlistValue::Integer(0)),
                ("outputLatencyMicros", PlistValue::Integer(0)),
            ])
        };

        #[allow(clippy::cast_possible_wrap)]
        let features = FEATURES as i64;
        PlistValue::dict([
            ("deviceID", PlistValue::from(identity.device_id())),
            ("macAddress", PlistValue::from(identity.device_id())),
            ("name", PlistValue::from(identity.display_name.as_str())),
            ("model", PlistValue::from(self.context.model.as_str())),
            ("features", PlistValue::Integer(features)),
            ("sourceVersion", PlistValue::from(SOURCE_VERSION)),
            ("statusFlags", PlistValue::from(STATUS_FLAGS)),
            ("pk", PlistValue::Data(self.context.public_key().to_vec())),
            ("pi", PlistValue::from(identity.pairing_uuid())),
            ("vv", PlistValue::Integer(2)),
            ("keepAliveLowPower", PlistValue::Boolean(true)),
            ("keepAliveSendStatsAsBody", PlistValue::Boolean(true)),
            ("displays", PlistValue::Array(vec![display_entry])),
            ("audioFormats", PlistValue::Array(vec![audio_format(100), audio_format(101)])),
            ("audioLatencies", PlistValue::Array(vec![latency(100), latency(101)])),
        ])
    }

    fn begin_authentication(&mut self) -> Result<(), MirrorError> {
        if self.control.state() == SessionState::Negotiating {
            self.control.transition(SessionState::Authenticating)?;
        }
        Ok(())
    }

    fn authentication_failed(&mut self, cseq: u32, err: PairingError) -> Outcome {
        let err = MirrorError::from(err);
        self.control.fail(&err);
        Outcome::RespondAndClose(error(StatusCode::CONNECTION_AUTH_REQUIRED, cseq))
    }

    fn pair_setup(&mut self, body: &[u8], cseq: u32) -> Outcome {
        if let Err(e) = self.begin_authentication() {
            self.control.fail(&e);
            return Outcome::RespondAndClose(error(StatusCode::INTERNAL_ERROR, cseq));
        }
        match self.pairing.handle_setup(body) {
            Ok(public_key) => Outcome::Respond(
                ok(cseq)
                    .binary_body(public_key, content_types::OCTET_STREAM)
                    .build(),
            ),
            Err(e) => self.authentication_failed(cseq, e),
        }
    }

    fn pair_verify(&mut self, body: &[u8], cseq: u32) -> Outcome {
        if let Err(e) = self.begin_authentication() {
            self.control.fail(&e);
            return Outcome::RespondAndClose(error(StatusCode::INTERNAL_ERROR, cseq));
        }
        match self.pairing.handle_verify(body) {
            Ok(VerifyStep::Reply(reply)) => Outcome::Respond(
                ok(cseq)
                    .binary_body(reply, content_types::OCTET_STREAM)
                    .build(),
            ),
            Ok(VerifyStep::Complete(result)) => {
                let installed = self
                    .control
                    .vault()
                    .install(result.shared_secret)
                    .map_err(MirrorError::from)
                    .and_then(|()| self.control.transition(SessionState::KeyDerived));
                match installed {
                    Ok(()) => {
                        tracing::info!(session_id = self.control.id(), "Sender authenticated");
                        Outcome::Respond(ok(cseq).build())
                    }
                    Err(e) => {
                        self.control.fail(&e);
                        Outcome::RespondAndClose(error(StatusCode::CONNECTION_AUTH_REQUIRED, cseq))
                    }
                }
            }
            Err(e) => self.authentication_failed(cseq, e),
        }
    }

    fn setup(&mut self, request: &RtspRequest, cseq: u32) -> Outcome {
        let body = if request.body.is_empty() {
            None
        } else {
            match plist::decode(&request.body) {
                Ok(body) => Some(body),
                Err(e) => {
                    return self.violation(cseq, StatusCode::BAD_REQUEST, format!("SETUP body: {e}"));
                }
            }
        };

        let Some(streams) = body.as_ref().and_then(|b| b.get("streams")) else {
            // Session-level setup: no event or timing channel is offered
            return Outcome::Respond(
                ok(cseq)
                    .plist_body(&PlistValue::dict([
                        ("eventPort", PlistValue::Integer(0)),
                        ("timingPort", PlistValue::Integer(0)),
                    ]))
                    .build(),
            );
        };

        match self.parse_streams(streams) {
            Ok(streams) => Outcome::BindStreams(StreamBinding { cseq, streams }),
            Err((status, message)) => self.violation(cseq, status, message),
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn parse_streams(&self, streams: &PlistValue) -> Result<Vec<StreamRequest>, (StatusCode, String)> {
        let bad = |m: String| (StatusCode::BAD_REQUEST, m);
        let unsupported = |m: String| (StatusCode::NOT_ACCEPTABLE, m);

        let entries = streams
            .as_array()
            .ok_or_else(|| bad("streams is not an array".into()))?;
        if entries.is_empty() {
            return Err(bad("streams array is empty".into()));
        }

        let mut requests: Vec<StreamRequest> = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = entry
                .get("type")
                .and_then(PlistValue::as_i64)
                .ok_or_else(|| bad("stream without type".into()))?;
            let stream_connection_id = entry
                .get("streamConnectionID")
                .and_then(PlistValue::as_i64)
                .map_or(0, |id| id as u64);

            let request = match kind {
                STREAM_TYPE_VIDEO => {
                    if let Some(codec) = entry.get("codec").and_then(PlistValue::as_str) {
                        if !codec.eq_ignore_ascii_case("h264") {
                            return Err(unsupported(format!("video codec {codec}")));
                        }
                    }
                    StreamRequest::Video {
                        stream_connection_id,
                    }
                }
                STREAM_TYPE_AUDIO => StreamRequest::Audio {
                    stream_connection_id,
                    format: parse_audio_format(entry).map_err(unsupported)?,
                },
                other => return Err(unsupported(format!("stream type {other}"))),
            };

            let kind = request.kind();
            if self.streams.contains(&kind) || requests.iter().any(|r| r.kind() == kind) {
                return Err(unsupported(format!("duplicate {kind} stream")));
            }
            requests.push(request);
        }
        Ok(requests)
    }

    fn record(&mut self, cseq: u32) -> Outcome {
        if self.streams.is_empty() {
            return self.violation(
                cseq,
                StatusCode::METHOD_NOT_VALID,
                "RECORD before any stream was set up".into(),
            );
        }
        if let Err(e) = self.control.transition(SessionState::Streaming) {
            self.control.fail(&e);
            return Outcome::RespondAndClose(error(StatusCode::METHOD_NOT_VALID, cseq));
        }
        tracing::info!(session_id = self.control.id(), "Streaming started");
        Outcome::Respond(ok(cseq).build())
    }

    fn flush(&self, cseq: u32) -> Outcome {
        if self.streams.is_empty() {
            return Outcome::Respond(ok(cseq).build());
        }
        tracing::debug!(session_id = self.control.id(), streams = ?self.streams, "Flushing streams");
        Outcome::Flush(ok(cseq).build())
    }

    fn get_parameter(&self, request: &RtspRequest, cseq: u32) -> Outcome {
        let asks_volume = std::str::from_utf8(&request.body)
            .is_ok_and(|body| body.lines().any(|l| l.trim() == "volume"));
        if asks_volume {
            let body = format!("volume: {:.6}\r\n", self.volume);
            return Outcome::Respond(ok(cseq).text_body(&body).build());
        }
        Outcome::Respond(ok(cseq).build())
    }

    fn set_parameter(&mut self, request: &RtspRequest, cseq: u32) -> Outcome {
        let is_text = request
            .headers
            .get(names::CONTENT_TYPE)
            .is_none_or(|ct| ct.starts_with(content_types::TEXT_PARAMETERS));
        if !is_text {
            // Artwork, metadata and progress are accepted and ignored
            return Outcome::Respond(ok(cseq).build());
        }

        let Ok(body) = std::str::from_utf8(&request.body) else {
            return Outcome::Respond(error(StatusCode::BAD_REQUEST, cseq));
        };
        for line in body.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim() != "volume" {
                continue;
            }
            match parse_volume(value) {
                Some(volume) => {
                    self.volume = volume;
                    self.control.volume_changed(volume);
                }
                None => {
                    tracing::debug!(value = value.trim(), "Ignoring invalid volume");
                    return Outcome::Respond(error(StatusCode::BAD_REQUEST, cseq));
                }
            }
        }
        Outcome::Respond(ok(cseq).build())
    }
}

fn server_name() -> String {
    format!("AirTunes/{SOURCE_VERSION}")
}

fn ok(cseq: u32) -> ResponseBuilder {
    ResponseBuilder::ok()
        .cseq(cseq)
        .header(names::SERVER, &server_name())
}

fn error(status: StatusCode, cseq: u32) -> RtspResponse {
    ResponseBuilder::error(status)
        .cseq(cseq)
        .header(names::SERVER, &server_name())
        .build()
}

#[allow(clippy::cast_possible_wrap)]
fn stream_id_value(id: u64) -> PlistValue {
    PlistValue::Integer(id as i64)
}

fn parse_volume(value: &str) -> Option<f32> {
    let volume: f32 = value.trim().parse().ok()?;
    (volume.is_finite() && (MUTE_VOLUME..=0.0).contains(&volume)).then_some(volume)
}

fn parse_audio_format(entry: &PlistValue) -> Result<AudioFormat, String> {
    let ct = entry
        .get("ct")
        .and_then(PlistValue::as_u64)
        .ok_or("audio stream without ct")?;
    let codec = AudioCodec::from_compression_type(ct).map_err(|e| e.to_string())?;

    let default_spf = match codec {
        AudioCodec::Pcm { .. } => 352,
        AudioCodec::AacLc => 1024,
        AudioCodec::AacEld => 480,
    };
    let field = |name: &str, default: u64| entry.get(name).and_then(PlistValue::as_u64).unwrap_or(default);

    let sample_rate = u32::try_from(field("sr", 44_100)).map_err(|_| "sample rate out of range")?;
    let channels = u8::try_from(field("ch", 2)).map_err(|_| "channel count out of range")?;
    let spf = u32::try_from(field("spf", default_spf)).map_err(|_| "spf out of range")?;
    let asc = entry
        .get("asc")
        .and_then(PlistValue::as_bytes)
        .map(Bytes::copy_from_slice);

    AudioFormat::new(codec, sample_rate, channels, spf, asc).map_err(|e| e.to_string())
}
