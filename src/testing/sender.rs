//! Test double for a mirroring sender
//!
//! Drives the control channel over TCP, pairs, sets up streams and sends
//! sealed media the way a real sender does. Everything here is for tests
//! and examples; nothing in the receiver depends on it.

use std::net::SocketAddr;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use zeroize::Zeroizing;

use crate::protocol::crypto::{
    CryptoError, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, EphemeralKeyPair,
    SignatureCipher, X25519PublicKey, lengths,
};
use crate::protocol::plist::PlistValue;
use crate::protocol::rtp::{PayloadType, RtpHeader};
use crate::protocol::rtsp::{
    Method, ParseError, RtspRequest, RtspRequestBuilder, RtspResponse, content_types,
};
use crate::session::handshake::{STREAM_TYPE_AUDIO, STREAM_TYPE_VIDEO};
use crate::session::keys::derive_stream_key;
use crate::session::pairing::PairingError;
use crate::sink::StreamKind;
use crate::transport::seal;

const SSRC: u32 = 0x1234_5678;

/// Mock sender errors
#[derive(Debug, Error)]
pub enum MockSenderError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Response could not be parsed
    #[error("invalid response: {0}")]
    Parse(#[from] ParseError),

    /// Receiver closed the control connection
    #[error("connection closed by receiver")]
    Closed,

    /// Receiver answered with an error status
    #[error("request failed with status {0}")]
    Status(u16),

    /// Response body was not what the sender expected
    #[error("unexpected response: {0}")]
    Unexpected(String),

    /// Pairing failed on the sender side
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// Key derivation or sealing failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Media sent before the stream was set up
    #[error("stream not set up")]
    NotSetup,
}

/// Sender half of legacy pair-verify
pub struct SenderPairing {
    identity: Ed25519KeyPair,
    ephemeral_public: X25519PublicKey,
    ephemeral: Option<EphemeralKeyPair>,
    secret: Option<Zeroizing<[u8; 32]>>,
}

impl SenderPairing {
    /// Fresh long-term and ephemeral keys
    #[must_use]
    pub fn new() -> Self {
        let ephemeral = EphemeralKeyPair::generate();
        Self {
            identity: Ed25519KeyPair::generate(),
            ephemeral_public: ephemeral.public_key(),
            ephemeral: Some(ephemeral),
            secret: None,
        }
    }

    /// Long-term Ed25519 public key, the pair-setup body
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        *self.identity.public_key().as_bytes()
    }

    /// First pair-verify body: flag, X25519 key, Ed25519 key
    #[must_use]
    pub fn verify_start(&self) -> Vec<u8> {
        let mut body = vec![1, 0, 0, 0];
        body.extend_from_slice(self.ephemeral_public.as_bytes());
        body.extend_from_slice(&self.public_key());
        body
    }

    /// Check the receiver's reply and build the finishing body
    ///
    /// # Errors
    ///
    /// Returns `PairingError` if the reply is malformed or the receiver's
    /// signature does not verify against `receiver_public_key`.
    pub fn verify_finish(
        &mut self,
        reply: &[u8],
        receiver_public_key: &[u8],
    ) -> Result<Vec<u8>, PairingError> {
        let expected = lengths::X25519_PUBLIC_KEY + lengths::ED25519_SIGNATURE;
        if reply.len() != expected {
            return Err(PairingError::MalformedMessage {
                expected,
                actual: reply.len(),
            });
        }
        let (receiver_x, encrypted) = reply.split_at(lengths::X25519_PUBLIC_KEY);
        let receiver_public = X25519PublicKey::from_bytes(receiver_x)?;
        let receiver_ed = Ed25519PublicKey::from_bytes(receiver_public_key)?;
        let ephemeral = self.ephemeral.take().ok_or(PairingError::InvalidState)?;
        let secret = ephemeral.agree(&receiver_public)?;
        let sender_x = *self.ephemeral_public.as_bytes();

        let mut cipher = SignatureCipher::new(secret.as_bytes());
        let signature = Ed25519Signature::from_bytes(&cipher.apply(encrypted))?;
        let mut signed = Vec::with_capacity(64);
        signed.extend_from_slice(receiver_x);
        signed.extend_from_slice(&sender_x);
        receiver_ed
            .verify(&signed, &signature)
            .map_err(|_| PairingError::SignatureVerificationFailed)?;

        let mut signed = Vec::with_capacity(64);
        signed.extend_from_slice(&sender_x);
        signed.extend_from_slice(receiver_x);
        let own = self.identity.sign(&signed).to_bytes();

        let mut body = vec![0, 0, 0, 0];
        body.extend(cipher.apply(&own));
        self.secret = Some(Zeroizing::new(*secret.as_bytes()));
        Ok(body)
    }

    /// Shared secret once `verify_finish` succeeded
    #[must_use]
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        self.secret.as_deref().copied()
    }
}

impl Default for SenderPairing {
    fn default() -> Self {
        Self::new()
    }
}

/// Audio parameters offered at SETUP
#[derive(Debug, Clone, Copy)]
pub struct MockAudio {
    /// Compression type (`ct`)
    pub compression_type: u8,
    /// Sample rate
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Samples per frame
    pub samples_per_frame: u32,
}

impl MockAudio {
    /// 16-bit stereo PCM, 352 samples per packet
    #[must_use]
    pub fn pcm() -> Self {
        Self {
            compression_type: 1,
            sample_rate: 44_100,
            channels: 2,
            samples_per_frame: 352,
        }
    }
}

/// Data ports returned by a stream SETUP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPorts {
    /// Video data port
    pub video: Option<u16>,
    /// Audio data port
    pub audio: Option<u16>,
}

struct Outbound<S> {
    socket: S,
    key: Zeroizing<[u8; 32]>,
    sequence: u64,
}

impl<S> Outbound<S> {
    fn packet(
        &mut self,
        payload_type: PayloadType,
        marker: bool,
        timestamp: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sequence = self.sequence;
        self.sequence += 1;
        #[allow(clippy::cast_possible_truncation)]
        let header = RtpHeader::new(payload_type, sequence as u16, timestamp, SSRC)
            .with_marker(marker)
            .encode();
        let mut packet = header.to_vec();
        packet.extend(seal(&self.key, sequence, &header, body)?);
        Ok(packet)
    }
}

/// A scripted sender talking to a receiver over real sockets
pub struct MockSender {
    receiver: SocketAddr,
    control: TcpStream,
    buffer: BytesMut,
    cseq: u32,
    pairing: SenderPairing,
    video_id: u64,
    audio_id: u64,
    video: Option<Outbound<TcpStream>>,
    audio: Option<Outbound<UdpSocket>>,
}

impl MockSender {
    /// Open the control connection
    ///
    /// # Errors
    ///
    /// Returns `Io` if the receiver cannot be reached.
    pub async fn connect(receiver: SocketAddr) -> Result<Self, MockSenderError> {
        let control = TcpStream::connect(receiver).await?;
        control.set_nodelay(true)?;
        Ok(Self {
            receiver,
            control,
            buffer: BytesMut::with_capacity(4096),
            cseq: 0,
            pairing: SenderPairing::new(),
            video_id: 0x0A0B_0C0D_0E0F_1011,
            audio_id: 0x2122_2324_2526_2728,
            video: None,
            audio: None,
        })
    }

    fn uri(&self) -> String {
        format!("rtsp://{}/{}", self.receiver.ip(), self.video_id)
    }

    /// Start building a request with the next `CSeq`
    pub fn request(&mut self, method: Method, uri: &str) -> RtspRequestBuilder {
        self.cseq += 1;
        RtspRequest::builder(method, uri)
            .cseq(self.cseq)
            .header("User-Agent", "AirPlay/550.10")
    }

    /// Send a request and read its response, whatever the status
    ///
    /// # Errors
    ///
    /// Returns `Closed` when the receiver hangs up first.
    pub async fn send(&mut self, request: &RtspRequest) -> Result<RtspResponse, MockSenderError> {
        self.control.write_all(&request.encode()).await?;
        loop {
            if let Some((response, consumed)) = RtspResponse::parse(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(response);
            }
            if self.control.read_buf(&mut self.buffer).await? == 0 {
                return Err(MockSenderError::Closed);
            }
        }
    }

    async fn expect_ok(&mut self, request: &RtspRequest) -> Result<RtspResponse, MockSenderError> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(MockSenderError::Status(response.status.as_u16()))
        }
    }

    /// Write raw bytes on the control connection
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), MockSenderError> {
        self.control.write_all(bytes).await?;
        Ok(())
    }

    /// Whether the receiver has closed the control connection
    ///
    /// # Errors
    ///
    /// Returns `Io` on read failure.
    pub async fn is_closed(&mut self) -> Result<bool, MockSenderError> {
        let mut byte = [0u8; 1];
        Ok(self.control.read(&mut byte).await? == 0)
    }

    /// `OPTIONS *`
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a non-success status.
    pub async fn options(&mut self) -> Result<RtspResponse, MockSenderError> {
        let request = self.request(Method::Options, "*").build();
        self.expect_ok(&request).await
    }

    /// `GET /info`, returning the capability document
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a non-success status or a bad body.
    pub async fn info(&mut self) -> Result<PlistValue, MockSenderError> {
        let request = self.request(Method::Get, "/info").build();
        let response = self.expect_ok(&request).await?;
        response
            .body_as_plist()
            .map_err(|e| MockSenderError::Unexpected(e.to_string()))
    }

    /// Pair-setup followed by both pair-verify rounds
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a non-success status or a bad signature.
    pub async fn pair(&mut self) -> Result<(), MockSenderError> {
        let request = self
            .request(Method::Post, "/pair-setup")
            .content_type(content_types::OCTET_STREAM)
            .body(self.pairing.public_key().to_vec())
            .build();
        let receiver_pk = self.expect_ok(&request).await?.body;

        let request = self
            .request(Method::Post, "/pair-verify")
            .content_type(content_types::OCTET_STREAM)
            .body(self.pairing.verify_start())
            .build();
        let reply = self.expect_ok(&request).await?.body;

        let finish = self.pairing.verify_finish(&reply, &receiver_pk)?;
        let request = self
            .request(Method::Post, "/pair-verify")
            .content_type(content_types::OCTET_STREAM)
            .body(finish)
            .build();
        self.expect_ok(&request).await?;
        Ok(())
    }

    /// Shared secret from pairing
    #[must_use]
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        self.pairing.shared_secret()
    }

    /// SETUP the requested streams and open their data connections
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a non-success status, a missing data port, or
    /// when called before pairing.
    pub async fn setup(
        &mut self,
        video: bool,
        audio: Option<MockAudio>,
    ) -> Result<StreamPorts, MockSenderError> {
        let secret = self.pairing.shared_secret().ok_or(MockSenderError::NotSetup)?;

        let mut streams = Vec::new();
        if video {
            streams.push(PlistValue::dict([
                ("type", PlistValue::Integer(STREAM_TYPE_VIDEO)),
                ("streamConnectionID", stream_id(self.video_id)),
                ("codec", PlistValue::from("h264")),
            ]));
        }
        if let Some(audio) = audio {
            streams.push(PlistValue::dict([
                ("type", PlistValue::Integer(STREAM_TYPE_AUDIO)),
                ("streamConnectionID", stream_id(self.audio_id)),
                ("ct", PlistValue::Integer(i64::from(audio.compression_type))),
                ("sr", PlistValue::from(audio.sample_rate)),
                ("ch", PlistValue::Integer(i64::from(audio.channels))),
                ("spf", PlistValue::from(audio.samples_per_frame)),
            ]));
        }

        let uri = self.uri();
        let request = self
            .request(Method::Setup, &uri)
            .body_plist(&PlistValue::dict([("streams", PlistValue::Array(streams))]))
            .build();
        let response = self.expect_ok(&request).await?;
        let body = response
            .body_as_plist()
            .map_err(|e| MockSenderError::Unexpected(e.to_string()))?;

        let mut ports = StreamPorts::default();
        for entry in body.get("streams").and_then(PlistValue::as_array).unwrap_or_default() {
            let port = entry
                .get("dataPort")
                .and_then(PlistValue::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| MockSenderError::Unexpected("stream without dataPort".into()))?;
            match entry.get("type").and_then(PlistValue::as_i64) {
                Some(STREAM_TYPE_VIDEO) => ports.video = Some(port),
                Some(STREAM_TYPE_AUDIO) => ports.audio = Some(port),
                other => {
                    return Err(MockSenderError::Unexpected(format!("stream type {other:?}")));
                }
            }
        }

        if let Some(port) = ports.video {
            let socket = TcpStream::connect(SocketAddr::new(self.receiver.ip(), port)).await?;
            socket.set_nodelay(true)?;
            self.video = Some(Outbound {
                socket,
                key: derive_stream_key(&secret, StreamKind::Video, self.video_id)?,
                sequence: 0,
            });
        }
        if let Some(port) = ports.audio {
            let local = self.control.local_addr()?;
            let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
            socket.connect(SocketAddr::new(self.receiver.ip(), port)).await?;
            self.audio = Some(Outbound {
                socket,
                key: derive_stream_key(&secret, StreamKind::Audio, self.audio_id)?,
                sequence: 0,
            });
        }
        Ok(ports)
    }

    /// RECORD
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a non-success status.
    pub async fn record(&mut self) -> Result<RtspResponse, MockSenderError> {
        let uri = self.uri();
        let request = self.request(Method::Record, &uri).build();
        self.expect_ok(&request).await
    }

    /// FLUSH, then resume both data streams `skip` sequence numbers later
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a non-success status.
    pub async fn flush(&mut self, skip: u64) -> Result<RtspResponse, MockSenderError> {
        let uri = self.uri();
        let request = self.request(Method::Flush, &uri).build();
        let response = self.expect_ok(&request).await?;
        if let Some(video) = self.video.as_mut() {
            video.sequence += skip;
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.sequence += skip;
        }
        Ok(response)
    }

    /// `SET_PARAMETER volume`
    ///
    /// # Errors
    ///
    /// Fails on I/O errors; the status is left to the caller.
    pub async fn set_volume(&mut self, db: f32) -> Result<RtspResponse, MockSenderError> {
        let uri = self.uri();
        let request = self
            .request(Method::SetParameter, &uri)
            .content_type(content_types::TEXT_PARAMETERS)
            .body(format!("volume: {db:.6}\r\n").into_bytes())
            .build();
        self.send(&request).await
    }

    /// TEARDOWN
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a non-success status.
    pub async fn teardown(&mut self) -> Result<RtspResponse, MockSenderError> {
        let uri = self.uri();
        let request = self.request(Method::Teardown, &uri).build();
        self.expect_ok(&request).await
    }

    /// Seal the next video packet without sending it
    ///
    /// # Errors
    ///
    /// Returns `NotSetup` before a video SETUP.
    pub fn seal_video(
        &mut self,
        payload_type: PayloadType,
        marker: bool,
        timestamp: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, MockSenderError> {
        let video = self.video.as_mut().ok_or(MockSenderError::NotSetup)?;
        Ok(video.packet(payload_type, marker, timestamp, body)?)
    }

    /// Write one length-prefixed packet on the video connection
    ///
    /// # Errors
    ///
    /// Returns `NotSetup` before a video SETUP, `Io` on write failure.
    pub async fn write_video(&mut self, packet: &[u8]) -> Result<(), MockSenderError> {
        let video = self.video.as_mut().ok_or(MockSenderError::NotSetup)?;
        let len = u32::try_from(packet.len())
            .map_err(|_| MockSenderError::Unexpected("packet too large".into()))?;
        video.socket.write_all(&len.to_be_bytes()).await?;
        video.socket.write_all(packet).await?;
        Ok(())
    }

    /// Send the avcC configuration record
    ///
    /// # Errors
    ///
    /// As for [`Self::write_video`].
    pub async fn send_video_config(&mut self, avcc: &[u8]) -> Result<(), MockSenderError> {
        let packet = self.seal_video(PayloadType::VideoConfig, true, 0, avcc)?;
        self.write_video(&packet).await
    }

    /// Send one access unit split into fragments of at most
    /// `fragment_size` bytes, the last carrying the marker bit
    ///
    /// # Errors
    ///
    /// As for [`Self::write_video`].
    pub async fn send_access_unit(
        &mut self,
        timestamp: u32,
        unit: &[u8],
        fragment_size: usize,
    ) -> Result<(), MockSenderError> {
        let fragments: Vec<&[u8]> = unit.chunks(fragment_size.max(1)).collect();
        let last = fragments.len().saturating_sub(1);
        for (i, fragment) in fragments.into_iter().enumerate() {
            let packet = self.seal_video(PayloadType::Video, i == last, timestamp, fragment)?;
            self.write_video(&packet).await?;
        }
        Ok(())
    }

    /// Seal the next audio packet without sending it
    ///
    /// # Errors
    ///
    /// Returns `NotSetup` before an audio SETUP.
    pub fn seal_audio(&mut self, timestamp: u32, body: &[u8]) -> Result<Vec<u8>, MockSenderError> {
        let audio = self.audio.as_mut().ok_or(MockSenderError::NotSetup)?;
        Ok(audio.packet(PayloadType::Audio, false, timestamp, body)?)
    }

    /// Send one datagram on the audio socket
    ///
    /// # Errors
    ///
    /// Returns `NotSetup` before an audio SETUP, `Io` on send failure.
    pub async fn write_audio(&mut self, packet: &[u8]) -> Result<(), MockSenderError> {
        let audio = self.audio.as_ref().ok_or(MockSenderError::NotSetup)?;
        audio.socket.send(packet).await?;
        Ok(())
    }

    /// Seal and send one audio packet
    ///
    /// # Errors
    ///
    /// As for [`Self::write_audio`].
    pub async fn send_audio(&mut self, timestamp: u32, body: &[u8]) -> Result<(), MockSenderError> {
        let packet = self.seal_audio(timestamp, body)?;
        self.write_audio(&packet).await
    }
}

#[allow(clippy::cast_possible_wrap)]
fn stream_id(id: u64) -> PlistValue {
    PlistValue::Integer(id as i64)
}
