//! Network readers for the data channels
//!
//! Video arrives on a TCP connection as 4-byte big-endian length-prefixed
//! RTP packets. Audio arrives as one RTP packet per UDP datagram. Both
//! readers stop as soon as the session token is cancelled, restart their
//! channel whenever the flush epoch moves, and release held startup
//! packets once the channel's hold deadline passes.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::LengthDelimitedCodec;

use super::{PlainPacket, TransportChannel, TransportError, TransportStats};
use crate::error::MirrorError;
use crate::pipeline::queue::PacketSender;
use crate::session::SessionControl;

/// Largest framed video packet accepted
pub const MAX_VIDEO_PACKET: usize = 2 * 1024 * 1024;

/// Largest audio datagram accepted
const MAX_DATAGRAM: usize = 2048;

/// Last time any traffic was seen for a session
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    /// Start the clock now
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record traffic
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last recorded traffic
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass one raw packet through the channel and queue what it releases
///
/// Returns `false` when the reader should stop.
async fn deliver(
    channel: &mut TransportChannel,
    control: &SessionControl,
    tx: &PacketSender<PlainPacket>,
    raw: &[u8],
) -> bool {
    if control.is_ended() {
        return false;
    }
    match channel.on_packet(control.id(), raw) {
        Ok(packets) => forward(channel, control, tx, packets).await,
        Err(err @ TransportError::ThresholdExceeded { .. }) => {
            control.fail(&MirrorError::from(err));
            false
        }
        Err(_) => true,
    }
}

/// Queue released packets for the decode worker
///
/// Returns `false` when the reader should stop.
async fn forward(
    channel: &TransportChannel,
    control: &SessionControl,
    tx: &PacketSender<PlainPacket>,
    packets: Vec<PlainPacket>,
) -> bool {
    for packet in packets {
        tokio::select! {
            biased;
            () = control.token().cancelled() => return false,
            sent = tx.send(packet) => {
                if sent.is_err() {
                    tracing::debug!(kind = %channel.kind(), "Decode queue closed");
                    return false;
                }
            }
        }
    }
    true
}

fn hold_deadline(channel: &TransportChannel) -> Option<Instant> {
    channel.hold_deadline().map(Instant::from_std)
}

/// Accept the sender's video data connection and read it until the
/// session ends
pub async fn serve_video(
    listener: TcpListener,
    mut channel: TransportChannel,
    tx: PacketSender<PlainPacket>,
    control: SessionControl,
    activity: Arc<Activity>,
    mut flushes: watch::Receiver<u64>,
) -> TransportStats {
    let peer_ip = control.peer().ip();
    let stream = loop {
        let accepted = tokio::select! {
            biased;
            () = control.token().cancelled() => return channel.stats(),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) if addr.ip() == peer_ip => {
                tracing::debug!(session_id = control.id(), %addr, "Video data connection accepted");
                break stream;
            }
            Ok((_, addr)) => {
                tracing::warn!(%addr, "Ignoring data connection from foreign address");
            }
            Err(e) => {
                control.fail(&MirrorError::from(TransportError::Io(e)));
                return channel.stats();
            }
        }
    };
    let _ = stream.set_nodelay(true);

    let mut frames = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_VIDEO_PACKET)
        .new_read(stream);

    let mut flush_open = true;
    loop {
        let hold = hold_deadline(&channel);
        let frame = tokio::select! {
            biased;
            () = control.token().cancelled() => break,
            changed = flushes.changed(), if flush_open => {
                flush_open = changed.is_ok();
                if flush_open {
                    channel.flush();
                }
                continue;
            }
            () = tokio::time::sleep_until(hold.unwrap_or_else(Instant::now)), if hold.is_some() => {
                let held = channel.release_held();
                if !forward(&channel, &control, &tx, held).await {
                    break;
                }
                continue;
            }
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(raw)) => {
                activity.touch();
                if !deliver(&mut channel, &control, &tx, &raw).await {
                    break;
                }
            }
            Some(Err(e)) => {
                control.fail(&MirrorError::from(TransportError::Io(e)));
                break;
            }
            None => {
                tracing::debug!(session_id = control.id(), "Video data connection closed by sender");
                break;
            }
        }
    }

    let stats = channel.stats();
    tracing::info!(session_id = control.id(), ?stats, "Video transport finished");
    stats
}

/// Read audio datagrams from the session peer until the session ends
pub async fn serve_audio(
    socket: UdpSocket,
    mut channel: TransportChannel,
    tx: PacketSender<PlainPacket>,
    control: SessionControl,
    activity: Arc<Activity>,
    mut flushes: watch::Receiver<u64>,
) -> TransportStats {
    let peer_ip = control.peer().ip();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut foreign = 0u64;
    let mut flush_open = true;

    loop {
        let hold = hold_deadline(&channel);
        let received = tokio::select! {
            biased;
            () = control.token().cancelled() => break,
            changed = flushes.changed(), if flush_open => {
                flush_open = changed.is_ok();
                if flush_open {
                    channel.flush();
                }
                continue;
            }
            () = tokio::time::sleep_until(hold.unwrap_or_else(Instant::now)), if hold.is_some() => {
                let held = channel.release_held();
                if !forward(&channel, &control, &tx, held).await {
                    break;
                }
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, addr)) if is_from(addr, peer_ip) => {
                activity.touch();
                if !deliver(&mut channel, &control, &tx, &buf[..len]).await {
                    break;
                }
            }
            Ok((_, addr)) => {
                foreign += 1;
                tracing::debug!(%addr, "Ignoring datagram from foreign address");
            }
            Err(e) => {
                control.fail(&MirrorError::from(TransportError::Io(e)));
                break;
            }
        }
    }

    let stats = channel.stats();
    tracing::info!(session_id = control.id(), ?stats, foreign, "Audio transport finished");
    stats
}

fn is_from(addr: SocketAddr, peer_ip: IpAddr) -> bool {
    addr.ip() == peer_ip
}
