//! Control connection task for one session

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

use super::streams::{SessionStreams, StreamEnv};
use crate::error::MirrorError;
use crate::protocol::rtsp::{ResponseBuilder, RtspResponse, RtspServerCodec, StatusCode, encode_response};
use crate::session::{Handshake, HandshakeContext, Outcome, SessionControl};

/// Shortest interval between idle checks
const MIN_IDLE_CHECK: Duration = Duration::from_millis(50);

/// Per-connection settings captured when the sender connected
pub(super) struct ConnectionParams {
    pub context: HandshakeContext,
    pub env: StreamEnv,
    /// Zero disables the idle check
    pub idle_timeout: Duration,
}

/// Serve the control channel until the session ends, then stop its streams
/// and free the slot
pub(super) async fn serve(mut stream: TcpStream, control: SessionControl, params: ConnectionParams) {
    let session_id = control.id();
    let ConnectionParams {
        context,
        env,
        idle_timeout,
    } = params;
    let activity = env.activity.clone();
    let dimensions = env.dimensions.clone();
    dimensions.claim(session_id);

    let mut handshake = Handshake::new(control.clone(), context);
    let mut streams = SessionStreams::default();
    let mut codec = RtspServerCodec::new();
    let mut buf = vec![0u8; 4096];

    let mut idle_check = tokio::time::interval((idle_timeout / 4).max(MIN_IDLE_CHECK));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'connection: loop {
        let read = tokio::select! {
            biased;
            () = control.token().cancelled() => break,
            _ = idle_check.tick(), if !idle_timeout.is_zero() => {
                if activity.idle_for() >= idle_timeout {
                    tracing::info!(session_id, ?idle_timeout, "Session idle, closing");
                    control.fail(&MirrorError::transport("session idle timeout"));
                    break;
                }
                continue;
            }
            read = stream.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!(session_id, "Sender closed the control connection");
                control.close("peer disconnected");
                break;
            }
            Ok(n) => {
                activity.touch();
                codec.feed(&buf[..n]);
            }
            Err(e) => {
                control.fail(&MirrorError::NetworkError(e));
                break;
            }
        }

        loop {
            let request = match codec.decode() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    control.fail(&MirrorError::from(e));
                    let response = ResponseBuilder::error(StatusCode::BAD_REQUEST).build();
                    let _ = write(&mut stream, &response).await;
                    break 'connection;
                }
            };

            let (response, close) = match handshake.handle(&request) {
                Outcome::Respond(response) => (response, false),
                Outcome::RespondAndClose(response) => (response, true),
                Outcome::Flush(response) => {
                    streams.flush();
                    (response, false)
                }
                Outcome::BindStreams(binding) => {
                    match streams.bind(&binding, &control, &env).await {
                        Ok(ports) => (handshake.complete_setup(&binding, &ports), false),
                        Err(e) => (handshake.setup_failed(&binding, &e), true),
                    }
                }
            };

            if let Err(e) = write(&mut stream, &response).await {
                tracing::debug!(session_id, error = %e, "Failed to write response");
                control.close("control connection lost");
                break 'connection;
            }
            if close {
                break 'connection;
            }
        }
    }

    // Terminal transitions are idempotent; this covers every exit path
    control.close("connection finished");
    let _ = stream.shutdown().await;
    streams.shutdown(session_id).await;
    if !dimensions.release(session_id) {
        tracing::debug!(session_id, "Dimensions already claimed by a newer session");
    }
    control.release();
    tracing::debug!(session_id, "Connection task finished");
}

async fn write(stream: &mut TcpStream, response: &RtspResponse) -> std::io::Result<()> {
    stream.write_all(&encode_response(response)).await
}
