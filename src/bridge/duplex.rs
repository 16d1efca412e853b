//! WebSocket transport.
//!
//! Every accepted connection is one session with its own backend process.
//! Text and binary messages carry one JSON-RPC message each; every backend
//! line goes back as one text message. The session ends when either side
//! goes away:
//!
//! | Cause                          | Close sent to the client          |
//! |--------------------------------|-----------------------------------|
//! | client closed or dropped       | none                              |
//! | backend could not be spawned   | 1011 `backend unavailable`        |
//! | backend exited                 | 1011 `backend exited`             |
//! | relay failed                   | 1011 `relay failed`               |
//! | payload is not one JSON line   | 1007 `invalid payload`            |
//! | payload over the size limit    | 1009 `message too large`          |
//! | bridge shutting down           | 1001 `server shutting down`       |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::relay::{Relay, RelayEnd};
use crate::bridge::server::BridgeState;
use crate::bridge::session::{Session, SessionId, TransportKind};
use crate::error::FramingError;
use crate::mcp::framing::Frame;

/// Bound on delivering queued backend output after the relay stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on sending the close frame to a client that is not reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket-level message ceiling. Messages under it but over
/// `relay.max_message_bytes` are answered with a 1009 close.
const SOCKET_MESSAGE_CEILING: usize = 64 << 20;

type Sink = SplitSink<WebSocket, Message>;

/// Why a duplex session ended.
#[derive(Debug)]
enum Ending {
    Relay(RelayEnd),
    ClientGone,
    BadPayload(FramingError),
    SocketFailed(axum::Error),
}

impl Ending {
    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::Relay(RelayEnd::BackendClosed) => (close_code::ERROR, "backend exited"),
            Self::Relay(RelayEnd::Failed(_)) => (close_code::ERROR, "relay failed"),
            Self::Relay(RelayEnd::Shutdown) => (close_code::AWAY, "server shutting down"),
            Self::BadPayload(FramingError::TooLarge { .. }) => {
                (close_code::SIZE, "message too large")
            }
            Self::BadPayload(_) => (close_code::INVALID, "invalid payload"),
            Self::Relay(RelayEnd::ClientClosed) | Self::ClientGone | Self::SocketFailed(_) => {
                return None
            }
        };
        Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })
    }
}

/// Upgrade handler mounted on every path of the duplex listener.
pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<BridgeState>>) -> Response {
    let limit = state.config().relay.max_message_bytes.max(SOCKET_MESSAGE_CEILING);
    ws.max_message_size(limit)
        .on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| serve_connection(socket, state))
}

/// Runs one duplex session to completion.
pub(crate) async fn serve_connection(socket: WebSocket, state: Arc<BridgeState>) {
    let mut session = Session::new(TransportKind::DuplexSocket);
    let id = session.id();
    let (mut sink, stream) = socket.split();

    if state.is_shutting_down() {
        let _ = session.close();
        send_close(&mut sink, id, Ending::Relay(RelayEnd::Shutdown).close_frame()).await;
        return;
    }

    let mut handle = match state.supervisor().acquire(&id) {
        Ok(handle) => handle,
        Err(e) => {
            error!(session = %id, error = %e, "backend unavailable");
            let _ = session.close();
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: Utf8Bytes::from_static("backend unavailable"),
            };
            send_close(&mut sink, id, Some(frame)).await;
            return;
        }
    };
    let Some((stdin, stdout)) = handle.take_stdio() else {
        let _ = session.close();
        state.supervisor().release(handle).await;
        return;
    };

    if let Err(e) = session.activate() {
        warn!(session = %id, error = %e, "activate failed");
    }
    state.registry().register(&session, None);
    info!(session = %id, transport = %session.transport(), "session opened");

    let relay_config = &state.config().relay;
    let (in_tx, in_rx) = mpsc::channel(relay_config.channel_capacity);
    let (out_tx, mut out_rx) = mpsc::channel(relay_config.channel_capacity);
    let relay = Relay::new(id, relay_config);

    let ending = tokio::select! {
        end = relay.run(stdin, stdout, in_rx, out_tx, handle.exited(), state.shutdown_signal()) => {
            Ending::Relay(end)
        }
        ending = pump_inbound(id, stream, in_tx, relay_config.max_message_bytes) => ending,
        ending = pump_outbound(&mut sink, &mut out_rx) => ending,
    };

    if let Err(e) = session.begin_closing() {
        warn!(session = %id, error = %e, "begin closing failed");
    }
    state.registry().remove(&id);

    if matches!(ending, Ending::Relay(_)) {
        flush_outbound(&mut sink, &mut out_rx).await;
    }
    send_close(&mut sink, id, ending.close_frame()).await;

    let process = state.supervisor().release(handle).await;
    if let Err(e) = session.close() {
        warn!(session = %id, error = %e, "close failed");
    }
    match ending {
        Ending::Relay(end) => {
            if let Some(e) = end.into_error(process) {
                warn!(session = %id, error = %e, "session ended abnormally");
            }
        }
        Ending::SocketFailed(e) => debug!(session = %id, error = %e, "socket failed"),
        Ending::ClientGone | Ending::BadPayload(_) => {}
    }
    info!(session = %id, process = ?process, "session closed");
}

/// Client messages to the relay.
async fn pump_inbound(
    session: SessionId,
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Frame>,
    max_bytes: usize,
) -> Ending {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => Frame::from_payload(text.as_str(), max_bytes),
            Ok(Message::Binary(bytes)) => std::str::from_utf8(&bytes)
                .map_err(|_| FramingError::InvalidUtf8)
                .and_then(|text| Frame::from_payload(text, max_bytes)),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!(session = %session, close = ?frame, "client closed");
                return Ending::ClientGone;
            }
            Err(e) => return Ending::SocketFailed(e),
        };

        match frame {
            Ok(frame) => {
                if inbound.send(frame).await.is_err() {
                    // Relay is gone; its branch reports why.
                    std::future::pending::<()>().await;
                }
            }
            Err(FramingError::Empty) => debug!(session = %session, "ignoring empty message"),
            Err(e) => {
                warn!(session = %session, error = %e, "rejecting client payload");
                return Ending::BadPayload(e);
            }
        }
    }
    Ending::ClientGone
}

/// Relay output to the client.
async fn pump_outbound(sink: &mut Sink, outbound: &mut mpsc::Receiver<Frame>) -> Ending {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(text(frame)).await {
            return Ending::SocketFailed(e);
        }
    }
    // Relay is gone; its branch reports why.
    std::future::pending().await
}

/// Delivers backend output still queued when the relay stopped.
async fn flush_outbound(sink: &mut Sink, outbound: &mut mpsc::Receiver<Frame>) {
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        while let Some(frame) = outbound.recv().await {
            if sink.send(text(frame)).await.is_err() {
                break;
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("dropping queued output for unresponsive client");
    }
}

async fn send_close(sink: &mut Sink, session: SessionId, frame: Option<CloseFrame>) {
    let Some(frame) = frame else {
        return;
    };
    let code = frame.code;
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => debug!(session = %session, code, "close sent"),
        Ok(Err(e)) => debug!(session = %session, code, error = %e, "close not delivered"),
        Err(_) => debug!(session = %session, code, "close timed out"),
    }
}

fn text(frame: Frame) -> Message {
    Message::Text(frame.into_string().into())
}
