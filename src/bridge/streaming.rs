//! Server-Sent Events transport.
//!
//! A session is a long-lived `GET /sse` response plus short `POST` requests
//! that carry client messages:
//!
//! 1. `GET /sse` spawns a backend and opens an event stream. The first event
//!    is `endpoint`, whose data is the URL to post messages to
//!    (`/messages?sessionId=<id>`). Every backend line follows as a
//!    `message` event.
//! 2. `POST /messages?sessionId=<id>` forwards the JSON body to that session's
//!    backend and answers `202 Accepted`. The session may also be named by the
//!    `Mcp-Session-Id` header.
//! 3. `DELETE /messages?sessionId=<id>` ends the session.
//!
//! Dropping the event stream ends the session and its backend. A backend exit
//! ends the event stream; the client has to open a new one.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::bridge::relay::Relay;
use crate::bridge::server::BridgeState;
use crate::bridge::session::{Session, SessionId, SessionRegistry, TransportKind};
use crate::bridge::supervisor::ProcessHandle;
use crate::error::{BridgeError, FramingError};
use crate::mcp::framing::Frame;
use crate::mcp::protocol::JsonRpcError;

/// Header that may carry the session id instead of the query string.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Query parameters accepted by the message endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    /// Target session.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `GET /sse`
///
/// # Errors
///
/// Returns [`BridgeError::Spawn`] (502) if no backend can be started.
pub async fn open_stream(
    State(state): State<Arc<BridgeState>>,
) -> Result<Sse<KeepAliveStream<SessionEvents>>, BridgeError> {
    let mut session = Session::new(TransportKind::StreamingHttp);
    let id = session.id();

    let mut handle = match state.supervisor().acquire(&id) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session = %id, error = %e, "backend unavailable");
            let _ = session.close();
            return Err(e);
        }
    };
    let Some((stdin, stdout)) = handle.take_stdio() else {
        let _ = session.close();
        state.supervisor().release(handle).await;
        return Err(BridgeError::Transport(std::io::Error::other(
            "backend stdio unavailable",
        )));
    };

    if let Err(e) = session.activate() {
        warn!(session = %id, error = %e, "activate failed");
    }

    let capacity = state.config().relay.channel_capacity;
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    state.registry().register(&session, Some(in_tx));
    info!(session = %id, transport = %session.transport(), "session opened");

    tokio::spawn(run_session(
        Arc::clone(&state),
        session,
        handle,
        (stdin, stdout),
        in_rx,
        out_tx,
    ));

    let streaming = &state.config().streaming;
    let events = SessionEvents {
        endpoint: Some(format!("{}?sessionId={id}", streaming.messages_path)),
        frames: out_rx,
        _guard: SessionGuard {
            registry: state.registry().clone(),
            id,
        },
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(streaming.keep_alive())))
}

/// Relays one streaming session, then tears it down.
async fn run_session(
    state: Arc<BridgeState>,
    mut session: Session,
    mut handle: ProcessHandle,
    (stdin, stdout): (ChildStdin, ChildStdout),
    inbound: mpsc::Receiver<Frame>,
    outbound: mpsc::Sender<Frame>,
) {
    let id = session.id();
    let end = Relay::new(id, &state.config().relay)
        .run(
            stdin,
            stdout,
            inbound,
            outbound,
            handle.exited(),
            state.shutdown_signal(),
        )
        .await;

    if let Err(e) = session.begin_closing() {
        warn!(session = %id, error = %e, "begin closing failed");
    }
    state.registry().remove(&id);

    let process = state.supervisor().release(handle).await;
    if let Err(e) = session.close() {
        warn!(session = %id, error = %e, "close failed");
    }
    if let Some(e) = end.into_error(process) {
        warn!(session = %id, error = %e, "session ended abnormally");
    }
    info!(session = %id, process = ?process, "session closed");
}

/// `POST /messages`
///
/// # Errors
///
/// Returns [`BridgeError::SessionNotEstablished`] (503) if the request names
/// no open session, or a framing error (400/413) if the body is not a single
/// JSON document within the size limit.
pub async fn post_message(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), BridgeError> {
    let id = resolve_session(&query, &headers).ok_or(BridgeError::SessionNotEstablished)?;
    let inbound = state
        .registry()
        .sender(&id)
        .ok_or(BridgeError::SessionNotEstablished)?;

    let frame = Frame::from_json_body(&body, state.config().relay.max_message_bytes)?;
    debug!(session = %id, bytes = frame.len(), "message posted");

    inbound
        .send(frame)
        .await
        .map_err(|_| BridgeError::SessionNotEstablished)?;
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// `DELETE /messages`
///
/// # Errors
///
/// Returns [`BridgeError::SessionNotEstablished`] (503) if the request names
/// no open session.
pub async fn close_session(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, BridgeError> {
    let id = resolve_session(&query, &headers).ok_or(BridgeError::SessionNotEstablished)?;
    if !state.registry().remove(&id) {
        return Err(BridgeError::SessionNotEstablished);
    }
    info!(session = %id, "session close requested");
    Ok(StatusCode::NO_CONTENT)
}

/// Session id from the query string, falling back to the session header.
fn resolve_session(query: &SessionQuery, headers: &HeaderMap) -> Option<SessionId> {
    let raw = query.session_id.as_deref().or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
    })?;
    raw.parse().ok()
}

/// Answers every `OPTIONS` request with an empty 200.
pub async fn answer_options(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

/// Permissive CORS for browser clients.
#[must_use]
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(SESSION_HEADER),
        ])
}

/// Event stream of one streaming session.
#[derive(Debug)]
pub struct SessionEvents {
    endpoint: Option<String>,
    frames: mpsc::Receiver<Frame>,
    _guard: SessionGuard,
}

impl Stream for SessionEvents {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(endpoint) = self.endpoint.take() {
            return Poll::Ready(Some(Ok(Event::default().event("endpoint").data(endpoint))));
        }
        self.frames
            .poll_recv(cx)
            .map(|frame| frame.map(|frame| Ok(message_event(&frame))))
    }
}

fn message_event(frame: &Frame) -> Event {
    // SSE cannot carry CR; in a JSON line it can only be insignificant whitespace.
    let data = frame.as_str();
    if data.contains('\r') {
        Event::default().event("message").data(data.replace('\r', ""))
    } else {
        Event::default().event("message").data(data)
    }
}

/// Unregisters the session when its event stream is dropped.
#[derive(Debug)]
struct SessionGuard {
    registry: SessionRegistry,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.id) {
            debug!(session = %self.id, "event stream dropped");
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        match self {
            Self::SessionNotEstablished => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(JsonRpcError::session_not_established()),
            )
                .into_response(),
            Self::Spawn { .. } => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "backend unavailable",
                    "message": self.to_string(),
                })),
            )
                .into_response(),
            Self::Framing(FramingError::TooLarge { limit }) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(JsonRpcError::message_too_large(limit)),
            )
                .into_response(),
            Self::Framing(_) => {
                (StatusCode::BAD_REQUEST, Json(JsonRpcError::parse_error())).into_response()
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(JsonRpcError::internal_error(self.to_string())),
            )
                .into_response(),
        }
    }
}
