//! Integration tests for the SSE transport.
//!
//! These tests drive the streaming router in-process against real backend
//! processes (`cat` and small shell scripts), so they only run on Unix.

#![cfg(unix)]

use std::time::{Duration, Instant};

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use mcp_transport_bridge::bridge::Bridge;
use mcp_transport_bridge::config::{BackendConfig, Config};

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn bridge_with(backend: BackendConfig) -> Bridge {
    let mut backend = backend;
    backend.shutdown_grace_ms = 200;
    backend.kill_timeout_ms = 500;
    let mut config = Config::with_backend(backend);
    config.health.server_name = "Test SSE MCP Server".to_string();
    config.health.tool_count = 5;
    Bridge::new(config)
}

fn echo_bridge() -> Bridge {
    bridge_with(BackendConfig::new("cat"))
}

fn sh(script: &str) -> BackendConfig {
    BackendConfig::new("sh").with_args(["-c", script])
}

async fn call(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Parses `event:`/`data:` blocks out of an SSE response body.
struct EventReader {
    stream: BodyDataStream,
    buf: String,
}

impl EventReader {
    async fn open(app: &Router) -> Self {
        let response = call(app, Request::get("/sse").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        Self {
            stream: response.into_body().into_data_stream(),
            buf: String::new(),
        }
    }

    /// Next event as `(name, data)`, or `None` once the stream ends.
    async fn next_event_within(&mut self, limit: Duration) -> Option<(String, String)> {
        tokio::time::timeout(limit, self.next_event())
            .await
            .expect("no event in time")
    }

    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(pos) = self.buf.find("\n\n") {
                let block: String = self.buf.drain(..pos + 2).collect();
                let mut name = "message".to_string();
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        name = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                    }
                }
                if data.is_empty() {
                    continue;
                }
                return Some((name, data.join("\n")));
            }
            let chunk = self.stream.next().await?.ok()?;
            self.buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    async fn endpoint(&mut self) -> String {
        let (name, data) = self.next_event_within(WAIT).await.unwrap();
        assert_eq!(name, "endpoint");
        data
    }

    async fn message(&mut self) -> Value {
        let (name, data) = self.next_event_within(WAIT).await.unwrap();
        assert_eq!(name, "message");
        serde_json::from_str(&data).unwrap()
    }
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_endpoint_event_names_message_url() {
    let bridge = echo_bridge();
    let app = bridge.streaming_router();
    let mut events = EventReader::open(&app).await;

    let endpoint = events.endpoint().await;
    let id = endpoint
        .strip_prefix("/messages?sessionId=")
        .expect("endpoint should point at the message path");
    assert!(!id.is_empty());
    assert_eq!(bridge.state().registry().len(), 1);
    assert_eq!(bridge.state().supervisor().stats().spawned, 1);
}

#[tokio::test]
async fn test_ping_requests_are_answered_on_the_stream() {
    let app = echo_bridge().streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;

    for id in [1, 2] {
        let response = call(
            &app,
            post(&endpoint, &format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"ping"}}"#)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Accepted");

        let message = events.message().await;
        assert_eq!(message["id"], id);
        assert_eq!(message["method"], "ping");
    }
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let bridge = echo_bridge();
    let app = bridge.streaming_router();
    let mut first = EventReader::open(&app).await;
    let mut second = EventReader::open(&app).await;
    let first_endpoint = first.endpoint().await;
    let second_endpoint = second.endpoint().await;
    assert_ne!(first_endpoint, second_endpoint);

    let (to_first, to_second) = tokio::join!(
        call(&app, post(&first_endpoint, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)),
        call(&app, post(&second_endpoint, r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)),
    );
    assert_eq!(to_first.status(), StatusCode::ACCEPTED);
    assert_eq!(to_second.status(), StatusCode::ACCEPTED);

    assert_eq!(first.message().await["id"], 1);
    assert_eq!(second.message().await["id"], 2);

    for events in [&mut first, &mut second] {
        let extra = tokio::time::timeout(Duration::from_millis(200), events.next_event()).await;
        assert!(extra.is_err(), "session saw another session's traffic");
    }
    assert_eq!(bridge.state().supervisor().stats().spawned, 2);
}

#[tokio::test]
async fn test_session_header_is_accepted() {
    let app = echo_bridge().streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;
    let id = endpoint.split("sessionId=").nth(1).unwrap().to_string();

    let request = Request::post("/messages")
        .header("Mcp-Session-Id", id)
        .body(Body::from(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#))
        .unwrap();
    assert_eq!(call(&app, request).await.status(), StatusCode::ACCEPTED);
    assert_eq!(events.message().await["id"], 7);
}

#[tokio::test]
async fn test_delete_ends_session_and_backend() {
    let bridge = echo_bridge();
    let app = bridge.streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;

    let request = Request::delete(endpoint.as_str()).body(Body::empty()).unwrap();
    assert_eq!(call(&app, request).await.status(), StatusCode::NO_CONTENT);

    assert!(events.next_event_within(WAIT).await.is_none());
    let state = bridge.state().clone();
    wait_until(|| state.supervisor().stats().released == 1).await;

    let response = call(&app, post(&endpoint, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let request = Request::delete(endpoint.as_str()).body(Body::empty()).unwrap();
    assert_eq!(
        call(&app, request).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test]
async fn test_dropping_stream_releases_backend() {
    let bridge = echo_bridge();
    let app = bridge.streaming_router();
    let mut events = EventReader::open(&app).await;
    events.endpoint().await;
    drop(events);

    let state = bridge.state().clone();
    wait_until(|| state.registry().is_empty()).await;
    wait_until(|| state.supervisor().stats().released == 1).await;
}

#[tokio::test]
async fn test_backend_exit_ends_stream() {
    let bridge = bridge_with(sh(r#"echo '{"jsonrpc":"2.0","method":"notifications/hello"}'"#));
    let app = bridge.streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;

    assert_eq!(events.message().await["method"], "notifications/hello");
    assert!(events.next_event_within(WAIT).await.is_none());

    let state = bridge.state().clone();
    wait_until(|| state.registry().is_empty()).await;
    let response = call(&app, post(&endpoint, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_backend_exit_ends_stream_while_stdout_stays_open() {
    let bridge = bridge_with(sh("sleep 20 & exit 1"));
    let app = bridge.streaming_router();
    let mut events = EventReader::open(&app).await;
    events.endpoint().await;

    assert!(events.next_event_within(WAIT).await.is_none());
    let state = bridge.state().clone();
    wait_until(|| state.supervisor().stats().live() == 0).await;
    assert!(state.registry().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_bad_gateway() {
    let bridge = bridge_with(BackendConfig::new("/nonexistent/mcp-backend"));
    let app = bridge.streaming_router();

    let response = call(&app, Request::get("/sse").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "backend unavailable");
    assert!(bridge.state().registry().is_empty());
}

// =============================================================================
// Message Endpoint Error Tests
// =============================================================================

#[tokio::test]
async fn test_post_without_session_is_rejected() {
    let app = echo_bridge().streaming_router();

    let response = call(&app, post("/messages", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "Session not established"},
            "id": null
        })
    );
}

#[tokio::test]
async fn test_post_to_unknown_session_is_rejected() {
    let app = echo_bridge().streaming_router();
    let uri = "/messages?sessionId=00000000-0000-4000-8000-000000000000";

    let response = call(&app, post(uri, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = call(&app, post("/messages?sessionId=garbage", "{}")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let app = echo_bridge().streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;

    let response = call(&app, post(&endpoint, "{not json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], -32700);

    // The session survives a rejected post.
    let response = call(&app, post(&endpoint, r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(events.message().await["id"], 3);
}

#[tokio::test]
async fn test_oversized_body_gets_json_rpc_error() {
    let mut config = Config::with_backend(BackendConfig::new("cat"));
    config.relay.max_message_bytes = 64;
    let app = Bridge::new(config).streaming_router();
    let mut events = EventReader::open(&app).await;
    let endpoint = events.endpoint().await;

    let big = format!(
        r#"{{"jsonrpc":"2.0","id":1,"method":"ping","params":{{"pad":"{}"}}}}"#,
        "x".repeat(200)
    );
    let response = call(&app, post(&endpoint, &big)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["error"]["data"]["limit"], 64);

    let response = call(&app, post(&endpoint, r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(events.message().await["id"], 4);
}

// =============================================================================
// Health and CORS Tests
// =============================================================================

#[tokio::test]
async fn test_health_does_not_depend_on_sessions() {
    let bridge = echo_bridge();
    let app = bridge.streaming_router();
    let expected = json!({
        "status": "healthy",
        "server": "Test SSE MCP Server",
        "protocolVersion": "2024-11-05",
        "tools": 5,
        "transport": "SSE"
    });

    let response = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, expected);

    let mut events = EventReader::open(&app).await;
    events.endpoint().await;

    let response = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(body_json(response).await, expected);
}

#[tokio::test]
async fn test_options_short_circuits() {
    let app = echo_bridge().streaming_router();

    for path in ["/sse", "/messages", "/health"] {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = call(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }
}

#[tokio::test]
async fn test_cors_preflight_allows_any_origin() {
    let app = echo_bridge().streaming_router();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/messages")
        .header(header::ORIGIN, "https://client.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type,mcp-session-id")
        .body(Body::empty())
        .unwrap();

    let response = call(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    let methods = response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap()
        .to_string();
    for method in ["GET", "POST", "DELETE", "OPTIONS"] {
        assert!(methods.contains(method), "{methods}");
    }
}
