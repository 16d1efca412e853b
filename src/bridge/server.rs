//! Bridge assembly: shared state, routers and listener lifecycle.
//!
//! # Listeners
//!
//! | Listener  | Default port | Routes                                              |
//! |-----------|--------------|-----------------------------------------------------|
//! | duplex    | 8001         | any path, WebSocket upgrade                         |
//! | streaming | 3001         | `GET /sse`, `POST/DELETE /messages`, `GET /health`  |
//!
//! # Shutdown
//!
//! On SIGINT/SIGTERM (Ctrl+C on Windows) the shared shutdown flag is set.
//! Every session task sees it, tears down its backend and closes its client;
//! the listeners then stop accepting and drain.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bridge::health::{self, HealthDescriptor};
use crate::bridge::relay::shutdown_requested;
use crate::bridge::session::SessionRegistry;
use crate::bridge::supervisor::Supervisor;
use crate::bridge::{duplex, streaming};
use crate::config::Config;

/// Upper bound on draining listeners after shutdown is requested.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Added to the backend teardown bound when waiting for sessions at exit.
const BACKEND_SLACK: Duration = Duration::from_secs(1);

/// Request body ceiling. Bodies under it but over `relay.max_message_bytes`
/// are answered with a JSON-RPC 413.
const REQUEST_BODY_CEILING: usize = 64 << 20;

/// State shared by every connection task.
#[derive(Debug)]
pub struct BridgeState {
    config: Config,
    supervisor: Supervisor,
    registry: SessionRegistry,
    health: HealthDescriptor,
    shutdown: watch::Sender<bool>,
}

impl BridgeState {
    /// Builds shared state from a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            supervisor: Supervisor::new(config.backend.clone()),
            registry: SessionRegistry::new(),
            health: HealthDescriptor::from_config(&config.health),
            shutdown,
            config,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Backend process supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Session registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Static health descriptor.
    #[must_use]
    pub const fn health(&self) -> &HealthDescriptor {
        &self.health
    }

    /// A receiver that observes the shutdown flag.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Sets the shutdown flag. Idempotent.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// The assembled bridge.
#[derive(Debug, Clone)]
pub struct Bridge {
    state: Arc<BridgeState>,
}

impl Bridge {
    /// Creates a bridge from a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(BridgeState::new(config)),
        }
    }

    /// Shared state.
    #[must_use]
    pub const fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Router for the WebSocket listener. Every path accepts an upgrade.
    #[must_use]
    pub fn duplex_router(&self) -> Router {
        Router::new()
            .fallback(duplex::upgrade)
            .with_state(Arc::clone(&self.state))
    }

    /// Router for the SSE listener.
    ///
    /// Requests pass through CORS, then [`streaming::answer_options`], then
    /// the body limit. An authentication layer (for example a bearer token
    /// check) belongs directly inside `answer_options`, so preflight and
    /// `OPTIONS` stay unauthenticated while every route, `/health` included,
    /// is covered.
    #[must_use]
    pub fn streaming_router(&self) -> Router {
        let config = self.state.config();
        let body_limit = config.relay.max_message_bytes.max(REQUEST_BODY_CEILING);
        Router::new()
            .route("/sse", get(streaming::open_stream))
            .route(
                config.streaming.messages_path.as_str(),
                post(streaming::post_message).delete(streaming::close_session),
            )
            .route("/health", get(health::health))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(middleware::from_fn(streaming::answer_options))
            .layer(streaming::cors_layer())
            .with_state(Arc::clone(&self.state))
    }

    /// Serves until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed, a listener
    /// cannot bind, or a listener fails while serving.
    #[cfg(unix)]
    pub async fn run(self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.run_until(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            }
        })
        .await
    }

    /// Serves until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot bind or fails while serving.
    #[cfg(windows)]
    pub async fn run(self) -> io::Result<()> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
        })
        .await
    }

    /// Serves the enabled listeners until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns the first bind or serve error.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let config = self.state.config();
        let mut servers = JoinSet::new();

        if config.duplex.enabled {
            let listener = TcpListener::bind((config.duplex.bind.as_str(), config.duplex.port)).await?;
            info!(addr = %listener.local_addr()?, "WebSocket listener ready");
            self.spawn_listener(&mut servers, listener, self.duplex_router());
        }

        if config.streaming.enabled {
            let listener =
                TcpListener::bind((config.streaming.bind.as_str(), config.streaming.port)).await?;
            info!(addr = %listener.local_addr()?, "SSE listener ready");
            self.spawn_listener(&mut servers, listener, self.streaming_router());
        }

        let mut first_error = None;
        tokio::select! {
            () = shutdown => {}
            Some(result) = servers.join_next() => {
                warn!("listener stopped unexpectedly, shutting down");
                record(result, &mut first_error);
            }
        }

        self.state.begin_shutdown();

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while let Some(result) = servers.join_next().await {
                record(result, &mut first_error);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout_secs = SHUTDOWN_DRAIN.as_secs(),
                "listeners did not drain, aborting"
            );
            servers.abort_all();
        }

        self.wait_for_backends().await;

        let stats = self.state.supervisor().stats();
        info!(
            spawned = stats.spawned,
            released = stats.released,
            "bridge stopped"
        );

        first_error.map_or(Ok(()), Err)
    }

    /// Waits, bounded by one teardown period, for sessions to release their
    /// backends. Upgraded sockets are not tracked by the listeners.
    async fn wait_for_backends(&self) {
        let backend = &self.state.config().backend;
        let bound = backend.shutdown_grace() + backend.kill_timeout() + BACKEND_SLACK;
        let supervisor = self.state.supervisor();

        let released = tokio::time::timeout(bound, async {
            while supervisor.stats().live() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if released.is_err() {
            warn!(
                live = supervisor.stats().live(),
                "backends still running at exit"
            );
        }
    }

    fn spawn_listener(
        &self,
        servers: &mut JoinSet<io::Result<()>>,
        listener: TcpListener,
        app: Router,
    ) {
        let mut stop = self.state.shutdown_signal();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_requested(&mut stop).await })
                .await
        });
    }
}

fn record(
    result: Result<io::Result<()>, tokio::task::JoinError>,
    first_error: &mut Option<io::Error>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "listener failed");
            first_error.get_or_insert(e);
        }
        Err(e) => {
            error!(error = %e, "listener task panicked");
            first_error.get_or_insert_with(|| io::Error::other(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::BackendConfig;

    fn bridge() -> Bridge {
        let mut config = Config::with_backend(BackendConfig::new("cat"));
        config.health.server_name = "test-bridge".to_string();
        config.health.tool_count = 3;
        Bridge::new(config)
    }

    #[test]
    fn shutdown_flag_is_observable() {
        let bridge = bridge();
        let rx = bridge.state().shutdown_signal();
        assert!(!bridge.state().is_shutting_down());
        bridge.state().begin_shutdown();
        bridge.state().begin_shutdown();
        assert!(bridge.state().is_shutting_down());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn health_route_is_mounted() {
        let response = bridge()
            .streaming_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_until_stops_listeners() {
        let mut config = Config::with_backend(BackendConfig::new("cat"));
        config.duplex.bind = "127.0.0.1".to_string();
        config.duplex.port = 0;
        config.streaming.bind = "127.0.0.1".to_string();
        config.streaming.port = 0;
        let bridge = Bridge::new(config);
        let state = Arc::clone(bridge.state());

        bridge
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(state.is_shutting_down());
    }
}
