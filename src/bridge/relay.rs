//! Message relay between a client channel pair and a backend's stdio.
//!
//! The relay owns the backend's stdin and stdout for the lifetime of one
//! session. Each direction is a single sequential loop, so frames are never
//! reordered within a direction:
//!
//! - **client → backend**: frames from `inbound` are written to stdin, one
//!   line each, in receive order
//! - **backend → client**: stdout is split into frames and sent to
//!   `outbound` in emit order
//!
//! Channels are bounded, so a slow side applies backpressure instead of
//! growing a buffer. The first direction to finish ends the relay; nothing is
//! relayed after a failed delivery.
//!
//! The relay also watches the backend process. Once it exits, output already
//! in the pipe is drained for at most [`EXIT_DRAIN`] and the relay ends with
//! [`RelayEnd::BackendClosed`], even if a descendant still holds stdout open.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::bridge::session::SessionId;
use crate::bridge::supervisor::ProcessState;
use crate::config::RelayConfig;
use crate::error::BridgeError;
use crate::mcp::framing::{Frame, FrameReader, FrameWriter};
use crate::mcp::protocol::summarize;

/// How long backend output is still relayed after the process has exited.
pub const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client stopped sending or stopped receiving.
    ClientClosed,
    /// The backend closed its stdout or exited.
    BackendClosed,
    /// The bridge is shutting down.
    Shutdown,
    /// A frame could not be read or delivered.
    Failed(BridgeError),
}

impl RelayEnd {
    /// The error behind an abnormal end, given the backend's final state.
    ///
    /// `None` when the client left or the bridge is shutting down.
    #[must_use]
    pub fn into_error(self, process: ProcessState) -> Option<BridgeError> {
        match self {
            Self::BackendClosed => Some(BridgeError::BackendExited {
                code: match process {
                    ProcessState::Exited(code) => code,
                    _ => None,
                },
            }),
            Self::Failed(e) => Some(e),
            Self::ClientClosed | Self::Shutdown => None,
        }
    }
}

/// Moves frames between one client and one backend.
#[derive(Debug, Clone)]
pub struct Relay {
    session: SessionId,
    max_frame_bytes: usize,
}

impl Relay {
    /// Creates a relay for `session`.
    #[must_use]
    pub const fn new(session: SessionId, config: &RelayConfig) -> Self {
        Self {
            session,
            max_frame_bytes: config.max_message_bytes,
        }
    }

    /// Relays until either side closes, a frame fails, `backend_exit`
    /// resolves, or `shutdown` is set.
    pub async fn run<W, R, E>(
        &self,
        backend_in: W,
        backend_out: R,
        inbound: mpsc::Receiver<Frame>,
        outbound: mpsc::Sender<Frame>,
        backend_exit: E,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayEnd
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
        E: Future<Output = ProcessState>,
    {
        let to_backend = self.client_to_backend(backend_in, inbound);
        let to_client = self.backend_to_client(backend_out, outbound);
        let drain = tokio::time::sleep(EXIT_DRAIN);
        tokio::pin!(to_backend, to_client, backend_exit, drain);

        let mut exited = false;
        let end = loop {
            tokio::select! {
                end = &mut to_backend, if !exited => break end,
                end = &mut to_client => break end,
                process = &mut backend_exit, if !exited => {
                    debug!(session = %self.session, process = ?process, "backend exited, draining output");
                    exited = true;
                    drain.as_mut().reset(tokio::time::Instant::now() + EXIT_DRAIN);
                }
                () = &mut drain, if exited => break RelayEnd::BackendClosed,
                () = shutdown_requested(&mut shutdown) => break RelayEnd::Shutdown,
            }
        };
        debug!(session = %self.session, end = ?end, "relay finished");
        end
    }

    async fn client_to_backend<W>(&self, backend_in: W, mut inbound: mpsc::Receiver<Frame>) -> RelayEnd
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = FrameWriter::new(backend_in);
        while let Some(frame) = inbound.recv().await {
            self.trace_frame("client->backend", &frame);
            if let Err(e) = writer.write_frame(&frame).await {
                return RelayEnd::Failed(BridgeError::Transport(e));
            }
        }
        RelayEnd::ClientClosed
    }

    async fn backend_to_client<R>(&self, backend_out: R, outbound: mpsc::Sender<Frame>) -> RelayEnd
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FrameReader::new(BufReader::new(backend_out), self.max_frame_bytes);
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    self.trace_frame("backend->client", &frame);
                    if outbound.send(frame).await.is_err() {
                        return RelayEnd::ClientClosed;
                    }
                }
                Ok(None) => return RelayEnd::BackendClosed,
                Err(e) => return RelayEnd::Failed(e.into()),
            }
        }
    }

    fn trace_frame(&self, direction: &'static str, frame: &Frame) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        match summarize(frame.as_str()) {
            Some(summary) => trace!(
                session = %self.session,
                direction,
                kind = ?summary.kind,
                method = summary.method.as_deref(),
                id = ?summary.id,
                bytes = frame.len(),
                "frame"
            ),
            None => trace!(session = %self.session, direction, bytes = frame.len(), "opaque frame"),
        }
    }
}

/// Resolves once `shutdown` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::from_payload(text, 1024).unwrap()
    }

    struct Harness {
        inbound: mpsc::Sender<Frame>,
        outbound: mpsc::Receiver<Frame>,
        shutdown: watch::Sender<bool>,
        exit: oneshot::Sender<ProcessState>,
        relay: tokio::task::JoinHandle<RelayEnd>,
    }

    /// Runs a relay against an in-memory backend driven by `backend`.
    fn spawn_relay<F, Fut>(backend: F) -> Harness
    where
        F: FnOnce(tokio::io::DuplexStream, tokio::io::DuplexStream) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (relay_in, backend_stdin) = tokio::io::duplex(64);
        let (backend_stdout, relay_out) = tokio::io::duplex(64);
        tokio::spawn(backend(backend_stdin, backend_stdout));

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_rx = async move {
            match exit_rx.await {
                Ok(state) => state,
                Err(_) => std::future::pending().await,
            }
        };
        let relay = Relay::new(SessionId::new(), &RelayConfig::default());
        let handle = tokio::spawn(async move {
            relay.run(relay_in, relay_out, in_rx, out_tx, exit_rx, shutdown_rx).await
        });

        Harness {
            inbound: in_tx,
            outbound: out_rx,
            shutdown: shutdown_tx,
            exit: exit_tx,
            relay: handle,
        }
    }

    /// Echoes every line back, like `cat`.
    async fn echo_backend(stdin: tokio::io::DuplexStream, mut stdout: tokio::io::DuplexStream) {
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn preserves_order_in_both_directions() {
        let mut h = spawn_relay(echo_backend);

        let sender = h.inbound.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                sender.send(frame(&format!(r#"{{"id":{i}}}"#))).await.unwrap();
            }
        });

        for i in 0..200 {
            let got = h.outbound.recv().await.unwrap();
            assert_eq!(got.as_str(), format!(r#"{{"id":{i}}}"#));
        }

        drop(h.inbound);
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::ClientClosed));
    }

    #[tokio::test]
    async fn reassembles_chunked_backend_output() {
        let mut h = spawn_relay(|_stdin, mut stdout| async move {
            for chunk in [&b"{\"jsonrpc\":\"2.0\","[..], b"\"id\":1,\"result\":{}}\n{\"id\"", b":2}\n"] {
                stdout.write_all(chunk).await.unwrap();
                stdout.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        assert_eq!(
            h.outbound.recv().await.unwrap().as_str(),
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#
        );
        assert_eq!(h.outbound.recv().await.unwrap().as_str(), r#"{"id":2}"#);
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::BackendClosed));
    }

    #[tokio::test]
    async fn backend_exit_ends_relay() {
        let h = spawn_relay(|_stdin, _stdout| async {});
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::BackendClosed));
    }

    #[tokio::test]
    async fn process_exit_ends_relay_while_stdout_is_held() {
        let mut h = spawn_relay(|stdin, mut stdout| async move {
            stdout.write_all(b"{\"id\":1}\n").await.unwrap();
            // A descendant that outlives the backend keeps the pipes open.
            let _hold = (stdin, stdout);
            std::future::pending::<()>().await;
        });

        assert_eq!(h.outbound.recv().await.unwrap().as_str(), r#"{"id":1}"#);
        h.exit.send(ProcessState::Exited(Some(1))).unwrap();

        let end = tokio::time::timeout(EXIT_DRAIN + Duration::from_secs(2), h.relay)
            .await
            .expect("relay did not notice the exit")
            .unwrap();
        assert!(matches!(end, RelayEnd::BackendClosed));
    }

    #[tokio::test]
    async fn output_written_before_exit_is_delivered() {
        let (tx, rx) = oneshot::channel::<()>();
        let mut h = spawn_relay(|stdin, mut stdout| async move {
            stdout.write_all(b"{\"id\":1}\n{\"id\":2}\n").await.unwrap();
            let _ = tx.send(());
            let _hold = (stdin, stdout);
            std::future::pending::<()>().await;
        });

        rx.await.unwrap();
        h.exit.send(ProcessState::Exited(Some(0))).unwrap();

        assert_eq!(h.outbound.recv().await.unwrap().as_str(), r#"{"id":1}"#);
        assert_eq!(h.outbound.recv().await.unwrap().as_str(), r#"{"id":2}"#);
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::BackendClosed));
    }

    #[tokio::test]
    async fn dropped_client_receiver_ends_relay() {
        let h = spawn_relay(|_stdin, mut stdout| async move {
            loop {
                if stdout.write_all(b"{\"method\":\"notify\"}\n").await.is_err() {
                    break;
                }
            }
        });
        drop(h.outbound);
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::ClientClosed));
    }

    #[tokio::test]
    async fn shutdown_signal_ends_relay() {
        let h = spawn_relay(|stdin, stdout| async move {
            // Keep both pipes open until the relay lets go of them.
            let _hold = (stdin, stdout);
            std::future::pending::<()>().await;
        });
        h.shutdown.send(true).unwrap();
        assert!(matches!(h.relay.await.unwrap(), RelayEnd::Shutdown));
    }

    #[tokio::test]
    async fn oversized_backend_frame_fails_session() {
        let (relay_in, _backend_stdin) = tokio::io::duplex(64);
        let data = format!("{}\n", "x".repeat(100));
        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = RelayConfig {
            channel_capacity: 1,
            max_message_bytes: 32,
        };

        let end = Relay::new(SessionId::new(), &config)
            .run(relay_in, data.as_bytes(), in_rx, out_tx, std::future::pending(), shutdown_rx)
            .await;
        assert!(matches!(end, RelayEnd::Failed(BridgeError::Framing(_))));
    }

    #[test]
    fn backend_exit_reports_exit_code() {
        let err = RelayEnd::BackendClosed
            .into_error(ProcessState::Exited(Some(2)))
            .unwrap();
        assert!(matches!(err, BridgeError::BackendExited { code: Some(2) }));

        assert!(RelayEnd::ClientClosed
            .into_error(ProcessState::Killed)
            .is_none());
        assert!(RelayEnd::Shutdown.into_error(ProcessState::Killed).is_none());
    }
}
