//! Backend process supervisor.
//!
//! Owns the lifecycle of backend worker processes: spawning, handing their
//! stdio to a relay, surfacing their stderr, and tearing them down.
//!
//! # Process States
//!
//! ```text
//! SPAWNING ──▶ RUNNING ──▶ EXITED   (exited on its own, or after SIGTERM)
//!                 │
//!                 └──────▶ KILLED   (did not exit within the grace period)
//! ```
//!
//! # Teardown
//!
//! [`Supervisor::release`] closes the backend's stdin, sends SIGTERM (Unix),
//! waits up to `shutdown_grace_ms`, then kills the process and waits up to
//! `kill_timeout_ms` for it to be reaped. Every handle is released at most
//! once because `release` consumes it.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::bridge::session::SessionId;
use crate::config::BackendConfig;
use crate::error::BridgeError;

/// Lifecycle state of one backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn requested.
    Spawning,
    /// Process is alive.
    Running,
    /// Process exited; `None` if it was terminated by a signal.
    Exited(Option<i32>),
    /// Process was forcibly killed.
    Killed,
}

impl ProcessState {
    /// Whether the process is gone.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed)
    }

    fn from_status(status: ExitStatus) -> Self {
        Self::Exited(status.code())
    }
}

/// One spawned backend worker.
#[derive(Debug)]
pub struct ProcessHandle {
    session: SessionId,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    state: ProcessState,
}

impl ProcessHandle {
    /// Session this process serves.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// OS process id, if the process has not been reaped.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last observed state.
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Hands the backend's stdin and stdout to the relay. Succeeds once.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }

    /// Resolves once the process exits, recording its exit status.
    ///
    /// Cancel-safe. Never resolves if the process cannot be waited on.
    pub async fn exited(&mut self) -> ProcessState {
        if !self.state.is_terminal() {
            match self.child.wait().await {
                Ok(status) => self.state = ProcessState::from_status(status),
                Err(e) => {
                    warn!(session = %self.session, error = %e, "failed to wait for backend");
                    std::future::pending::<()>().await;
                }
            }
        }
        self.state
    }

    /// Polls for an exit without waiting.
    pub fn try_status(&mut self) -> ProcessState {
        if self.state == ProcessState::Running {
            match self.child.try_wait() {
                Ok(Some(status)) => self.state = ProcessState::from_status(status),
                Ok(None) => {}
                Err(e) => warn!(session = %self.session, error = %e, "failed to poll backend"),
            }
        }
        self.state
    }
}

/// Counters for spawned and released processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Successful spawns.
    pub spawned: u64,
    /// Completed releases.
    pub released: u64,
}

impl SupervisorStats {
    /// Processes spawned and not yet released.
    #[must_use]
    pub const fn live(self) -> u64 {
        self.spawned.saturating_sub(self.released)
    }
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    released: AtomicU64,
}

/// Spawns and reclaims backend processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: Arc<BackendConfig>,
    counters: Arc<Counters>,
}

impl Supervisor {
    /// Creates a supervisor for the configured backend.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config: Arc::new(config),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Backend configuration in use.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Spawn and release counters.
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            spawned: self.counters.spawned.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
        }
    }

    /// Spawns a backend for `session`.
    ///
    /// The process gets piped stdio; its stderr is logged line by line.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the process cannot be started or its
    /// pipes cannot be captured.
    pub fn acquire(&self, session: &SessionId) -> Result<ProcessHandle, BridgeError> {
        let config = &*self.config;
        debug!(
            session = %session,
            command = %config.command,
            state = ?ProcessState::Spawning,
            "spawning backend"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| self.spawn_error(source))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(self.spawn_error(std::io::Error::other("backend stdio was not captured")));
        };

        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(*session, stderr));
        }

        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        info!(session = %session, pid, command = %config.command, "backend started");

        Ok(ProcessHandle {
            session: *session,
            pid,
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            state: ProcessState::Running,
        })
    }

    fn spawn_error(&self, source: std::io::Error) -> BridgeError {
        BridgeError::Spawn {
            command: self.config.command.clone(),
            source,
        }
    }

    /// Terminates `handle` with a bounded wait and returns its final state.
    pub async fn release(&self, mut handle: ProcessHandle) -> ProcessState {
        drop(handle.stdin.take());
        drop(handle.stdout.take());

        let state = if handle.try_status().is_terminal() {
            handle.state
        } else {
            self.terminate(&mut handle).await
        };
        handle.state = state;

        self.counters.released.fetch_add(1, Ordering::SeqCst);
        info!(
            session = %handle.session,
            pid = handle.pid,
            state = ?state,
            "backend stopped"
        );
        state
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> ProcessState {
        let session = handle.session;

        #[cfg(unix)]
        {
            if let Some(pid) = handle.pid {
                send_sigterm(session, pid);
            }
        }

        match tokio::time::timeout(self.config.shutdown_grace(), handle.child.wait()).await {
            Ok(Ok(status)) => return ProcessState::from_status(status),
            Ok(Err(e)) => warn!(session = %session, error = %e, "wait after SIGTERM failed"),
            Err(_) => warn!(
                session = %session,
                grace_ms = self.config.shutdown_grace_ms,
                "backend ignored SIGTERM, killing"
            ),
        }

        if let Err(e) = handle.child.start_kill() {
            warn!(session = %session, error = %e, "kill failed");
        }
        match tokio::time::timeout(self.config.kill_timeout(), handle.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(session = %session, error = %e, "wait after kill failed"),
            Err(_) => warn!(session = %session, "backend not reaped after kill"),
        }
        ProcessState::Killed
    }
}

#[cfg(unix)]
fn send_sigterm(session: SessionId, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(session = %session, pid, error = %e, "SIGTERM not delivered");
    }
}

/// Surfaces backend stderr in the bridge log. Ends at EOF.
async fn log_stderr(session: SessionId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => warn!(session = %session, stderr = %line, "backend stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(session = %session, error = %e, "backend stderr closed");
                break;
            }
        }
    }
}
