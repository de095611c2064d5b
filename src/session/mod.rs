//! One live shell connection, exposed as a serialized command protocol.
//!
//! A [`Session`] owns exactly one interactive channel (local PTY or SSH).
//! Many callers may submit commands concurrently; a FIFO queue and a single
//! worker task guarantee at-most-one in-flight command per channel, so
//! multi-step callers never corrupt each other's framing.
//!
//! State machine: `Disconnected → Connecting → Ready ⇄ Busy → Closed`.
//! Channel-level I/O errors move the session to `Disconnected` and fail all
//! queued requests; `Closed` is terminal.

pub mod auth;
pub(crate) mod executor;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::channel::pty::{spawn_local_shell, SHELL_INIT};
use crate::channel::ssh::{open_shell_channel, SshAuth, SshConfig, SshGuard};
use crate::channel::{ChannelHandle, ChannelWriter};
use crate::error::{ConnectError, SessionError};
use crate::output::OutputSanitizer;
use auth::{CredentialInjector, Secret, SecretProvider};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const QUICK_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const READY_DRAIN_CAP: Duration = Duration::from_secs(5);
const RESYNC_CAP: Duration = Duration::from_secs(2);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const QUEUE_DEPTH: usize = 64;

/// Logical connection identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionTarget {
    Local,
    Ssh {
        username: String,
        host: String,
        port: u16,
    },
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Local => f.write_str("local"),
            ConnectionTarget::Ssh {
                username,
                host,
                port,
            } => write!(f, "{username}@{host}:{port}"),
        }
    }
}

/// Session lifecycle state, published through a watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Closed,
}

/// One logical command invocation.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: Option<String>,
    /// `KEY=value` overrides; keys must be plain identifiers.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Whether the credential injector watches this execution. The quick
    /// path turns this off: it never runs fresh authenticated invocations.
    pub watch_auth: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: Vec::new(),
            timeout,
            watch_auth: true,
        }
    }

    /// Short-timeout, no-prompt-watch variant for listings and metadata.
    pub fn quick(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: Vec::new(),
            timeout: QUICK_COMMAND_TIMEOUT,
            watch_auth: false,
        }
    }
}

/// Outcome of one framed command. Immutable once produced.
#[derive(Clone, Debug)]
pub struct CommandResult {
    /// Sanitized output, never containing the frame delimiter.
    pub output: String,
    /// `None` means unknown: the command timed out before its trailer.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Connection options. No secrets here; those come from [`SecretProvider`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Local shell binary for [`ConnectionTarget::Local`].
    pub shell: String,
    /// Private key path; when set, SSH uses key auth (the provider supplies
    /// the passphrase), otherwise password auth.
    pub key_path: Option<String>,
    pub default_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            key_path: None,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

struct QueuedCommand {
    spec: CommandSpec,
    done: oneshot::Sender<Result<CommandResult, SessionError>>,
}

enum SessionMsg {
    Run(QueuedCommand),
    Shutdown,
}

/// Keeps the underlying transport alive for the worker's lifetime.
enum TransportGuard {
    Local(tokio::process::Child),
    Ssh(SshGuard),
    Detached,
}

/// A live connection. Cheap to share behind `Arc`; dropping it does not
/// close the shell — call [`Session::close`].
pub struct Session {
    target: ConnectionTarget,
    queue_tx: mpsc::Sender<SessionMsg>,
    writer: ChannelWriter,
    state_rx: watch::Receiver<SessionState>,
    default_timeout: Duration,
}

impl Session {
    /// Connect to a target and bring its shell to the ready state.
    pub async fn connect(
        target: ConnectionTarget,
        secrets: Arc<dyn SecretProvider>,
        options: SessionOptions,
    ) -> Result<Session, ConnectError> {
        log::info!("connecting to {target}");
        let (mut chan, guard) = match &target {
            ConnectionTarget::Local => {
                let (chan, child) = spawn_local_shell(&options.shell)?;
                (chan, TransportGuard::Local(child))
            }
            ConnectionTarget::Ssh {
                username,
                host,
                port,
            } => {
                let auth = match &options.key_path {
                    Some(path) => SshAuth::KeyFile {
                        path: path.clone(),
                        passphrase: secrets.secret_for(&target).await.map(Secret::new),
                    },
                    None => {
                        let password = secrets.secret_for(&target).await.ok_or_else(|| {
                            ConnectError::MissingSecret {
                                target: target.to_string(),
                            }
                        })?;
                        SshAuth::Password(Secret::new(password))
                    }
                };
                let config = SshConfig {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                    auth,
                };
                let (chan, ssh_guard) = open_shell_channel(&config).await?;
                (chan, TransportGuard::Ssh(ssh_guard))
            }
        };

        // Quiet the shell and swallow its banner before the first command.
        let marker = format!("QUAY-READY-{}", Uuid::new_v4().simple());
        let init = format!("{SHELL_INIT}echo '{marker}'\n");
        let ready = async {
            chan.write(init.as_bytes()).await.ok()?;
            drain_until(&mut chan, &marker, READY_DRAIN_CAP).await.then_some(())
        };
        if ready.await.is_none() {
            return Err(ConnectError::ShellInit {
                target: target.to_string(),
            });
        }

        log::info!("session ready on {target}");
        Ok(Self::spawn_worker(
            chan,
            guard,
            target,
            secrets,
            options.default_timeout,
        ))
    }

    /// Assemble a session over an already-open channel, skipping shell
    /// init. This is the seam for deterministic tests with fake channels.
    pub fn from_parts(
        chan: ChannelHandle,
        target: ConnectionTarget,
        secrets: Arc<dyn SecretProvider>,
        default_timeout: Duration,
    ) -> Session {
        Self::spawn_worker(chan, TransportGuard::Detached, target, secrets, default_timeout)
    }

    fn spawn_worker(
        chan: ChannelHandle,
        guard: TransportGuard,
        target: ConnectionTarget,
        secrets: Arc<dyn SecretProvider>,
        default_timeout: Duration,
    ) -> Session {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(SessionState::Ready);
        let writer = chan.writer();

        let worker = Worker {
            chan,
            guard,
            target: target.clone(),
            secrets,
            sanitizer: OutputSanitizer::new(),
            state_tx,
        };
        tokio::spawn(worker.run(queue_rx));

        Session {
            target,
            queue_tx,
            writer,
            state_rx,
            default_timeout,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions (UI-facing).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Execute a command with an explicit timeout. Suspends until the
    /// command's turn in the FIFO queue and its frame completes.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, SessionError> {
        self.execute_spec(CommandSpec::new(command, timeout)).await
    }

    /// Execute with the session default timeout.
    pub async fn execute_default(&self, command: &str) -> Result<CommandResult, SessionError> {
        self.execute(command, self.default_timeout).await
    }

    /// Read-only quick path: shorter timeout, no credential watching.
    pub async fn execute_quick(&self, command: &str) -> Result<CommandResult, SessionError> {
        self.execute_spec(CommandSpec::quick(command)).await
    }

    pub async fn execute_spec(&self, spec: CommandSpec) -> Result<CommandResult, SessionError> {
        match self.state() {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Disconnected => {
                return Err(SessionError::ConnectionLost("session disconnected".into()))
            }
            _ => {}
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.queue_tx
            .send(SessionMsg::Run(QueuedCommand {
                spec,
                done: done_tx,
            }))
            .await
            .map_err(|_| self.terminal_error())?;
        done_rx.await.map_err(|_| self.terminal_error())?
    }

    /// Write bytes straight to the shell's stdin, bypassing framing. Must
    /// not be used while a framed command is in flight.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.writer.write(bytes).await
    }

    /// Close the session after the queue drains. Terminal.
    pub async fn close(&self) {
        if self.queue_tx.send(SessionMsg::Shutdown).await.is_err() {
            return;
        }
        let mut rx = self.state_rx.clone();
        let _ = tokio::time::timeout(
            CLOSE_GRACE + Duration::from_secs(3),
            rx.wait_for(|s| *s == SessionState::Closed),
        )
        .await;
    }

    fn terminal_error(&self) -> SessionError {
        match self.state() {
            SessionState::Disconnected => {
                SessionError::ConnectionLost("session disconnected".into())
            }
            _ => SessionError::Closed,
        }
    }
}

struct Worker {
    chan: ChannelHandle,
    guard: TransportGuard,
    target: ConnectionTarget,
    secrets: Arc<dyn SecretProvider>,
    sanitizer: OutputSanitizer,
    state_tx: watch::Sender<SessionState>,
}

impl Worker {
    async fn run(mut self, mut queue_rx: mpsc::Receiver<SessionMsg>) {
        let mut needs_resync = false;
        while let Some(msg) = queue_rx.recv().await {
            let cmd = match msg {
                SessionMsg::Shutdown => break,
                SessionMsg::Run(cmd) => cmd,
            };

            let _ = self.state_tx.send(SessionState::Busy);
            if needs_resync {
                self.resync().await;
                needs_resync = false;
            }
            // Anything buffered between commands is stray late output.
            self.chan.drain_buffered();

            let mut injector = if cmd.spec.watch_auth {
                let secret = self
                    .secrets
                    .secret_for(&self.target)
                    .await
                    .map(Secret::new);
                CredentialInjector::new(secret)
            } else {
                CredentialInjector::disarmed()
            };

            let result =
                executor::run(&mut self.chan, &self.sanitizer, &mut injector, &cmd.spec).await;
            // Secret (if any) is dropped — and zeroed — here with the injector.
            drop(injector);

            match result {
                Err(SessionError::ConnectionLost(reason)) => {
                    log::warn!("{}: connection lost: {reason}", self.target);
                    let _ = cmd
                        .done
                        .send(Err(SessionError::ConnectionLost(reason.clone())));
                    Self::fail_pending(&mut queue_rx, &reason);
                    let _ = self.state_tx.send(SessionState::Disconnected);
                    return;
                }
                Ok(result) => {
                    needs_resync = result.timed_out;
                    let _ = cmd.done.send(Ok(result));
                }
                Err(err) => {
                    let _ = cmd.done.send(Err(err));
                }
            }
            let _ = self.state_tx.send(SessionState::Ready);
        }

        // Graceful close: ask the shell to exit, then force the local child.
        let _ = self.chan.write(b"exit\n").await;
        if let TransportGuard::Local(mut child) = self.guard {
            if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            }
        }
        log::info!("session closed on {}", self.target);
        let _ = self.state_tx.send(SessionState::Closed);
    }

    /// After a timed-out command the stream may still carry its late
    /// output. Emit a marker and discard everything up to it.
    async fn resync(&mut self) {
        let marker = format!("QUAY-SYNC-{}", Uuid::new_v4().simple());
        if self
            .chan
            .write(format!("\necho '{marker}'\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        if !drain_until(&mut self.chan, &marker, RESYNC_CAP).await {
            log::warn!("{}: resync marker never arrived", self.target);
        }
    }

    fn fail_pending(queue_rx: &mut mpsc::Receiver<SessionMsg>, reason: &str) {
        queue_rx.close();
        while let Ok(msg) = queue_rx.try_recv() {
            if let SessionMsg::Run(cmd) = msg {
                let _ = cmd
                    .done
                    .send(Err(SessionError::ConnectionLost(reason.to_string())));
            }
        }
    }
}

/// Discard output until `marker` appears as emitted output (not as the
/// echo of the `echo '<marker>'` command itself, which is followed by a
/// quote).
pub(crate) async fn drain_until(chan: &mut ChannelHandle, marker: &str, cap: Duration) -> bool {
    let deadline = Instant::now() + cap;
    let mut buf = String::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match tokio::time::timeout(deadline - now, chan.next_chunk()).await {
            Err(_) | Ok(None) => return false,
            Ok(Some(bytes)) => {
                buf.push_str(&String::from_utf8_lossy(&bytes));
                if marker_emitted(&buf, marker) {
                    return true;
                }
            }
        }
    }
}

fn marker_emitted(buf: &str, marker: &str) -> bool {
    let mut from = 0;
    while let Some(rel) = buf[from..].find(marker) {
        let at = from + rel;
        match buf[at + marker.len()..].chars().next() {
            None | Some('\n') | Some('\r') => return true,
            _ => from = at + marker.len(),
        }
    }
    false
}
