//! Transport to a worker running as a child process.
//!
//! Frames travel as JSON lines over the child's stdin/stdout. The child only
//! counts as connected once its handshake line says it started. The worker
//! answers in order, so replies are matched to requests first-in first-out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tunnel_core::{
    ChannelStatus, Frame, Handshake, Observer, PendingResponse, Responder, StartOptions,
    StatusCell, Transport, TransportError,
};

/// Environment variable carrying the JSON-encoded [`StartOptions`].
pub const START_OPTIONS_ENV: &str = "TUNNEL_START_OPTIONS";

/// How to launch the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// How long `stop` waits for the worker to exit before killing it.
    #[serde(default = "default_grace_ms")]
    pub stop_grace_ms: u64,
    /// How long `start` waits for the worker's handshake.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

fn default_grace_ms() -> u64 {
    2000
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stop_grace_ms: default_grace_ms(),
            start_timeout_ms: default_start_timeout_ms(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// The real transport: a worker process spoken to over pipes.
pub struct ProcessTransport {
    command: ProcessCommand,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Option<Link>>,
}

struct Shared {
    status: StatusCell,
    /// Identifies the current child; tasks of an older child leave status alone.
    session: AtomicU64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<(Vec<u8>, Responder)>>>,
}

struct Link {
    child: Child,
}

type Waiting = Arc<Mutex<VecDeque<Responder>>>;
type FrameLines = Lines<BufReader<ChildStdout>>;

impl ProcessTransport {
    pub fn new(command: ProcessCommand) -> Self {
        Self {
            command,
            shared: Arc::new(Shared {
                status: StatusCell::new(),
                session: AtomicU64::new(0),
                outgoing: Mutex::new(None),
            }),
            link: tokio::sync::Mutex::new(None),
        }
    }

    fn spawn(&self, options: &StartOptions) -> Result<Child, TransportError> {
        let options = serde_json::to_string(options)?;
        Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(START_OPTIONS_ENV, options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: self.command.program.clone(),
                source,
            })
    }

    /// Let `child` exit on its own within the grace period, then kill it.
    async fn reap(&self, child: &mut Child) {
        let grace = Duration::from_millis(self.command.stop_grace_ms);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(exit)) => tracing::info!(%exit, "worker process exited"),
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to wait for worker process"),
            Err(_) => {
                tracing::warn!(?grace, "worker process did not exit, killing it");
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill worker process");
                }
            }
        }
    }
}

/// Wait for the worker's handshake line.
async fn await_handshake(lines: &mut FrameLines, limit: Duration) -> Result<(), TransportError> {
    let line = match tokio::time::timeout(limit, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Err(TransportError::Closed),
        Ok(Err(err)) => return Err(TransportError::Io(err)),
        Err(_) => {
            return Err(TransportError::Lifecycle(
                format!("worker did not report ready within {limit:?}").into(),
            ));
        }
    };
    match Handshake::from_line(&line)? {
        Handshake::Ready => Ok(()),
        Handshake::Failed { error } => Err(TransportError::Lifecycle(error.into())),
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn status(&self) -> ChannelStatus {
        self.shared.status.get()
    }

    async fn start(&self, options: StartOptions) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            if self.shared.status.get().is_connected() {
                tracing::debug!("worker process already running");
                return Ok(());
            }
            // The previous child went away on its own; reap it before respawning.
            link.take();
        }

        self.shared.status.set(ChannelStatus::Connecting);
        let mut child = match self.spawn(&options) {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(error = %err, "worker process failed to start");
                self.shared.status.set(ChannelStatus::Disconnected);
                return Err(err);
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.shared.status.set(ChannelStatus::Disconnected);
            return Err(TransportError::Closed);
        };

        let mut lines = BufReader::new(stdout).lines();
        let limit = Duration::from_millis(self.command.start_timeout_ms);
        if let Err(err) = await_handshake(&mut lines, limit).await {
            tracing::warn!(error = %err, "worker process failed to start");
            self.shared.status.set(ChannelStatus::Disconnecting);
            drop(stdin);
            drop(lines);
            self.reap(&mut child).await;
            self.shared.status.set(ChannelStatus::Disconnected);
            return Err(err);
        }

        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        let waiting: Waiting = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();

        *self
            .shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *link = Some(Link { child });
        self.shared.status.set(ChannelStatus::Connected);

        // Spawned last so an early exit can only be reported after `Connected`.
        tokio::spawn(write_frames(stdin, rx, waiting.clone()));
        tokio::spawn(read_frames(lines, waiting, self.shared.clone(), session));

        tracing::info!(program = %self.command.program, session, "worker process started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(Link { mut child }) = self.link.lock().await.take() else {
            return;
        };
        if self.shared.status.get() == ChannelStatus::Disconnected {
            // Already exited and reported by the reader.
            let _ = child.wait().await;
            return;
        }

        self.shared.status.set(ChannelStatus::Disconnecting);
        // Dropping the sender ends the writer, which closes the child's stdin.
        self.shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.reap(&mut child).await;
        self.shared.status.set(ChannelStatus::Disconnected);
    }

    fn send_message(&self, bytes: Vec<u8>) -> Result<PendingResponse, TransportError> {
        let status = self.shared.status.get();
        if !status.is_connected() {
            return Err(TransportError::InvalidState(status));
        }

        let outgoing = self
            .shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = outgoing.as_ref().ok_or(TransportError::Closed)?;
        let (responder, pending) = PendingResponse::channel();
        tx.send((bytes, responder))
            .map_err(|_| TransportError::Closed)?;
        Ok(pending)
    }

    fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.shared.status.subscribe(observer);
    }
}

async fn write_frames(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<(Vec<u8>, Responder)>,
    waiting: Waiting,
) {
    while let Some((bytes, responder)) = rx.recv().await {
        let line = match Frame::new(Some(bytes)).to_line() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode frame");
                responder.respond(None);
                continue;
            }
        };

        // Queue before writing so the reply can never overtake its responder.
        waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(responder);

        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(error = %err, "failed to write to worker process");
            break;
        }
        if let Err(err) = stdin.flush().await {
            tracing::warn!(error = %err, "failed to flush worker stdin");
            break;
        }
    }
}

async fn read_frames(mut lines: FrameLines, waiting: Waiting, shared: Arc<Shared>, session: u64) {

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read from worker process");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let body = match Frame::from_line(&line) {
            Ok(frame) => frame.body,
            Err(err) => {
                tracing::warn!(error = %err, "malformed frame from worker process");
                None
            }
        };

        let responder = waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match responder {
            Some(responder) => responder.respond(body),
            None => tracing::warn!("unsolicited frame from worker process"),
        }
    }

    // Outstanding requests resolve to `None`.
    waiting
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();

    if shared.session.load(Ordering::SeqCst) == session {
        tracing::info!(session, "worker process closed its output");
        shared.status.set(ChannelStatus::Disconnecting);
        shared.status.set(ChannelStatus::Disconnected);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{CommError, CommunicationMonitor, MonitorConfig};
    use tunnel_core::StatusLog;
    use tunnel_core::protocol::Echo;

    /// A worker played by `sh`: print `handshake`, then run `then`.
    fn scripted(handshake: &str, then: &str) -> ProcessCommand {
        let mut command = ProcessCommand::new("sh")
            .arg("-c")
            .arg(format!("echo '{handshake}'; {then}"));
        command.stop_grace_ms = 500;
        command
    }

    const READY: &str = r#"{"handshake":"ready"}"#;

    #[tokio::test]
    async fn spawn_failure_disconnects() {
        let transport = ProcessTransport::new(ProcessCommand::new("/nonexistent/tunnel-worker"));
        let log = StatusLog::new();
        transport.subscribe(log.clone());

        let err = transport.start(StartOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert_eq!(
            log.snapshot(),
            [ChannelStatus::Connecting, ChannelStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn round_trip_through_cat() {
        // `cat` echoes every frame, so each request comes back as its own reply.
        let transport = Arc::new(ProcessTransport::new(scripted(READY, "exec cat")));
        transport.start(StartOptions::new()).await.unwrap();
        assert_eq!(transport.status(), ChannelStatus::Connected);

        let monitor = CommunicationMonitor::new(MonitorConfig::default());
        monitor.bind(transport.clone());

        for text in ["one", "two", "three"] {
            let echo: Echo = monitor.send(&Echo { text: text.into() }).await.unwrap();
            assert_eq!(echo.text, text);
        }

        transport.stop().await;
        assert_eq!(transport.status(), ChannelStatus::Disconnected);

        let err = monitor
            .send::<Echo, Echo>(&Echo { text: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommError::InvalidState(ChannelStatus::Disconnected)
        ));
    }

    #[tokio::test]
    async fn worker_exit_resolves_pending_and_disconnects() {
        let transport = ProcessTransport::new(scripted(READY, "exit 0"));
        let log = StatusLog::new();
        transport.subscribe(log.clone());
        transport.start(StartOptions::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.status() != ChannelStatus::Disconnected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            log.snapshot(),
            [
                ChannelStatus::Connecting,
                ChannelStatus::Connected,
                ChannelStatus::Disconnecting,
                ChannelStatus::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn failed_handshake_is_a_lifecycle_error() {
        let transport = ProcessTransport::new(scripted(
            r#"{"handshake":"failed","error":"no route to peer"}"#,
            "exit 1",
        ));
        let log = StatusLog::new();
        transport.subscribe(log.clone());

        let err = transport.start(StartOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Lifecycle(_)));
        assert!(err.to_string().contains("no route to peer"));
        assert_eq!(transport.status(), ChannelStatus::Disconnected);
        assert_eq!(
            log.snapshot(),
            [
                ChannelStatus::Connecting,
                ChannelStatus::Disconnecting,
                ChannelStatus::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn exit_before_handshake_fails_start() {
        let transport = ProcessTransport::new(ProcessCommand::new("true"));
        let err = transport.start(StartOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(transport.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let mut command = ProcessCommand::new("sleep").arg("30");
        command.start_timeout_ms = 200;
        command.stop_grace_ms = 100;
        let transport = ProcessTransport::new(command);

        let err = transport.start(StartOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Lifecycle(_)));
        assert!(err.to_string().contains("did not report ready"));
        assert_eq!(transport.status(), ChannelStatus::Disconnected);
    }
}
