//! Engine process spawning and startup handshake
//!
//! A launch binds a fresh callback listener, starts the engine with the
//! callback address and a one-time token, and waits for the engine to connect
//! back and present that token. Whatever happens first of handshake, process
//! exit, or the startup deadline decides the outcome.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{Binding, LaunchSpec, Placeholders};
use crate::group::GroupKey;
use crate::protocol::{self, Frame, ProtocolError};
use crate::transport::Channel;
use crate::types::{Capabilities, ErrorCode, ExecutionContext, JobError};

/// Environment variable carrying the callback address (host:port)
pub const ENV_CALLBACK: &str = "INTERPLEX_CALLBACK";
/// Environment variable carrying the one-time handshake token
pub const ENV_TOKEN: &str = "INTERPLEX_TOKEN";
pub const ENV_BINDING: &str = "INTERPLEX_BINDING";
pub const ENV_GROUP: &str = "INTERPLEX_GROUP";

/// How long to wait for the stderr reader to catch up after an exit
const STDERR_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("engine did not complete its handshake within {after:?}")]
    Timeout {
        after: Duration,
        stderr_tail: Vec<String>,
    },

    #[error("engine failed during startup: {message}")]
    Failure {
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
        message: String,
    },

    #[error("engine handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error during startup: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error during handshake: {0}")]
    Protocol(#[from] ProtocolError),
}

impl StartupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StartupError::Timeout { .. } => ErrorCode::StartupTimeout,
            StartupError::HandshakeRejected(_) => ErrorCode::HandshakeRejected,
            StartupError::Failure { .. }
            | StartupError::Spawn(_)
            | StartupError::Io(_)
            | StartupError::Protocol(_) => ErrorCode::StartupFailure,
        }
    }

    /// Job-level error carrying whatever diagnostics the failure captured
    pub fn to_job_error(&self) -> JobError {
        let error = JobError::new(self.code(), self.to_string());
        match self {
            StartupError::Timeout { stderr_tail, .. } => {
                error.with_stderr_tail(stderr_tail.clone())
            }
            StartupError::Failure {
                exit_code,
                stderr_tail,
                ..
            } => error
                .with_exit_code(*exit_code)
                .with_stderr_tail(stderr_tail.clone()),
            _ => error,
        }
    }
}

/// Everything needed to start one engine process
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub binding_id: &'a str,
    pub binding: &'a Binding,
    pub group: &'a GroupKey,
    /// Context whose job caused the launch
    pub context: &'a ExecutionContext,
    pub callback_host: IpAddr,
    pub startup_timeout: Duration,
    pub stderr_tail_lines: usize,
}

/// A started engine that completed its handshake
#[derive(Debug)]
pub struct EngineProcess {
    pub child: Child,
    pub pid: u32,
    /// Address the engine connected from
    pub endpoint: SocketAddr,
    pub engine: String,
    pub capabilities: Capabilities,
    pub channel: Channel,
    pub stderr: StderrTail,
}

struct Handshake {
    stream: TcpStream,
    endpoint: SocketAddr,
    pid: u32,
    engine: String,
    capabilities: Capabilities,
}

impl EngineProcess {
    /// Spawn an engine and wait for its handshake
    #[instrument(skip(request), fields(binding = request.binding_id, group = %request.group))]
    pub async fn launch(request: LaunchRequest<'_>) -> Result<Self, StartupError> {
        let listener = TcpListener::bind((request.callback_host, 0)).await?;
        let callback = listener.local_addr()?.to_string();
        let token = Uuid::new_v4().simple().to_string();

        let vars = Placeholders {
            callback: &callback,
            token: &token,
            binding: request.binding_id,
            group: request.group.as_str(),
            context: request.context,
        };
        let launch = &request.binding.launch;
        let args = LaunchSpec::expand_command(&launch.command, &vars);
        let program = args.first().ok_or_else(|| StartupError::Failure {
            exit_code: None,
            stderr_tail: Vec::new(),
            message: "empty launch command".to_string(),
        })?;

        debug!(?args, %callback, "spawning engine");

        let mut command = Command::new(program);
        command
            .args(&args[1..])
            .env(ENV_CALLBACK, &callback)
            .env(ENV_TOKEN, &token)
            .env(ENV_BINDING, request.binding_id)
            .env(ENV_GROUP, request.group.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &launch.env {
            command.env(key, vars.expand(value));
        }
        if let Some(ref dir) = launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(StartupError::Spawn)?;
        let label = format!("{}[{}]", request.binding_id, request.group);
        let stderr = StderrTail::capture(child.stderr.take(), request.stderr_tail_lines, &label);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, label.clone()));
        }

        let properties = request.binding.expanded_properties(&vars);

        tokio::select! {
            handshake = accept_handshake(&listener, &token, properties) => match handshake {
                Ok(handshake) => {
                    if let Some(child_pid) = child.id()
                        && child_pid != handshake.pid
                    {
                        debug!(child_pid, reported_pid = handshake.pid, "engine reports a different pid");
                    }
                    debug!(
                        pid = handshake.pid,
                        engine = %handshake.engine,
                        endpoint = %handshake.endpoint,
                        "engine handshake complete"
                    );
                    let (reader, writer) = handshake.stream.into_split();
                    Ok(Self {
                        child,
                        pid: handshake.pid,
                        endpoint: handshake.endpoint,
                        engine: handshake.engine,
                        capabilities: handshake.capabilities,
                        channel: Channel::spawn(reader, writer, label),
                        stderr,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "engine handshake failed");
                    kill(&mut child).await;
                    Err(e)
                }
            },
            status = child.wait() => {
                stderr.settle(STDERR_SETTLE).await;
                let exit_code = status.ok().and_then(|s| s.code());
                warn!(?exit_code, "engine exited before completing its handshake");
                Err(StartupError::Failure {
                    exit_code,
                    stderr_tail: stderr.snapshot(),
                    message: match exit_code {
                        Some(code) => format!("engine exited with code {code} before its handshake"),
                        None => "engine was terminated before its handshake".to_string(),
                    },
                })
            }
            _ = tokio::time::sleep(request.startup_timeout) => {
                warn!(timeout = ?request.startup_timeout, "engine startup timed out");
                kill(&mut child).await;
                stderr.settle(STDERR_SETTLE).await;
                Err(StartupError::Timeout {
                    after: request.startup_timeout,
                    stderr_tail: stderr.snapshot(),
                })
            }
        }
    }
}

/// Accept the engine's connection and check its token
async fn accept_handshake(
    listener: &TcpListener,
    token: &str,
    properties: HashMap<String, String>,
) -> Result<Handshake, StartupError> {
    let (mut stream, endpoint) = listener.accept().await?;
    let frame = protocol::read_frame(&mut stream).await?;

    match frame {
        Some(Frame::Handshake {
            token: presented,
            pid,
            engine,
            capabilities,
        }) => {
            if presented != token {
                let reject = Frame::HandshakeRejected {
                    reason: "token mismatch".to_string(),
                };
                let _ = protocol::write_frame(&mut stream, &reject).await;
                return Err(StartupError::HandshakeRejected(format!(
                    "engine at {endpoint} presented the wrong token"
                )));
            }
            protocol::write_frame(&mut stream, &Frame::HandshakeAck { properties }).await?;
            Ok(Handshake {
                stream,
                endpoint,
                pid,
                engine,
                capabilities,
            })
        }
        Some(other) => Err(StartupError::HandshakeRejected(format!(
            "expected handshake, got {other:?}"
        ))),
        None => Err(StartupError::HandshakeRejected(
            "engine closed the connection before its handshake".to_string(),
        )),
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill engine");
    }
}

async fn log_lines<R>(reader: R, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(engine = %label, stream = "stdout", "{line}");
    }
}

struct TailInner {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    finished: watch::Sender<bool>,
}

/// Last lines an engine wrote to stderr
#[derive(Clone)]
pub struct StderrTail {
    inner: Arc<TailInner>,
}

impl StderrTail {
    /// Start collecting lines from `reader` in the background
    pub fn capture<R>(reader: Option<R>, capacity: usize, label: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (finished, _) = watch::channel(false);
        let tail = Self {
            inner: Arc::new(TailInner {
                lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                finished,
            }),
        };

        match reader {
            Some(reader) => {
                let inner = Arc::clone(&tail.inner);
                let label = label.to_string();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(engine = %label, stream = "stderr", "{line}");
                        let mut buf = inner.lines.lock().unwrap_or_else(|e| e.into_inner());
                        if inner.capacity > 0 {
                            if buf.len() == inner.capacity {
                                buf.pop_front();
                            }
                            buf.push_back(line);
                        }
                    }
                    inner.finished.send_replace(true);
                });
            }
            None => {
                tail.inner.finished.send_replace(true);
            }
        }
        tail
    }

    /// Current tail, oldest line first
    pub fn snapshot(&self) -> Vec<String> {
        let buf = self.inner.lines.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().cloned().collect()
    }

    /// Wait (bounded) until the stream has been read to its end
    pub async fn settle(&self, within: Duration) {
        let mut rx = self.inner.finished.subscribe();
        let _ = tokio::time::timeout(within, async move {
            let _ = rx.wait_for(|done| *done).await;
        })
        .await;
    }
}

impl std::fmt::Debug for StderrTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StderrTail")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}
