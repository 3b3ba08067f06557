//! Engine side of the protocol.
//!
//! An engine binary implements [`Engine`] and hands it to an
//! [`EngineServer`], which connects back to the host named in the process
//! environment, performs the handshake and serves calls until the host asks
//! it to shut down or goes away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::process::{ENV_BINDING, ENV_CALLBACK, ENV_GROUP, ENV_TOKEN};
use crate::protocol::{
    self, CancelReply, ExecuteReply, Frame, Method, ProtocolError, PushEvent, Reply, StatusReply,
};
use crate::types::{Capabilities, ExecutionContext, Fragment, JobId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("could not connect to host at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("host rejected the handshake: {0}")]
    Rejected(String),

    #[error("unexpected frame during handshake: {0}")]
    Handshake(String),

    #[error("engine failed to open: {0}")]
    Open(String),
}

/// An interpreter that can be served to a host
pub trait Engine: Send + Sync + 'static {
    /// Engine kind reported in the handshake
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once with the binding's expanded properties, before any job
    fn open(&self, _properties: &HashMap<String, String>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Run one job to completion
    fn execute(&self, job: EngineJob) -> impl Future<Output = ExecuteReply> + Send;
}

/// Where and how to reach the host, as handed over at launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    pub callback: String,
    pub token: String,
    pub binding: String,
    pub group: String,
}

impl EngineEndpoint {
    pub fn from_env() -> Result<Self, EngineError> {
        let var = |name: &'static str| std::env::var(name).map_err(|_| EngineError::MissingEnv(name));
        Ok(Self {
            callback: var(ENV_CALLBACK)?,
            token: var(ENV_TOKEN)?,
            binding: std::env::var(ENV_BINDING).unwrap_or_default(),
            group: std::env::var(ENV_GROUP).unwrap_or_default(),
        })
    }
}

/// Shared write half; every frame is written whole
#[derive(Clone)]
struct FrameWriter {
    inner: Arc<AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl FrameWriter {
    fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(Box::new(writer))),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut writer = self.inner.lock().await;
        protocol::write_frame(&mut *writer, frame).await
    }
}

/// Streams a job's output to the host while it runs
#[derive(Clone)]
pub struct OutputSink {
    job_id: JobId,
    writer: FrameWriter,
}

impl OutputSink {
    pub async fn fragment(&self, fragment: Fragment) {
        self.push(PushEvent::Output { fragment }).await;
    }

    pub async fn text(&self, text: impl Into<String>) {
        self.fragment(Fragment::text(text)).await;
    }

    pub async fn progress(&self, percent: u8) {
        self.push(PushEvent::Progress {
            percent: percent.min(100),
        })
        .await;
    }

    async fn push(&self, event: PushEvent) {
        let frame = Frame::Push {
            job_id: self.job_id,
            event,
        };
        if let Err(e) = self.writer.send(&frame).await {
            debug!(job_id = %self.job_id, error = %e, "dropping push");
        }
    }
}

/// Set when the host cancels the job
#[derive(Debug, Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
}

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the job is cancelled
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One job handed to an [`Engine`]
pub struct EngineJob {
    pub job_id: JobId,
    pub context: ExecutionContext,
    pub code: String,
    pub output: OutputSink,
    pub cancel: CancelFlag,
}

type Running = Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>;

fn lock_running(map: &Running) -> MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serves one [`Engine`] over a connection to the host
pub struct EngineServer<E> {
    engine: Arc<E>,
    endpoint: EngineEndpoint,
}

impl<E: Engine> EngineServer<E> {
    pub fn new(engine: E, endpoint: EngineEndpoint) -> Self {
        Self {
            engine: Arc::new(engine),
            endpoint,
        }
    }

    /// Connect to the host and serve until shutdown
    pub async fn serve(self) -> Result<(), EngineError> {
        let addr = self.endpoint.callback.clone();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| EngineError::Connect { addr, source })?;
        stream.set_nodelay(true).map_err(ProtocolError::from)?;
        let (mut reader, writer) = stream.into_split();
        let writer = FrameWriter::new(writer);

        writer
            .send(&Frame::Handshake {
                token: self.endpoint.token.clone(),
                pid: std::process::id(),
                engine: self.engine.name().to_string(),
                capabilities: self.engine.capabilities(),
            })
            .await?;

        match protocol::read_frame(&mut reader).await? {
            Some(Frame::HandshakeAck { properties }) => self.engine.open(&properties)?,
            Some(Frame::HandshakeRejected { reason }) => return Err(EngineError::Rejected(reason)),
            Some(other) => return Err(EngineError::Handshake(format!("{other:?}"))),
            None => return Err(EngineError::Handshake("host closed the connection".to_string())),
        }
        info!(binding = %self.endpoint.binding, group = %self.endpoint.group, "engine ready");

        let running: Running = Arc::default();
        let mut jobs = JoinSet::new();
        let result = loop {
            while jobs.try_join_next().is_some() {}
            let (call_id, call) = match protocol::read_frame(&mut reader).await {
                Ok(Some(Frame::Request { call_id, call })) => (call_id, call),
                Ok(Some(other)) => {
                    warn!(?other, "ignoring unexpected frame");
                    continue;
                }
                Ok(None) => {
                    info!("host closed the connection");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            };

            match call {
                Method::Execute {
                    job_id,
                    context,
                    code,
                } => {
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    lock_running(&running).insert(job_id, cancel_tx);
                    let job = EngineJob {
                        job_id,
                        context,
                        code,
                        output: OutputSink {
                            job_id,
                            writer: writer.clone(),
                        },
                        cancel: CancelFlag { rx: cancel_rx },
                    };
                    let engine = Arc::clone(&self.engine);
                    let running = Arc::clone(&running);
                    let writer = writer.clone();
                    jobs.spawn(async move {
                        let reply = engine.execute(job).await;
                        lock_running(&running).remove(&job_id);
                        respond(&writer, call_id, Reply::Execute(reply)).await;
                    });
                }
                Method::Cancel { job_id } => {
                    let reply = match lock_running(&running).get(&job_id) {
                        Some(cancel) => {
                            cancel.send_replace(true);
                            CancelReply::Ack
                        }
                        None => CancelReply::NotFound,
                    };
                    debug!(%job_id, ?reply, "cancel");
                    respond(&writer, call_id, Reply::Cancel(reply)).await;
                }
                Method::Status { job_id } => {
                    let reply = if lock_running(&running).contains_key(&job_id) {
                        StatusReply::Running
                    } else {
                        StatusReply::Unknown
                    };
                    respond(&writer, call_id, Reply::Status(reply)).await;
                }
                Method::Shutdown { grace_ms } => {
                    info!(grace_ms, "shutdown requested");
                    for cancel in lock_running(&running).values() {
                        cancel.send_replace(true);
                    }
                    let grace = Duration::from_millis(grace_ms);
                    let _ = tokio::time::timeout(grace, async {
                        while jobs.join_next().await.is_some() {}
                    })
                    .await;
                    respond(&writer, call_id, Reply::Shutdown).await;
                    break Ok(());
                }
            }
        };
        jobs.abort_all();
        result
    }
}

async fn respond(writer: &FrameWriter, call_id: u64, reply: Reply) {
    if let Err(e) = writer.send(&Frame::Response { call_id, reply }).await {
        warn!(call_id, error = %e, "failed to send response");
    }
}
