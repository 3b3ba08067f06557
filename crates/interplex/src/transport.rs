//! Multiplexed request/response channel to one engine process.
//!
//! A writer task owns the write half; a reader task owns the read half and
//! routes responses to the pending call that is waiting for them and push
//! frames to the subscriber of their job. Once the peer goes away every
//! pending call fails with the same reason and the channel stays closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::protocol::{self, Frame, Method, ProtocolError, PushEvent, Reply};
use crate::types::JobId;

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("channel closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected reply to {method}")]
    UnexpectedReply { method: &'static str },

    #[error("engine reported an error: {0}")]
    Remote(String),
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

type PendingReply = oneshot::Sender<Result<Reply, TransportError>>;

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, PendingReply>,
    subscribers: HashMap<JobId, mpsc::UnboundedSender<PushEvent>>,
    closed: Option<String>,
}

struct ChannelInner {
    label: String,
    next_call_id: AtomicU64,
    outbound: mpsc::Sender<Frame>,
    routes: Mutex<Routes>,
    closed_tx: watch::Sender<bool>,
}

impl ChannelInner {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_with(&self, reason: &str) {
        let pending = {
            let mut routes = self.routes();
            if routes.closed.is_some() {
                return;
            }
            routes.closed = Some(reason.to_string());
            routes.subscribers.clear();
            std::mem::take(&mut routes.pending)
        };

        debug!(channel = %self.label, reason, failed_calls = pending.len(), "channel closed");
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Closed(reason.to_string())));
        }
        self.closed_tx.send_replace(true);
    }

    fn close_reason(&self) -> String {
        self.routes()
            .closed
            .clone()
            .unwrap_or_else(|| "channel closed".to_string())
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Response { call_id, reply } => {
                let tx = self.routes().pending.remove(&call_id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => trace!(channel = %self.label, call_id, "response for abandoned call"),
                }
            }
            Frame::Push { job_id, event } => {
                let routes = self.routes();
                match routes.subscribers.get(&job_id) {
                    Some(tx) => {
                        let _ = tx.send(event);
                    }
                    None => trace!(channel = %self.label, %job_id, "push for unsubscribed job"),
                }
            }
            other => {
                warn!(channel = %self.label, frame = ?other, "unexpected frame from engine");
            }
        }
    }
}

/// Host side of the channel to one engine
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Start the reader and writer tasks over an established connection
    pub fn spawn<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ChannelInner {
            label: label.into(),
            next_call_id: AtomicU64::new(1),
            outbound,
            routes: Mutex::new(Routes::default()),
            closed_tx,
        });

        tokio::spawn(write_loop(Arc::clone(&inner), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&inner), reader));

        Self { inner }
    }

    /// Send a call and wait for its reply.
    ///
    /// Dropping the returned future forgets the pending slot; a reply that
    /// arrives later is discarded.
    pub async fn call(&self, method: Method) -> Result<Reply, TransportError> {
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let method_name = method.name();
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.inner.routes();
            if let Some(ref reason) = routes.closed {
                return Err(TransportError::Closed(reason.clone()));
            }
            routes.pending.insert(call_id, tx);
        }
        let _pending = PendingGuard {
            inner: &self.inner,
            call_id,
        };

        trace!(channel = %self.inner.label, call_id, method = method_name, "call");
        self.inner
            .outbound
            .send(Frame::Request {
                call_id,
                call: method,
            })
            .await
            .map_err(|_| TransportError::Closed(self.inner.close_reason()))?;

        match rx.await {
            Ok(Ok(Reply::Error { message })) => Err(TransportError::Remote(message)),
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed(self.inner.close_reason())),
        }
    }

    /// Receive push frames for one job until the subscription is dropped
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.inner.routes();
            if routes.closed.is_none() {
                routes.subscribers.insert(job_id, tx);
            }
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            job_id,
            rx,
        }
    }

    /// Resolves once the channel is closed for any reason
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.closed_tx.subscribe()).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Close the channel locally, failing outstanding calls with `reason`
    pub fn close(&self, reason: &str) {
        self.inner.close_with(reason);
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.routes().closed.clone()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct PendingGuard<'a> {
    inner: &'a ChannelInner,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.routes().pending.remove(&self.call_id);
    }
}

/// Push frames for one job
pub struct Subscription {
    inner: Arc<ChannelInner>,
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<PushEvent>,
}

impl Subscription {
    /// Next push, or `None` once the channel has closed
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// A push that has already arrived, if any
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.routes().subscribers.remove(&self.job_id);
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop<W>(inner: Arc<ChannelInner>, mut writer: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = inner.closed_tx.subscribe();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = protocol::write_frame(&mut writer, &frame).await {
                    inner.close_with(&format!("write failed: {e}"));
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }
}

async fn read_loop<R>(inner: Arc<ChannelInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = inner.closed_tx.subscribe();
    loop {
        let frame = tokio::select! {
            frame = protocol::read_frame(&mut reader) => frame,
            _ = wait_closed(&mut closed) => return,
        };
        match frame {
            Ok(Some(frame)) => inner.route(frame),
            Ok(None) => {
                inner.close_with("engine closed the connection");
                return;
            }
            Err(e) => {
                inner.close_with(&format!("read failed: {e}"));
                return;
            }
        }
    }
}
