//! Per-group FIFO job queue with bounded concurrency.
//!
//! Jobs are opaque futures built from a closure that receives a [`JobSignal`].
//! A single dispatch task starts queued jobs in submission order whenever a
//! running slot is free. Queued jobs can be removed without ever starting;
//! running jobs are only signalled and decide themselves how to stop.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, trace};

use crate::types::{ErrorCode, ExecutionResult, JobError, JobId};

pub type JobFuture = Pin<Box<dyn Future<Output = ExecutionResult> + Send>>;

/// Builds the job's future once it is dispatched
pub type JobWork = Box<dyn FnOnce(JobSignal) -> JobFuture + Send>;

/// Request delivered to a running job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    None,
    /// The caller asked for the job to be cancelled
    Cancel,
    /// The queue is being torn down
    Abort(String),
}

/// Receiving end of a running job's interrupt
#[derive(Debug, Clone)]
pub struct JobSignal {
    rx: watch::Receiver<Interrupt>,
}

impl JobSignal {
    pub fn current(&self) -> Interrupt {
        self.rx.borrow().clone()
    }

    /// Wait until an interrupt is delivered
    pub async fn fired(&mut self) -> Interrupt {
        loop {
            let current = self.current();
            if current != Interrupt::None {
                return current;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without an interrupt: nothing will ever fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Why a submission was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    Backpressure { depth: usize },
    Closed(String),
}

impl Rejected {
    pub fn into_error(self) -> JobError {
        match self {
            Rejected::Backpressure { depth } => JobError::new(
                ErrorCode::Backpressure,
                format!("queue is full ({depth} jobs waiting)"),
            ),
            Rejected::Closed(reason) => {
                JobError::new(ErrorCode::Teardown, format!("queue closed: {reason}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue before it started
    Dequeued,
    /// Running; the job was asked to stop
    Signalled,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Queued,
    Running,
}

/// Handle to a submitted job's eventual result
#[derive(Debug)]
pub struct JobTicket {
    job_id: JobId,
    rx: oneshot::Receiver<ExecutionResult>,
}

impl JobTicket {
    /// A ticket whose result is already known
    pub fn ready(result: ExecutionResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let job_id = result.job_id;
        let _ = tx.send(result);
        Self { job_id, rx }
    }

    pub(crate) fn from_parts(job_id: JobId, rx: oneshot::Receiver<ExecutionResult>) -> Self {
        Self { job_id, rx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the job's terminal result
    pub async fn wait(self) -> ExecutionResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => ExecutionResult::failed(
                self.job_id,
                JobError::new(ErrorCode::Teardown, "job was dropped before completing"),
            ),
        }
    }
}

struct QueuedJob {
    job_id: JobId,
    work: JobWork,
    result_tx: oneshot::Sender<ExecutionResult>,
    submitted: Instant,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<QueuedJob>,
    running: HashMap<JobId, watch::Sender<Interrupt>>,
    closed: Option<String>,
}

struct SchedulerInner {
    name: String,
    concurrency_limit: usize,
    queue_depth: Option<usize>,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// FIFO queue for one isolation group
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler and start its dispatch task
    pub fn new(name: impl Into<String>, concurrency_limit: usize, queue_depth: Option<usize>) -> Self {
        let inner = Arc::new(SchedulerInner {
            name: name.into(),
            concurrency_limit: concurrency_limit.max(1),
            queue_depth,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// Append a job to the queue
    pub fn submit(&self, job_id: JobId, work: JobWork) -> Result<JobTicket, Rejected> {
        let (result_tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            if let Some(ref reason) = state.closed {
                return Err(Rejected::Closed(reason.clone()));
            }
            if let Some(depth) = self.inner.queue_depth
                && state.queued.len() >= depth
            {
                debug!(queue = %self.inner.name, %job_id, depth, "queue full");
                return Err(Rejected::Backpressure { depth });
            }
            state.queued.push_back(QueuedJob {
                job_id,
                work,
                result_tx,
                submitted: Instant::now(),
            });
            trace!(queue = %self.inner.name, %job_id, queued = state.queued.len(), "job queued");
        }
        self.inner.wake.notify_one();
        Ok(JobTicket { job_id, rx })
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, job_id: JobId) -> CancelOutcome {
        let mut state = self.inner.state();
        if let Some(pos) = state.queued.iter().position(|job| job.job_id == job_id) {
            let job = state.queued.remove(pos);
            drop(state);
            if let Some(job) = job {
                debug!(queue = %self.inner.name, %job_id, "queued job cancelled");
                let _ = job.result_tx.send(ExecutionResult::failed(
                    job_id,
                    JobError::new(ErrorCode::Cancelled, "cancelled while queued"),
                ));
            }
            return CancelOutcome::Dequeued;
        }
        match state.running.get(&job_id) {
            Some(tx) => {
                debug!(queue = %self.inner.name, %job_id, "running job signalled to cancel");
                tx.send_replace(Interrupt::Cancel);
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Stop accepting jobs, abort everything queued and signal running jobs
    pub fn close(&self, reason: &str) {
        let queued = {
            let mut state = self.inner.state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.to_string());
            for tx in state.running.values() {
                tx.send_replace(Interrupt::Abort(reason.to_string()));
            }
            std::mem::take(&mut state.queued)
        };
        debug!(queue = %self.inner.name, reason, aborted = queued.len(), "queue closed");
        for job in queued {
            let _ = job.result_tx.send(ExecutionResult::failed(
                job.job_id,
                JobError::new(ErrorCode::Teardown, reason.to_string()),
            ));
        }
        self.inner.wake.notify_one();
    }

    pub fn phase(&self, job_id: JobId) -> Option<JobPhase> {
        let state = self.inner.state();
        if state.running.contains_key(&job_id) {
            Some(JobPhase::Running)
        } else if state.queued.iter().any(|job| job.job_id == job_id) {
            Some(JobPhase::Queued)
        } else {
            None
        }
    }

    /// No job is queued or running
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.queued.is_empty() && state.running.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state().queued.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner.state().running.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed.is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close("scheduler dropped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("concurrency_limit", &self.inner.concurrency_limit)
            .field("queued", &self.queued_len())
            .field("running", &self.running_len())
            .finish()
    }
}

/// Removes a job from the running set however its task ends
struct RunningGuard {
    inner: Arc<SchedulerInner>,
    job_id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.state().running.remove(&self.job_id);
        self.inner.wake.notify_one();
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>) {
    loop {
        let (ready, finished) = {
            let mut state = inner.state();
            let mut ready = Vec::new();
            while state.running.len() < inner.concurrency_limit {
                let Some(job) = state.queued.pop_front() else {
                    break;
                };
                let (signal_tx, signal_rx) = watch::channel(Interrupt::None);
                state.running.insert(job.job_id, signal_tx);
                ready.push((job, JobSignal { rx: signal_rx }));
            }
            let finished = state.closed.is_some() && state.queued.is_empty() && state.running.is_empty();
            (ready, finished)
        };

        for (job, signal) in ready {
            trace!(
                queue = %inner.name,
                job_id = %job.job_id,
                waited_ms = job.submitted.elapsed().as_millis() as u64,
                "job dispatched"
            );
            let guard = RunningGuard {
                inner: Arc::clone(&inner),
                job_id: job.job_id,
            };
            let fut = (job.work)(signal);
            let result_tx = job.result_tx;
            tokio::spawn(async move {
                let result = fut.await;
                let _ = result_tx.send(result);
                drop(guard);
            });
        }

        if finished {
            trace!(queue = %inner.name, "dispatch loop finished");
            return;
        }
        inner.wake.notified().await;
    }
}
