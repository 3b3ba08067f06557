//! Per-context proxy and the execution path of a single job.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::RwLock as AsyncRwLock;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::Binding;
use crate::group::HandleKey;
use crate::host::{HostError, HostInner, JobEventKind};
use crate::protocol::{ExecuteReply, ExecuteStatus, Method, PushEvent, Reply};
use crate::scheduler::{CancelOutcome, Interrupt, JobSignal, JobTicket};
use crate::supervisor::EngineHandle;
use crate::transport::{Subscription, TransportError};
use crate::types::{
    ErrorCode, ExecutionContext, ExecutionResult, Fragment, HandleId, JobError, JobId,
    ResolvedLimits,
};

/// How long to wait for exit details after an engine drops a running job
const CRASH_SETTLE: Duration = Duration::from_secs(3);

pub(crate) struct ProxyState {
    binding_id: String,
    context: ExecutionContext,
    group: Mutex<Option<HandleKey>>,
    closed: AtomicBool,
}

impl ProxyState {
    pub(crate) fn new(binding_id: &str, context: ExecutionContext) -> Self {
        Self {
            binding_id: binding_id.to_string(),
            context,
            group: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn group_slot(&self) -> MutexGuard<'_, Option<HandleKey>> {
        self.group.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn binding_id(&self) -> &str {
        &self.binding_id
    }

    pub(crate) fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub(crate) fn group(&self) -> Option<HandleKey> {
        self.group_slot().clone()
    }

    pub(crate) fn set_group(&self, key: HandleKey) {
        *self.group_slot() = Some(key);
    }

    pub(crate) fn clear_group(&self) {
        self.group_slot().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if the proxy was still open
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Runs code for one execution context on one binding.
///
/// The proxy does not own a process: jobs are routed to whichever engine
/// process serves the context's isolation group, starting one on demand.
/// Clones share state; closing one closes them all.
#[derive(Clone)]
pub struct InterpreterProxy {
    state: Arc<ProxyState>,
    host: Arc<HostInner>,
}

impl InterpreterProxy {
    pub(crate) fn new(state: Arc<ProxyState>, host: Arc<HostInner>) -> Self {
        Self { state, host }
    }

    pub fn binding(&self) -> &str {
        self.state.binding_id()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.state.context
    }

    /// Key of the isolation group this proxy last joined
    pub fn group(&self) -> Option<HandleKey> {
        self.state.group()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Make sure the group's engine process is running.
    ///
    /// Starts it if needed and waits for the handshake. Calling it again
    /// returns the same process while it lives.
    pub async fn open(&self) -> Result<HandleId, HostError> {
        self.host.open(&self.state).await
    }

    /// Queue `code` and return a ticket for its result
    pub fn submit(&self, code: impl Into<String>) -> Result<JobTicket, HostError> {
        self.host.submit(&self.state, code.into())
    }

    /// Run `code` and wait for its result
    pub async fn execute(&self, code: impl Into<String>) -> Result<ExecutionResult, HostError> {
        Ok(self.submit(code)?.wait().await)
    }

    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, HostError> {
        self.host.cancel(job_id)
    }

    /// Leave the isolation group. A scoped or isolated group whose last
    /// member leaves is torn down along with its process.
    pub async fn close(&self) {
        self.host.close_proxy(&self.state).await;
    }
}

impl std::fmt::Debug for InterpreterProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterProxy")
            .field("binding", &self.state.binding_id)
            .field("context", &self.state.context)
            .field("group", &self.state.group())
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

/// Everything a dispatched job needs, captured at submission
pub(crate) struct JobSpec {
    pub(crate) job_id: JobId,
    pub(crate) key: HandleKey,
    pub(crate) binding: Arc<Binding>,
    pub(crate) limits: ResolvedLimits,
    pub(crate) gate: Arc<AsyncRwLock<()>>,
    pub(crate) context: ExecutionContext,
    pub(crate) code: String,
}

enum Outcome {
    Replied(Result<Reply, TransportError>),
    Interrupted(Interrupt),
    TimedOut,
}

/// Collects a job's fragments and forwards them as events
struct Output<'a> {
    host: &'a HostInner,
    job: &'a JobSpec,
    fragments: Vec<Fragment>,
}

impl<'a> Output<'a> {
    fn new(host: &'a HostInner, job: &'a JobSpec) -> Self {
        Self {
            host,
            job,
            fragments: Vec::new(),
        }
    }

    fn emit(&self, kind: JobEventKind) {
        self.host
            .emit(self.job.job_id, &self.job.key.binding, &self.job.context, kind);
    }

    fn fragment(&mut self, fragment: Fragment) {
        self.emit(JobEventKind::Output(fragment.clone()));
        self.fragments.push(fragment);
    }

    fn push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Output { fragment } => self.fragment(fragment),
            PushEvent::Progress { percent } => self.emit(JobEventKind::Progress(percent.min(100))),
        }
    }

    fn drain(&mut self, pushes: &mut Subscription) {
        while let Some(event) = pushes.try_recv() {
            self.push(event);
        }
    }

    fn complete(mut self, reply: ExecuteReply) -> ExecutionResult {
        for fragment in reply.fragments {
            self.fragment(fragment);
        }
        let job_id = self.job.job_id;
        let mut result = match reply.status {
            ExecuteStatus::Success => {
                let mut result = ExecutionResult::succeeded(job_id, Vec::new());
                result.payload = reply.payload;
                result
            }
            ExecuteStatus::Error => {
                let message = reply
                    .message
                    .or_else(|| {
                        self.fragments.iter().rev().find_map(|f| match f {
                            Fragment::Error(message) => Some(message.clone()),
                            _ => None,
                        })
                    })
                    .unwrap_or_else(|| "engine reported an error".to_string());
                if !self.fragments.iter().any(|f| matches!(f, Fragment::Error(_))) {
                    self.fragment(Fragment::Error(message.clone()));
                }
                ExecutionResult::failed(job_id, JobError::new(ErrorCode::EngineError, message))
            }
            ExecuteStatus::Cancelled => ExecutionResult::failed(
                job_id,
                JobError::new(ErrorCode::Cancelled, "job cancelled by the engine"),
            ),
        };
        result.fragments = self.fragments;
        result
    }

    fn fail(self, error: JobError) -> ExecutionResult {
        let mut result = ExecutionResult::failed(self.job.job_id, error);
        result.fragments = self.fragments;
        result
    }
}

fn interrupted(job_id: JobId, interrupt: Interrupt) -> JobError {
    match interrupt {
        Interrupt::Cancel => JobError::new(ErrorCode::Cancelled, "job cancelled"),
        Interrupt::Abort(reason) => JobError::new(ErrorCode::Teardown, reason),
        Interrupt::None => {
            JobError::new(ErrorCode::Teardown, format!("job {job_id} interrupted"))
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Run one dispatched job to a terminal result
pub(crate) async fn run_job(
    host: Arc<HostInner>,
    job: JobSpec,
    mut signal: JobSignal,
) -> ExecutionResult {
    let span = info_span!("job", job_id = %job.job_id, key = %job.key);
    async move {
        let started = Instant::now();
        let mut result = execute(&host, &job, &mut signal).await;
        result.elapsed = started.elapsed();
        result
    }
    .instrument(span)
    .await
}

async fn execute(host: &Arc<HostInner>, job: &JobSpec, signal: &mut JobSignal) -> ExecutionResult {
    let acquire = async {
        let _gate = job.gate.read().await;
        host.supervisor
            .acquire(&job.key, &job.binding, &job.context, &job.limits)
            .await
    };
    let lease = tokio::select! {
        acquired = acquire => match acquired {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "engine did not start");
                return ExecutionResult::failed(job.job_id, e.to_job_error());
            }
        },
        interrupt = signal.fired() => {
            debug!(?interrupt, "interrupted while waiting for the engine");
            return ExecutionResult::failed(job.job_id, interrupted(job.job_id, interrupt));
        }
    };

    let handle = Arc::clone(lease.handle());
    let mut output = Output::new(host, job);
    output.emit(JobEventKind::Started { handle: handle.id() });

    let channel = handle.channel().clone();
    let mut pushes = channel.subscribe(job.job_id);
    let call = channel.call(Method::Execute {
        job_id: job.job_id,
        context: job.context.clone(),
        code: job.code.clone(),
    });
    tokio::pin!(call);
    let timeout = deadline(job.limits.job_timeout);
    tokio::pin!(timeout);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = pushes.recv() => output.push(event),
            reply = &mut call => break Outcome::Replied(reply),
            interrupt = signal.fired() => break Outcome::Interrupted(interrupt),
            () = &mut timeout => break Outcome::TimedOut,
        }
    };

    let mut result = match outcome {
        Outcome::Replied(reply) => {
            output.drain(&mut pushes);
            match reply {
                Ok(Reply::Execute(reply)) => output.complete(reply),
                Ok(_) => output.fail(JobError::new(
                    ErrorCode::TransportError,
                    TransportError::UnexpectedReply { method: "execute" }.to_string(),
                )),
                Err(TransportError::Remote(message)) => {
                    output.fail(JobError::new(ErrorCode::EngineError, message))
                }
                Err(e) => {
                    let error = engine_lost(&handle, e, job.limits.shutdown_grace).await;
                    output.fail(error)
                }
            }
        }
        Outcome::Interrupted(Interrupt::Cancel) => {
            let recycled = wind_down(host, &handle, job, call.as_mut(), &mut pushes, &mut output).await;
            let message = if recycled {
                "job cancelled; engine recycled"
            } else {
                "job cancelled"
            };
            output.fail(JobError::new(ErrorCode::Cancelled, message))
        }
        Outcome::Interrupted(interrupt) => {
            debug!(?interrupt, "job aborted");
            output.fail(interrupted(job.job_id, interrupt))
        }
        Outcome::TimedOut => {
            let limit = job.limits.job_timeout.unwrap_or_default();
            warn!(?limit, "job timed out");
            wind_down(host, &handle, job, call.as_mut(), &mut pushes, &mut output).await;
            output.fail(JobError::new(
                ErrorCode::JobTimeout,
                format!("job exceeded its timeout of {:.1}s", limit.as_secs_f64()),
            ))
        }
    };
    result.handle = Some(handle.id());
    host.supervisor.release(lease);
    result
}

/// Ask the engine to stop the job and give it `cancel_grace` to do so.
/// Recycles the process when it does not. Returns true if it was recycled.
async fn wind_down<F>(
    host: &Arc<HostInner>,
    handle: &Arc<EngineHandle>,
    job: &JobSpec,
    mut call: Pin<&mut F>,
    pushes: &mut Subscription,
    output: &mut Output<'_>,
) -> bool
where
    F: Future<Output = Result<Reply, TransportError>>,
{
    if handle.capabilities().supports_cancel {
        let channel = handle.channel().clone();
        let job_id = job.job_id;
        tokio::spawn(async move {
            if let Err(e) = channel.call(Method::Cancel { job_id }).await {
                debug!(%job_id, error = %e, "cancel call failed");
            }
        });
    }

    let stopped = tokio::time::timeout(job.limits.cancel_grace, async {
        loop {
            tokio::select! {
                biased;
                Some(event) = pushes.recv() => output.push(event),
                reply = &mut call => return reply,
            }
        }
    })
    .await;

    match stopped {
        Ok(_) => {
            output.drain(pushes);
            false
        }
        Err(_) => {
            warn!(handle = %handle.id(), "engine did not stop the job in time, recycling");
            host.supervisor.recycle(handle, "job did not stop after cancel");
            true
        }
    }
}

/// Classify a job whose channel went away under it
async fn engine_lost(handle: &EngineHandle, error: TransportError, grace: Duration) -> JobError {
    let exit = tokio::time::timeout(grace + CRASH_SETTLE, handle.exited())
        .await
        .ok();
    match handle.dead_reason() {
        Some(reason) if reason.is_deliberate() => JobError::new(ErrorCode::Teardown, reason.to_string()),
        reason => {
            let exit = exit.unwrap_or_default();
            let message = match reason {
                Some(reason) => format!("engine crashed: {reason}"),
                None => format!("engine crashed: {error}"),
            };
            warn!(handle = %handle.id(), code = ?exit.code, "{message}");
            JobError::new(ErrorCode::EngineCrash, message)
                .with_exit_code(exit.code)
                .with_stderr_tail(exit.stderr_tail)
        }
    }
}
