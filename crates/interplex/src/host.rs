//! The interpreter host: runtime registry of bindings, isolation groups and
//! proxies on top of one [`Supervisor`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock as AsyncRwLock, broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{Binding, Config, ConfigError, validate_binding};
use crate::group::{HandleKey, IsolationGroup};
use crate::process::StartupError;
use crate::protocol::{Method, Reply, StatusReply};
use crate::proxy::{InterpreterProxy, JobSpec, ProxyState, run_job};
use crate::scheduler::{CancelOutcome, JobFuture, JobPhase, JobTicket, JobWork};
use crate::supervisor::{ProcessSummary, Supervisor, SupervisorSettings};
use crate::transport::TransportError;
use crate::types::{
    ExecutionContext, ExecutionResult, Fragment, HandleId, JobId, JobStatus, ResolvedLimits,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown binding '{0}'")]
    UnknownBinding(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("proxy for {context} on binding '{binding}' is closed")]
    ProxyClosed {
        binding: String,
        context: ExecutionContext,
    },

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("host is shut down")]
    ShutDown,
}

/// Something that happened to a job, for external consumers of streamed output
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub binding: String,
    pub context: ExecutionContext,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Queued,
    Started { handle: HandleId },
    Output(Fragment),
    Progress(u8),
    Finished { status: JobStatus },
}

/// A binding as currently configured
#[derive(Clone)]
pub(crate) struct BindingEntry {
    pub(crate) binding: Arc<Binding>,
    pub(crate) limits: ResolvedLimits,
    /// Held for reading while acquiring processes, for writing while
    /// the binding is torn down
    pub(crate) gate: Arc<AsyncRwLock<()>>,
}

struct JobRecord {
    key: HandleKey,
}

pub(crate) struct HostInner {
    config: Config,
    bindings: RwLock<HashMap<String, BindingEntry>>,
    groups: Mutex<HashMap<HandleKey, Arc<IsolationGroup>>>,
    proxies: Mutex<HashMap<(String, ExecutionContext), Arc<ProxyState>>>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    pub(crate) supervisor: Supervisor,
    events: broadcast::Sender<JobEvent>,
    shut_down: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl HostInner {
    fn entry(&self, binding_id: &str) -> Result<BindingEntry, HostError> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings
            .get(binding_id)
            .cloned()
            .ok_or_else(|| HostError::UnknownBinding(binding_id.to_string()))
    }

    fn ensure_running(&self) -> Result<(), HostError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(HostError::ShutDown);
        }
        Ok(())
    }

    fn ensure_open(state: &ProxyState) -> Result<(), HostError> {
        if state.is_closed() {
            return Err(HostError::ProxyClosed {
                binding: state.binding_id().to_string(),
                context: state.context().clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn emit(&self, job_id: JobId, binding: &str, context: &ExecutionContext, kind: JobEventKind) {
        let _ = self.events.send(JobEvent {
            job_id,
            binding: binding.to_string(),
            context: context.clone(),
            kind,
        });
    }

    /// Find or create the group `context` belongs to and make it a member
    pub(crate) fn join_group(
        &self,
        binding_id: &str,
        entry: &BindingEntry,
        context: &ExecutionContext,
    ) -> Arc<IsolationGroup> {
        let policy = entry.binding.policy;
        let key = HandleKey::new(binding_id, policy.group_key(context));
        let mut groups = lock(&self.groups);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            debug!(%key, %policy, "creating isolation group");
            Arc::new(IsolationGroup::new(key, policy, &entry.limits))
        });
        group.join(context);
        Arc::clone(group)
    }

    /// Take `context` out of its group, tearing the group down if it was the
    /// last member of a non-shared group
    pub(crate) async fn leave_group(&self, key: &HandleKey, context: &ExecutionContext) {
        let removed = {
            let mut groups = lock(&self.groups);
            let empty = match groups.get(key) {
                Some(group) => group.leave(context) == 0 && group.policy().tears_down_when_empty(),
                None => false,
            };
            if empty { groups.remove(key) } else { None }
        };

        if let Some(group) = removed {
            info!(%key, "last member left, tearing down group");
            group.close("isolation group closed");
            self.supervisor.destroy_key(key, "isolation group closed").await;
        }
    }

    /// Queue a job for `state`'s context
    pub(crate) fn submit(
        self: &Arc<Self>,
        state: &ProxyState,
        code: String,
    ) -> Result<JobTicket, HostError> {
        self.ensure_running()?;
        Self::ensure_open(state)?;

        let entry = self.entry(state.binding_id())?;
        let group = self.join_group(state.binding_id(), &entry, state.context());
        state.set_group(group.key().clone());

        let job_id = JobId::new();
        let spec = JobSpec {
            job_id,
            key: group.key().clone(),
            binding: Arc::clone(&entry.binding),
            limits: entry.limits.clone(),
            gate: Arc::clone(&entry.gate),
            context: state.context().clone(),
            code,
        };
        let binding_id = state.binding_id().to_string();
        let context = state.context().clone();

        lock(&self.jobs).insert(
            job_id,
            JobRecord {
                key: group.key().clone(),
            },
        );
        self.emit(job_id, &binding_id, &context, JobEventKind::Queued);

        let host = Arc::clone(self);
        let work: JobWork =
            Box::new(move |signal| -> JobFuture { Box::pin(run_job(host, spec, signal)) });
        let submitted = group.scheduler().submit(job_id, work);

        let ticket = match submitted {
            Ok(ticket) => ticket,
            Err(rejected) => {
                debug!(%job_id, ?rejected, "job rejected");
                JobTicket::ready(ExecutionResult::failed(job_id, rejected.into_error()))
            }
        };

        // Single completion point for every job, whether it ran or not
        let (tx, rx) = oneshot::channel();
        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = ticket.wait().await;
            if let Some(host) = host.upgrade() {
                host.finish(&result, &binding_id, &context);
            }
            let _ = tx.send(result);
        });
        Ok(JobTicket::from_parts(job_id, rx))
    }

    fn finish(&self, result: &ExecutionResult, binding_id: &str, context: &ExecutionContext) {
        lock(&self.jobs).remove(&result.job_id);
        debug!(
            job_id = %result.job_id,
            status = %result.status,
            elapsed = ?result.elapsed,
            "job finished"
        );
        self.emit(
            result.job_id,
            binding_id,
            context,
            JobEventKind::Finished {
                status: result.status,
            },
        );
    }

    fn group_of_job(&self, job_id: JobId) -> Result<Arc<IsolationGroup>, HostError> {
        let key = lock(&self.jobs)
            .get(&job_id)
            .map(|record| record.key.clone())
            .ok_or(HostError::JobNotFound(job_id))?;
        lock(&self.groups)
            .get(&key)
            .cloned()
            .ok_or(HostError::JobNotFound(job_id))
    }

    pub(crate) fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, HostError> {
        let group = self.group_of_job(job_id)?;
        let outcome = group.scheduler().cancel(job_id);
        debug!(%job_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Start the process for `state`'s group without running anything
    pub(crate) async fn open(&self, state: &ProxyState) -> Result<HandleId, HostError> {
        self.ensure_running()?;
        Self::ensure_open(state)?;
        let entry = self.entry(state.binding_id())?;
        let group = self.join_group(state.binding_id(), &entry, state.context());
        state.set_group(group.key().clone());

        let _gate = entry.gate.read().await;
        let lease = self
            .supervisor
            .acquire(group.key(), &entry.binding, state.context(), &entry.limits)
            .await?;
        let id = lease.id();
        self.supervisor.release(lease);
        Ok(id)
    }

    pub(crate) async fn close_proxy(&self, state: &ProxyState) {
        if !state.mark_closed() {
            return;
        }
        {
            let mut proxies = lock(&self.proxies);
            let cache_key = (state.binding_id().to_string(), state.context().clone());
            if proxies
                .get(&cache_key)
                .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), state))
            {
                proxies.remove(&cache_key);
            }
        }
        if let Some(key) = state.group() {
            self.leave_group(&key, state.context()).await;
        }
    }

    /// One sweep of the idle reaper
    async fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for key in self.supervisor.keys() {
            let idle_timeout = match self.entry(&key.binding) {
                Ok(entry) => entry.limits.idle_timeout.unwrap_or(Duration::MAX),
                Err(_) => Duration::ZERO,
            };
            let busy = lock(&self.groups)
                .get(&key)
                .is_some_and(|group| !group.is_idle());
            if busy {
                continue;
            }
            if self.supervisor.reap_if_idle(&key, idle_timeout).await {
                self.forget_members(&key);
                reaped += 1;
            }
        }
        reaped
    }

    /// Drop the cached proxies of `key`'s group and their memberships.
    ///
    /// Proxies handed out earlier keep working and rejoin on their next job.
    fn forget_members(&self, key: &HandleKey) {
        let groups = lock(&self.groups);
        let group = groups.get(key);
        let mut proxies = lock(&self.proxies);
        let mut forgotten = 0;
        proxies.retain(|_, state| {
            if state.group().as_ref() != Some(key) {
                return true;
            }
            if let Some(group) = group {
                group.leave(state.context());
            }
            state.clear_group();
            forgotten += 1;
            false
        });
        if forgotten > 0 {
            debug!(%key, forgotten, "forgot proxies of reaped group");
        }
    }
}

async fn reaper_loop(host: Weak<HostInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(host) = host.upgrade() else {
            return;
        };
        let reaped = host.reap_idle().await;
        if reaped > 0 {
            debug!(reaped, "idle reaper sweep");
        }
    }
}

/// Entry point for running code on supervised engines
///
/// Owns the supervisor, every isolation group and every proxy. Must be
/// created inside a Tokio runtime; call [`shutdown`](Self::shutdown) to stop
/// all engine processes.
///
/// ```rust,ignore
/// let host = InterpreterHost::new(Config::from_file("interplex.toml")?)?;
/// let ctx = ExecutionContext::new("alice", "notebook-1", "paragraph-3");
/// let result = host.submit("calc", &ctx, "1 + 1")?.wait().await;
/// assert_eq!(result.text(), "2");
/// host.shutdown().await;
/// ```
#[derive(Clone)]
pub struct InterpreterHost {
    inner: Arc<HostInner>,
}

impl InterpreterHost {
    /// Create a host for `config` and start the idle reaper
    pub fn new(config: Config) -> Result<Self, HostError> {
        let mut bindings = HashMap::new();
        for (id, binding) in &config.bindings {
            validate_binding(id, binding)?;
            bindings.insert(id.clone(), Self::entry_for(&config, binding.clone(), None));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = Supervisor::new(SupervisorSettings {
            callback_host: config.callback_host,
            handshake_retries: config.handshake_retries,
            stderr_tail_lines: config.stderr_tail_lines,
        });
        let reap_interval = config.reap_interval();

        let inner = Arc::new(HostInner {
            config,
            bindings: RwLock::new(bindings),
            groups: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            supervisor,
            events,
            shut_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let reaper = tokio::spawn(reaper_loop(Arc::downgrade(&inner), reap_interval));
        *lock(&inner.reaper) = Some(reaper);

        info!(bindings = inner.config.bindings.len(), "interpreter host started");
        Ok(Self { inner })
    }

    fn entry_for(config: &Config, binding: Binding, gate: Option<Arc<AsyncRwLock<()>>>) -> BindingEntry {
        BindingEntry {
            limits: config.effective_limits(&binding),
            binding: Arc::new(binding),
            gate: gate.unwrap_or_default(),
        }
    }

    /// Proxy for one context on one binding.
    ///
    /// Proxies are cached per context until they are closed or their group's
    /// process is reaped for idling.
    pub fn proxy(
        &self,
        binding_id: &str,
        context: &ExecutionContext,
    ) -> Result<InterpreterProxy, HostError> {
        self.inner.ensure_running()?;
        self.inner.entry(binding_id)?;

        let mut proxies = lock(&self.inner.proxies);
        let state = proxies
            .entry((binding_id.to_string(), context.clone()))
            .or_insert_with(|| Arc::new(ProxyState::new(binding_id, context.clone())));
        Ok(InterpreterProxy::new(Arc::clone(state), Arc::clone(&self.inner)))
    }

    /// Queue `code` for `context` on `binding_id`
    pub fn submit(
        &self,
        binding_id: &str,
        context: &ExecutionContext,
        code: impl Into<String>,
    ) -> Result<JobTicket, HostError> {
        self.proxy(binding_id, context)?.submit(code)
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, HostError> {
        self.inner.cancel(job_id)
    }

    /// Where a job is in its queue, if it has not finished yet
    pub fn job_status(&self, job_id: JobId) -> Option<JobPhase> {
        self.inner
            .group_of_job(job_id)
            .ok()
            .and_then(|group| group.scheduler().phase(job_id))
    }

    /// Ask the engine running a job what it thinks the job's state is
    pub async fn remote_status(&self, job_id: JobId) -> Result<StatusReply, HostError> {
        let group = self.inner.group_of_job(job_id)?;
        let handle = self
            .inner
            .supervisor
            .handle(group.key())
            .ok_or(HostError::JobNotFound(job_id))?;
        match handle.channel().call(Method::Status { job_id }).await? {
            Reply::Status(status) => Ok(status),
            _ => Err(TransportError::UnexpectedReply { method: "status" }.into()),
        }
    }

    /// Live and starting processes of one binding
    pub fn list_active_processes(&self, binding_id: &str) -> Vec<ProcessSummary> {
        self.inner.supervisor.list(binding_id)
    }

    /// Current definition of every binding, sorted by id
    pub fn bindings(&self) -> Vec<(String, Arc<Binding>)> {
        let bindings = self.inner.bindings.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = bindings
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.binding)))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Replace (or add) a binding.
    ///
    /// Every group and process of the binding is torn down first; its
    /// outstanding jobs end ABORTED. Acquisitions for the binding wait until
    /// the teardown has finished.
    #[instrument(skip(self, binding))]
    pub async fn reconfigure(&self, binding_id: &str, binding: Binding) -> Result<(), HostError> {
        self.inner.ensure_running()?;
        validate_binding(binding_id, &binding)?;

        let gate = {
            let bindings = self.inner.bindings.read().unwrap_or_else(|e| e.into_inner());
            bindings.get(binding_id).map(|entry| Arc::clone(&entry.gate))
        }
        .unwrap_or_default();
        let _teardown = gate.write().await;

        {
            let mut bindings = self.inner.bindings.write().unwrap_or_else(|e| e.into_inner());
            let entry = Self::entry_for(&self.inner.config, binding, Some(Arc::clone(&gate)));
            bindings.insert(binding_id.to_string(), entry);
        }

        let groups: Vec<Arc<IsolationGroup>> = {
            let mut groups = lock(&self.inner.groups);
            let keys: Vec<HandleKey> = groups
                .keys()
                .filter(|key| key.binding == binding_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| groups.remove(key)).collect()
        };
        for group in &groups {
            group.close("binding reconfigured");
        }
        lock(&self.inner.proxies)
            .iter()
            .filter(|((id, _), _)| id == binding_id)
            .for_each(|(_, state)| state.clear_group());

        self.inner
            .supervisor
            .destroy_binding(binding_id, "binding reconfigured")
            .await;
        info!(binding = binding_id, groups = groups.len(), "binding reconfigured");
        Ok(())
    }

    /// Receive events for every job submitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Close every proxy of `context`, across all bindings
    pub async fn close_context(&self, context: &ExecutionContext) {
        let states: Vec<Arc<ProxyState>> = lock(&self.inner.proxies)
            .iter()
            .filter(|((_, ctx), _)| ctx == context)
            .map(|(_, state)| Arc::clone(state))
            .collect();
        for state in states {
            self.inner.close_proxy(&state).await;
        }
    }

    /// Run one idle-reaper sweep now. Returns how many processes were reaped.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Abort all jobs and stop every engine process
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down interpreter host");
        if let Some(reaper) = lock(&self.inner.reaper).take() {
            reaper.abort();
        }

        let groups: Vec<Arc<IsolationGroup>> = lock(&self.inner.groups).drain().map(|(_, g)| g).collect();
        for group in &groups {
            group.close("host shutting down");
        }
        for (_, state) in lock(&self.inner.proxies).drain() {
            state.mark_closed();
        }
        self.inner.supervisor.shutdown_all("host shutting down").await;
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) && !self.supervisor.keys().is_empty() {
            warn!("interpreter host dropped without shutdown; engine processes will be killed");
        }
        if let Some(reaper) = lock(&self.reaper).take() {
            reaper.abort();
        }
    }
}

impl std::fmt::Debug for InterpreterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterHost")
            .field("supervisor", &self.inner.supervisor)
            .field("groups", &lock(&self.inner.groups).len())
            .finish()
    }
}
