//! Process supervisor: owns every engine process handle, keyed by binding
//! and isolation group.
//!
//! At most one live handle exists per key. Starting a process for a key is
//! serialized by a per-key async gate so concurrent acquirers share one
//! launch; distinct keys start in parallel. Jobs borrow handles through
//! [`Lease`]s, which keep a handle from being reaped while in use.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::Binding;
use crate::group::HandleKey;
use crate::process::{EngineProcess, LaunchRequest, StartupError, StderrTail};
use crate::protocol::Method;
use crate::transport::Channel;
use crate::types::{Capabilities, EngineState, ExecutionContext, HandleId, ResolvedLimits};

/// Extra time the exit watcher allows after a forced kill
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Supervisor-wide settings taken from the host configuration
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub callback_host: IpAddr,
    pub handshake_retries: u32,
    pub stderr_tail_lines: usize,
}

/// Why a handle stopped being usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadReason {
    /// The process exited on its own
    Exited { code: Option<i32> },
    /// The engine hung up the channel
    Disconnected(String),
    /// Reaped after being idle
    Idle,
    /// Torn down on request
    Destroyed(String),
}

impl DeadReason {
    /// The supervisor itself ended the process
    pub fn is_deliberate(&self) -> bool {
        matches!(self, DeadReason::Idle | DeadReason::Destroyed(_))
    }
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadReason::Exited { code: Some(code) } => write!(f, "engine exited with code {code}"),
            DeadReason::Exited { code: None } => write!(f, "engine was killed by a signal"),
            DeadReason::Disconnected(reason) => write!(f, "engine disconnected: {reason}"),
            DeadReason::Idle => write!(f, "engine reaped after idling"),
            DeadReason::Destroyed(reason) => write!(f, "engine destroyed: {reason}"),
        }
    }
}

/// How an engine process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub stderr_tail: Vec<String>,
}

struct HandleState {
    dead: Option<DeadReason>,
    active_jobs: usize,
    last_activity: Instant,
}

/// One running engine process
pub struct EngineHandle {
    id: HandleId,
    key: HandleKey,
    pid: u32,
    endpoint: SocketAddr,
    engine: String,
    capabilities: Capabilities,
    channel: Channel,
    started_at: Instant,
    shutdown_grace: Duration,
    state: Mutex<HandleState>,
    stop_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl EngineHandle {
    /// Take ownership of a started process and begin watching it
    pub(crate) fn start(
        id: HandleId,
        key: HandleKey,
        process: EngineProcess,
        shutdown_grace: Duration,
    ) -> Arc<Self> {
        let EngineProcess {
            child,
            pid,
            endpoint,
            engine,
            capabilities,
            channel,
            stderr,
        } = process;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = Arc::new(Self {
            id,
            key,
            pid,
            endpoint,
            engine,
            capabilities,
            channel: channel.clone(),
            started_at: Instant::now(),
            shutdown_grace,
            state: Mutex::new(HandleState {
                dead: None,
                active_jobs: 0,
                last_activity: Instant::now(),
            }),
            stop_tx: Mutex::new(Some(stop_tx)),
            exit_rx,
        });

        tokio::spawn(watch_process(
            Arc::downgrade(&handle),
            child,
            channel,
            stderr,
            stop_rx,
            exit_tx,
            shutdown_grace,
        ));
        handle
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn state(&self) -> EngineState {
        let state = self.lock();
        if state.dead.is_some() || self.channel.is_closed() {
            EngineState::Dead
        } else if state.active_jobs > 0 {
            EngineState::Busy
        } else {
            EngineState::Ready
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state() == EngineState::Dead
    }

    pub fn dead_reason(&self) -> Option<DeadReason> {
        self.lock().dead.clone()
    }

    pub fn active_jobs(&self) -> usize {
        self.lock().active_jobs
    }

    /// Time since the last lease was taken or returned
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Borrow the handle for a job, unless it is already dead
    pub fn lease(self: &Arc<Self>) -> Option<Lease> {
        let mut state = self.lock();
        if state.dead.is_some() || self.channel.is_closed() {
            return None;
        }
        state.active_jobs += 1;
        state.last_activity = Instant::now();
        Some(Lease {
            handle: Arc::clone(self),
        })
    }

    fn release_one(&self) {
        let mut state = self.lock();
        state.active_jobs = state.active_jobs.saturating_sub(1);
        state.last_activity = Instant::now();
    }

    /// Record why the handle died. Returns false if it already was dead.
    fn mark_dead(&self, reason: DeadReason) -> bool {
        let mut state = self.lock();
        if state.dead.is_some() {
            return false;
        }
        debug!(handle = %self.id, key = %self.key, %reason, "engine handle dead");
        state.dead = Some(reason);
        true
    }

    /// Mark the handle dead if nothing has used it for `idle_timeout`
    fn retire_if_idle(&self, idle_timeout: Duration) -> bool {
        let mut state = self.lock();
        if state.dead.is_some()
            || state.active_jobs > 0
            || state.last_activity.elapsed() < idle_timeout
        {
            return false;
        }
        state.dead = Some(DeadReason::Idle);
        true
    }

    /// Ask the engine to stop, then have the watcher kill it after the grace
    /// period. Only the first call does anything.
    async fn stop_process(&self) {
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(stop) = stop else {
            return;
        };

        let grace = self.shutdown_grace;
        let shutdown = Method::Shutdown {
            grace_ms: grace.as_millis() as u64,
        };
        match tokio::time::timeout(grace, self.channel.call(shutdown)).await {
            Ok(Ok(_)) => debug!(handle = %self.id, "engine acknowledged shutdown"),
            Ok(Err(e)) => debug!(handle = %self.id, error = %e, "shutdown call failed"),
            Err(_) => debug!(handle = %self.id, "engine did not acknowledge shutdown in time"),
        }
        let _ = stop.send(grace);
    }

    /// Stop the process and wait for it to exit. Idempotent.
    pub(crate) async fn terminate(&self, reason: DeadReason) -> ExitInfo {
        self.mark_dead(reason);
        self.stop_process().await;
        self.exited().await
    }

    /// Wait until the process has exited
    pub async fn exited(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = rx.wait_for(|exit| exit.is_some()).await.ok().and_then(|exit| exit.clone());
        info.unwrap_or_default()
    }

    /// Exit details, if the process has already exited
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for the process to end however that happens, then publish its exit
async fn watch_process(
    handle: Weak<EngineHandle>,
    mut child: Child,
    channel: Channel,
    stderr: StderrTail,
    mut stop_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    shutdown_grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = channel.closed() => {
            if let Some(handle) = handle.upgrade() {
                let reason = channel.close_reason().unwrap_or_default();
                handle.mark_dead(DeadReason::Disconnected(reason));
            }
            wait_or_kill(&mut child, shutdown_grace).await
        }
        grace = &mut stop_rx => {
            wait_or_kill(&mut child, grace.unwrap_or(Duration::ZERO)).await
        }
    };

    stderr.settle(Duration::from_millis(200)).await;
    let code = status.and_then(|s| s.code());
    if let Some(handle) = handle.upgrade() {
        handle.mark_dead(DeadReason::Exited { code });
    }
    channel.close(&match code {
        Some(code) => format!("engine exited with code {code}"),
        None => "engine terminated".to_string(),
    });
    exit_tx.send_replace(Some(ExitInfo {
        code,
        stderr_tail: stderr.snapshot(),
    }));
}

async fn wait_or_kill(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok();
    }
    debug!(pid = ?child.id(), "engine still running after grace period, killing");
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "failed to kill engine");
    }
    tokio::time::timeout(KILL_SETTLE, child.wait())
        .await
        .ok()
        .and_then(|status| status.ok())
}

/// A job's borrow of an engine handle
#[derive(Debug)]
pub struct Lease {
    handle: Arc<EngineHandle>,
}

impl Lease {
    pub fn handle(&self) -> &Arc<EngineHandle> {
        &self.handle
    }
}

impl Deref for Lease {
    type Target = EngineHandle;

    fn deref(&self) -> &EngineHandle {
        &self.handle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.handle.release_one();
    }
}

/// Snapshot of one supervised process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub key: HandleKey,
    /// `None` while the first launch for the key is still in flight
    pub handle: Option<HandleId>,
    pub pid: Option<u32>,
    pub endpoint: Option<SocketAddr>,
    pub state: EngineState,
    pub active_jobs: usize,
    pub idle_for: Duration,
    pub uptime: Duration,
}

#[derive(Default)]
struct SlotState {
    handle: Option<Arc<EngineHandle>>,
    starting: bool,
}

#[derive(Default)]
struct Slot {
    gate: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease_live(&self) -> Option<Lease> {
        self.state().handle.as_ref().and_then(|handle| handle.lease())
    }
}

/// Clears the STARTING marker however the launch ends
struct StartingGuard<'a> {
    slot: &'a Slot,
}

impl<'a> StartingGuard<'a> {
    fn new(slot: &'a Slot) -> Self {
        slot.state().starting = true;
        Self { slot }
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.slot.state().starting = false;
    }
}

/// Owner of all engine process handles
pub struct Supervisor {
    settings: SupervisorSettings,
    slots: Mutex<HashMap<HandleKey, Arc<Slot>>>,
    next_handle: AtomicU64,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            slots: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<HandleKey, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &HandleKey) -> Arc<Slot> {
        Arc::clone(self.slots().entry(key.clone()).or_default())
    }

    fn existing_slot(&self, key: &HandleKey) -> Option<Arc<Slot>> {
        self.slots().get(key).cloned()
    }

    /// Drop the slot for `key` if nothing lives in it and nobody else holds it
    fn forget_if_empty(&self, key: &HandleKey) {
        let mut slots = self.slots();
        let remove = slots.get(key).is_some_and(|slot| {
            let state = slot.state();
            state.handle.is_none() && !state.starting && Arc::strong_count(slot) == 1
        });
        if remove {
            slots.remove(key);
        }
    }

    /// Return the live handle for `key`, starting a process if there is none
    #[instrument(skip(self, binding, context, limits), fields(key = %key))]
    pub async fn acquire(
        &self,
        key: &HandleKey,
        binding: &Binding,
        context: &ExecutionContext,
        limits: &ResolvedLimits,
    ) -> Result<Lease, StartupError> {
        let slot = self.slot(key);
        if let Some(lease) = slot.lease_live() {
            return Ok(lease);
        }

        let result = {
            let _gate = slot.gate.lock().await;
            match slot.lease_live() {
                Some(lease) => Ok(lease),
                None => self.start_in_slot(&slot, key, binding, context, limits).await,
            }
        };
        drop(slot);
        if result.is_err() {
            self.forget_if_empty(key);
        }
        result
    }

    async fn start_in_slot(
        &self,
        slot: &Slot,
        key: &HandleKey,
        binding: &Binding,
        context: &ExecutionContext,
        limits: &ResolvedLimits,
    ) -> Result<Lease, StartupError> {
        let stale = slot.state().handle.take();
        if let Some(stale) = stale {
            debug!(handle = %stale.id(), "discarding dead engine handle");
            stale.terminate(DeadReason::Destroyed("replaced".to_string())).await;
        }

        let _starting = StartingGuard::new(slot);
        let process = self.launch_with_retries(key, binding, context, limits).await?;

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let pid = process.pid;
        let handle = EngineHandle::start(id, key.clone(), process, limits.shutdown_grace);
        let lease = handle.lease().ok_or_else(|| StartupError::Failure {
            exit_code: handle.exit_info().and_then(|exit| exit.code),
            stderr_tail: handle.exit_info().map(|exit| exit.stderr_tail).unwrap_or_default(),
            message: "engine died right after its handshake".to_string(),
        })?;
        slot.state().handle = Some(handle);
        info!(handle = %id, pid, "engine process started");
        Ok(lease)
    }

    async fn launch_with_retries(
        &self,
        key: &HandleKey,
        binding: &Binding,
        context: &ExecutionContext,
        limits: &ResolvedLimits,
    ) -> Result<EngineProcess, StartupError> {
        let mut attempt = 0;
        loop {
            let request = LaunchRequest {
                binding_id: &key.binding,
                binding,
                group: &key.group,
                context,
                callback_host: self.settings.callback_host,
                startup_timeout: limits.startup_timeout,
                stderr_tail_lines: self.settings.stderr_tail_lines,
            };
            match EngineProcess::launch(request).await {
                Err(StartupError::HandshakeRejected(reason)) => {
                    if attempt >= self.settings.handshake_retries {
                        return Err(StartupError::Failure {
                            exit_code: None,
                            stderr_tail: Vec::new(),
                            message: format!(
                                "handshake rejected on {} attempt(s): {reason}",
                                attempt + 1
                            ),
                        });
                    }
                    attempt += 1;
                    warn!(attempt, %reason, "engine handshake rejected, retrying");
                }
                other => return other,
            }
        }
    }

    /// Return a lease. The process keeps running.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Live handle for `key`, if any
    pub fn handle(&self, key: &HandleKey) -> Option<Arc<EngineHandle>> {
        let slot = self.existing_slot(key)?;
        let handle = slot.state().handle.clone();
        handle.filter(|handle| !handle.is_dead())
    }

    /// Take `handle` out of service at once and stop its process in the
    /// background. The next `acquire` for its key starts a fresh process
    /// without waiting for the old one to exit.
    pub fn recycle(&self, handle: &Arc<EngineHandle>, reason: &str) {
        if let Some(slot) = self.existing_slot(handle.key()) {
            let mut state = slot.state();
            if state.handle.as_ref().is_some_and(|h| h.id() == handle.id()) {
                state.handle = None;
            }
        }
        let reason = DeadReason::Destroyed(reason.to_string());
        handle.mark_dead(reason.clone());
        self.forget_if_empty(handle.key());

        info!(handle = %handle.id(), key = %handle.key(), %reason, "recycling engine process");
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let exit = handle.terminate(reason).await;
            debug!(handle = %handle.id(), code = ?exit.code, "recycled engine exited");
        });
    }

    /// Stop whatever process serves `key`
    pub async fn destroy_key(&self, key: &HandleKey, reason: &str) {
        let handle = self
            .existing_slot(key)
            .and_then(|slot| slot.state().handle.take());
        if let Some(handle) = handle {
            info!(handle = %handle.id(), %key, reason, "destroying engine process");
            handle
                .terminate(DeadReason::Destroyed(reason.to_string()))
                .await;
        }
        self.forget_if_empty(key);
    }

    /// Stop every process of one binding
    pub async fn destroy_binding(&self, binding: &str, reason: &str) {
        let keys: Vec<HandleKey> = self
            .keys()
            .into_iter()
            .filter(|key| key.binding == binding)
            .collect();
        self.destroy_keys(keys, reason).await;
    }

    /// Stop every supervised process
    pub async fn shutdown_all(&self, reason: &str) {
        let keys = self.keys();
        self.destroy_keys(keys, reason).await;
    }

    async fn destroy_keys(&self, keys: Vec<HandleKey>, reason: &str) {
        let mut tasks = JoinSet::new();
        for key in &keys {
            let handle = self
                .existing_slot(key)
                .and_then(|slot| slot.state().handle.take());
            if let Some(handle) = handle {
                let reason = reason.to_string();
                tasks.spawn(async move {
                    handle.terminate(DeadReason::Destroyed(reason)).await;
                });
            }
        }
        while tasks.join_next().await.is_some() {}
        for key in &keys {
            self.forget_if_empty(key);
        }
    }

    /// Reap the process for `key` if it has had no lease for `idle_timeout`.
    ///
    /// Skips keys whose process is currently being started.
    pub async fn reap_if_idle(&self, key: &HandleKey, idle_timeout: Duration) -> bool {
        let Some(slot) = self.existing_slot(key) else {
            return false;
        };
        let handle = {
            let Ok(_gate) = slot.gate.try_lock() else {
                return false;
            };
            let mut state = slot.state();
            let retire = state
                .handle
                .as_ref()
                .is_some_and(|handle| handle.is_dead() || handle.retire_if_idle(idle_timeout));
            if retire { state.handle.take() } else { None }
        };
        drop(slot);

        let Some(handle) = handle else {
            return false;
        };
        info!(handle = %handle.id(), %key, idle_for = ?handle.idle_for(), "reaping idle engine");
        handle.terminate(DeadReason::Idle).await;
        self.forget_if_empty(key);
        true
    }

    /// Keys that currently have a slot
    pub fn keys(&self) -> Vec<HandleKey> {
        self.slots().keys().cloned().collect()
    }

    /// Summaries of live and starting processes of one binding
    pub fn list(&self, binding: &str) -> Vec<ProcessSummary> {
        let slots: Vec<(HandleKey, Arc<Slot>)> = self
            .slots()
            .iter()
            .filter(|(key, _)| key.binding == binding)
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();

        let mut summaries: Vec<ProcessSummary> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let state = slot.state();
                match state.handle {
                    Some(ref handle) if !handle.is_dead() => Some(ProcessSummary {
                        key,
                        handle: Some(handle.id()),
                        pid: Some(handle.pid()),
                        endpoint: Some(handle.endpoint()),
                        state: handle.state(),
                        active_jobs: handle.active_jobs(),
                        idle_for: handle.idle_for(),
                        uptime: handle.uptime(),
                    }),
                    _ if state.starting => Some(ProcessSummary {
                        key,
                        handle: None,
                        pid: None,
                        endpoint: None,
                        state: EngineState::Starting,
                        active_jobs: 0,
                        idle_for: Duration::ZERO,
                        uptime: Duration::ZERO,
                    }),
                    _ => None,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.settings)
            .field("slots", &self.slots().len())
            .finish()
    }
}
