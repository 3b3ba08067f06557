use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Limits and timeouts for a binding's engine processes and jobs.
///
/// Every field is optional so that a partial table only overrides what it
/// names. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Maximum number of jobs running at once on one group's queue
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    /// Maximum number of queued jobs per group (0 disables the bound)
    #[serde(default)]
    pub queue_depth: Option<usize>,

    /// Per-job wall time limit (0 disables the limit)
    #[serde(default)]
    pub job_timeout: Option<f64>,

    /// Time allowed between spawning an engine and its handshake
    #[serde(default)]
    pub startup_timeout: Option<f64>,

    /// Idle time after which an engine process is reaped (0 disables reaping)
    #[serde(default)]
    pub idle_timeout: Option<f64>,

    /// Time a cancelled job is given to finish before its process is recycled
    #[serde(default)]
    pub cancel_grace: Option<f64>,

    /// Time a stopping engine is given before it is killed
    #[serde(default)]
    pub shutdown_grace: Option<f64>,
}

impl EngineLimits {
    /// Create new limits with all fields set to their defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset, used as an override table
    pub fn unset() -> Self {
        Self {
            concurrency_limit: None,
            queue_depth: None,
            job_timeout: None,
            startup_timeout: None,
            idle_timeout: None,
            cancel_grace: None,
            shutdown_grace: None,
        }
    }

    /// Set the concurrency limit
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Set the queue depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set the per-job timeout in seconds
    pub fn with_job_timeout(mut self, seconds: f64) -> Self {
        self.job_timeout = Some(seconds);
        self
    }

    /// Set the startup timeout in seconds
    pub fn with_startup_timeout(mut self, seconds: f64) -> Self {
        self.startup_timeout = Some(seconds);
        self
    }

    /// Set the idle timeout in seconds
    pub fn with_idle_timeout(mut self, seconds: f64) -> Self {
        self.idle_timeout = Some(seconds);
        self
    }

    /// Set the cancellation grace period in seconds
    pub fn with_cancel_grace(mut self, seconds: f64) -> Self {
        self.cancel_grace = Some(seconds);
        self
    }

    /// Set the shutdown grace period in seconds
    pub fn with_shutdown_grace(mut self, seconds: f64) -> Self {
        self.shutdown_grace = Some(seconds);
        self
    }

    /// Apply overrides from another EngineLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &EngineLimits) -> EngineLimits {
        EngineLimits {
            concurrency_limit: overrides.concurrency_limit.or(self.concurrency_limit),
            queue_depth: overrides.queue_depth.or(self.queue_depth),
            job_timeout: overrides.job_timeout.or(self.job_timeout),
            startup_timeout: overrides.startup_timeout.or(self.startup_timeout),
            idle_timeout: overrides.idle_timeout.or(self.idle_timeout),
            cancel_grace: overrides.cancel_grace.or(self.cancel_grace),
            shutdown_grace: overrides.shutdown_grace.or(self.shutdown_grace),
        }
    }

    /// Turn these limits into concrete values, filling gaps from the defaults
    pub fn resolve(&self) -> ResolvedLimits {
        let full = EngineLimits::default().with_overrides(self);
        let secs = |value: Option<f64>| value.map(seconds).unwrap_or(Duration::ZERO);
        let optional = |value: Option<f64>| Some(secs(value)).filter(|d| !d.is_zero());

        ResolvedLimits {
            concurrency_limit: full.concurrency_limit.unwrap_or(1).max(1),
            queue_depth: full.queue_depth.filter(|depth| *depth > 0),
            job_timeout: optional(full.job_timeout),
            startup_timeout: secs(full.startup_timeout),
            idle_timeout: optional(full.idle_timeout),
            cancel_grace: secs(full.cancel_grace),
            shutdown_grace: secs(full.shutdown_grace),
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            concurrency_limit: Some(1),
            queue_depth: Some(64),
            job_timeout: Some(0.0),
            startup_timeout: Some(30.0),
            idle_timeout: Some(3600.0),
            cancel_grace: Some(5.0),
            shutdown_grace: Some(5.0),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Concrete limits after defaults and overrides have been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub concurrency_limit: usize,
    pub queue_depth: Option<usize>,
    pub job_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ResolvedLimits {
    fn default() -> Self {
        EngineLimits::default().resolve()
    }
}

/// Who is running code, and on behalf of which collection and scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub owner: String,
    pub collection: String,
    pub scope: String,
}

impl ExecutionContext {
    pub fn new(
        owner: impl Into<String>,
        collection: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            collection: collection.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.collection, self.scope)
    }
}

/// Identifier of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of one engine process incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// What an engine declares it can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Engine emits progress pushes
    #[serde(default = "default_true")]
    pub supports_progress: bool,

    /// Engine honours cancel requests
    #[serde(default = "default_true")]
    pub supports_cancel: bool,

    /// Engine can run several jobs at once in one process
    #[serde(default)]
    pub supports_parallel_jobs: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_progress: true,
            supports_cancel: true,
            supports_parallel_jobs: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A tabular output fragment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One typed piece of job output, in emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Fragment {
    Text(String),
    Table(Table),
    Html(String),
    Error(String),
}

impl Fragment {
    pub fn text(value: impl Into<String>) -> Self {
        Fragment::Text(value.into())
    }
}

/// Terminal state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "SUCCEEDED")]
    Succeeded,

    #[serde(rename = "FAILED")]
    Failed,

    #[serde(rename = "CANCELLED")]
    Cancelled,

    /// The engine or its group went away while the job was outstanding
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code carried by every non-successful result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    StartupTimeout,
    StartupFailure,
    HandshakeRejected,
    TransportError,
    EngineCrash,
    JobTimeout,
    Backpressure,
    Cancelled,
    /// The engine ran the code and reported a failure
    EngineError,
    /// The job's group or binding was torn down
    Teardown,
}

impl ErrorCode {
    /// Terminal job status implied by this reason
    pub fn status(&self) -> JobStatus {
        match self {
            ErrorCode::Cancelled => JobStatus::Cancelled,
            ErrorCode::EngineCrash | ErrorCode::TransportError | ErrorCode::Teardown => {
                JobStatus::Aborted
            }
            ErrorCode::StartupTimeout
            | ErrorCode::StartupFailure
            | ErrorCode::HandshakeRejected
            | ErrorCode::JobTimeout
            | ErrorCode::Backpressure
            | ErrorCode::EngineError => JobStatus::Failed,
        }
    }
}

/// Why a job did not succeed, with whatever diagnostics were available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,

    /// Exit code of the engine process, if it exited
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Last lines the engine wrote to stderr
    #[serde(default)]
    pub stderr_tail: Vec<String>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: None,
            stderr_tail: Vec::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_stderr_tail(mut self, tail: Vec<String>) -> Self {
        self.stderr_tail = tail;
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

/// Result of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,

    pub status: JobStatus,

    /// Output fragments in the order the engine emitted them
    #[serde(default)]
    pub fragments: Vec<Fragment>,

    /// Optional structured payload returned by the engine
    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Set for every status other than SUCCEEDED
    #[serde(default)]
    pub error: Option<JobError>,

    /// Engine process the job ran on, if it got that far
    #[serde(default)]
    pub handle: Option<HandleId>,

    /// Time from dispatch to completion
    #[serde(default)]
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// A result that ended with `error`, its status derived from the error code
    pub fn failed(job_id: JobId, error: JobError) -> Self {
        Self {
            job_id,
            status: error.code.status(),
            fragments: Vec::new(),
            payload: None,
            error: Some(error),
            handle: None,
            elapsed: Duration::ZERO,
        }
    }

    /// A successful result
    pub fn succeeded(job_id: JobId, fragments: Vec<Fragment>) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            fragments,
            payload: None,
            error: None,
            handle: None,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Reason code of a non-successful result
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// All text fragments joined by newlines
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lifecycle state of an engine process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    #[serde(rename = "STARTING")]
    Starting,

    #[serde(rename = "READY")]
    Ready,

    #[serde(rename = "BUSY")]
    Busy,

    #[serde(rename = "DEAD")]
    Dead,
}
