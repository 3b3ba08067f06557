//! A library for hosting out-of-process code execution engines.
//!
//! Interplex launches interpreter engines as child processes, talks to them
//! over a framed JSON channel and routes jobs from many execution contexts to
//! a bounded set of processes according to each binding's isolation policy.
//!
//! # Features
//!
//! - **Process supervision**: on-demand launch, startup handshake with a one-time token, crash detection and idle reaping.
//! - **Isolation policies**: one shared process, one per collection, or one per owner.
//! - **FIFO scheduling**: per-group job queues with bounded concurrency and backpressure.
//! - **Cancellation**: cooperative cancel with process recycling as the fallback.
//! - **TOML configuration**: bindings with command templates, properties and limits.

pub use config::{Binding, Config, ConfigError, EXAMPLE_CONFIG, EngineKind, LaunchSpec};
pub use group::{HandleKey, IsolationPolicy};
pub use host::{HostError, InterpreterHost, JobEvent, JobEventKind};
pub use proxy::InterpreterProxy;
pub use scheduler::{CancelOutcome, JobPhase, JobTicket};
pub use supervisor::{EngineHandle, ProcessSummary};
pub use types::{
    EngineLimits, EngineState, ErrorCode, ExecutionContext, ExecutionResult, Fragment, HandleId,
    JobError, JobId, JobStatus,
};

pub mod config;
pub mod engine;
pub mod group;
pub mod host;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod types;
