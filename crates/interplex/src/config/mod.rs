use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::binding::{Binding, EngineKind, LaunchSpec, Placeholders};
pub(crate) use crate::config::loader::validate_binding;
use crate::types::{EngineLimits, ResolvedLimits};

pub mod binding;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../interplex.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid characters in engine kind")]
    InvalidEngineKind,

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("binding '{0}' not found in configuration")]
    BindingNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Interplex
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the host listens on for engine callbacks.
    ///
    /// Each launch binds a fresh ephemeral port on this address and hands it
    /// to the engine together with a one-time token.
    #[serde(default = "default_callback_host")]
    pub callback_host: IpAddr,

    /// Seconds between idle-reaper sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval: f64,

    /// How many times a launch rejected at handshake is retried
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,

    /// Number of engine stderr lines kept for crash diagnostics
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    /// Default limits applied to all bindings.
    /// A binding's own `limits` table overrides individual values.
    #[serde(default)]
    pub default_limits: EngineLimits,

    /// Engine bindings keyed by binding ID
    #[serde(default)]
    pub bindings: HashMap<String, Binding>,
}

impl Config {
    /// Create a new config with the embedded example bindings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no bindings
    pub fn empty() -> Self {
        Self {
            callback_host: default_callback_host(),
            reap_interval: default_reap_interval(),
            handshake_retries: default_handshake_retries(),
            stderr_tail_lines: default_stderr_tail_lines(),
            default_limits: EngineLimits::default(),
            bindings: HashMap::new(),
        }
    }

    /// Add or replace a binding
    pub fn with_binding(mut self, id: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(id.into(), binding);
        self
    }

    /// Get a binding by ID
    pub fn get_binding(&self, id: &str) -> Result<&Binding, ConfigError> {
        self.bindings
            .get(id)
            .ok_or_else(|| ConfigError::BindingNotFound(id.to_string()))
    }

    /// Merge a binding's limits with the defaults
    ///
    /// Engines that cannot interleave jobs always get a concurrency limit of 1.
    pub fn effective_limits(&self, binding: &Binding) -> ResolvedLimits {
        let limits = match binding.limits {
            Some(ref overrides) => self.default_limits.with_overrides(overrides),
            None => self.default_limits.clone(),
        };
        let mut resolved = limits.resolve();
        if !binding.capabilities.supports_parallel_jobs {
            resolved.concurrency_limit = 1;
        }
        resolved
    }

    /// Interval between idle-reaper sweeps
    pub fn reap_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.reap_interval)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_reap_interval()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded example config should be valid")
    }
}

fn default_callback_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_reap_interval() -> f64 {
    30.0
}

fn default_handshake_retries() -> u32 {
    2
}

fn default_stderr_tail_lines() -> usize {
    50
}
