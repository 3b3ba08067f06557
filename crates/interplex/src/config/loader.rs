//! Configuration file loading for Interplex
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Binding, Config, ConfigError};
use crate::types::EngineLimits;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        validate_limits("default_limits", &self.default_limits)?;
        if !self.reap_interval.is_finite() || self.reap_interval < 0.0 {
            return Err(ConfigError::Invalid(
                "reap_interval must be a non-negative number of seconds".to_string(),
            ));
        }

        for (id, binding) in &self.bindings {
            validate_binding(id, binding)?;
        }

        Ok(())
    }
}

/// Validate a single binding definition
pub(crate) fn validate_binding(id: &str, binding: &Binding) -> Result<(), ConfigError> {
    if id.is_empty() {
        return Err(ConfigError::Invalid("binding id is empty".to_string()));
    }
    if binding.name.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "binding '{id}' has empty name"
        )));
    }
    if binding.engine.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "binding '{id}' has empty engine kind"
        )));
    }
    if binding.launch.command.is_empty() || binding.launch.command[0].is_empty() {
        return Err(ConfigError::Invalid(format!(
            "binding '{id}' has empty launch command"
        )));
    }
    if binding.properties.keys().any(|k| k.is_empty()) {
        return Err(ConfigError::Invalid(format!(
            "binding '{id}' has a property with an empty name"
        )));
    }
    if let Some(ref limits) = binding.limits {
        validate_limits(&format!("bindings.{id}.limits"), limits)?;
    }
    Ok(())
}

fn validate_limits(section: &str, limits: &EngineLimits) -> Result<(), ConfigError> {
    let durations = [
        ("job_timeout", limits.job_timeout),
        ("startup_timeout", limits.startup_timeout),
        ("idle_timeout", limits.idle_timeout),
        ("cancel_grace", limits.cancel_grace),
        ("shutdown_grace", limits.shutdown_grace),
    ];
    for (name, value) in durations {
        if let Some(value) = value
            && (!value.is_finite() || value < 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "{section}.{name} must be a non-negative number of seconds"
            )));
        }
    }
    if limits.concurrency_limit == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "{section}.concurrency_limit must be at least 1"
        )));
    }
    Ok(())
}
