use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::group::IsolationPolicy;
use crate::types::{Capabilities, EngineLimits, ExecutionContext};

const INVALID_ENGINE_KIND_CHARS: [char; 3] = ['/', ' ', '\t'];

/// Configuration for one engine binding: how to launch it and how to share it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Human-readable name for the binding (e.g., "Calculator")
    pub name: String,

    /// Engine kind served by this binding
    pub engine: EngineKind,

    /// How contexts map onto engine processes
    #[serde(default)]
    pub policy: IsolationPolicy,

    /// How to start the engine process
    pub launch: LaunchSpec,

    /// What the engine declares it supports
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Properties handed to the engine at handshake.
    /// Values may use the same placeholders as the launch command.
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Limits for this binding (overrides defaults)
    #[serde(default)]
    pub limits: Option<EngineLimits>,
}

impl Binding {
    /// Create a binding with default capabilities and no limit overrides
    pub fn new(
        name: impl Into<String>,
        engine: EngineKind,
        policy: IsolationPolicy,
        launch: LaunchSpec,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            policy,
            launch,
            capabilities: Capabilities::default(),
            properties: HashMap::new(),
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Properties with placeholders expanded
    pub fn expanded_properties(&self, vars: &Placeholders<'_>) -> HashMap<String, String> {
        self.properties
            .iter()
            .map(|(key, value)| (key.clone(), vars.expand(value)))
            .collect()
    }
}

/// Engine kind identifier (e.g., "calc")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EngineKind(String);

impl EngineKind {
    pub fn new(kind: &str) -> Result<Self, ConfigError> {
        let contains_invalid = kind
            .chars()
            .any(|c| INVALID_ENGINE_KIND_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidEngineKind);
        }
        Ok(Self(kind.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for EngineKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EngineKind::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"an engine kind without '/' or whitespace",
            )
        })
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to launch an engine process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Program and arguments with placeholders
    /// Placeholders: {callback}, {token}, {binding}, {group}, {owner}, {collection}
    pub command: Vec<String>,

    /// Environment variables to set for the engine
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory (inherits the host's if not set)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], vars: &Placeholders<'_>) -> Vec<String> {
        command.iter().map(|arg| vars.expand(arg)).collect()
    }
}

/// Values substituted into launch commands, environment and properties
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    pub callback: &'a str,
    pub token: &'a str,
    pub binding: &'a str,
    pub group: &'a str,
    pub context: &'a ExecutionContext,
}

impl Placeholders<'_> {
    pub fn expand(&self, value: &str) -> String {
        value
            .replace("{callback}", self.callback)
            .replace("{token}", self.token)
            .replace("{binding}", self.binding)
            .replace("{group}", self.group)
            .replace("{owner}", &self.context.owner)
            .replace("{collection}", &self.context.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(context: &ExecutionContext) -> Placeholders<'_> {
        Placeholders {
            callback: "127.0.0.1:4000",
            token: "tok",
            binding: "calc",
            group: "shared",
            context,
        }
    }

    #[test]
    fn engine_kind_new_valid() {
        let kind = EngineKind::new("spark-sql").unwrap();
        assert_eq!(kind.to_string(), "spark-sql");
    }

    #[test]
    fn engine_kind_rejects_slash() {
        assert!(EngineKind::new("a/b").is_err());
    }

    #[test]
    fn engine_kind_rejects_whitespace() {
        assert!(EngineKind::new("a b").is_err());
        assert!(EngineKind::new("a\tb").is_err());
    }

    #[test]
    fn engine_kind_is_empty() {
        assert!(EngineKind::new("").unwrap().is_empty());
        assert!(!EngineKind::new("calc").unwrap().is_empty());
    }

    #[test]
    fn expand_command_callback_and_token() {
        let ctx = ExecutionContext::new("alice", "note1", "p1");
        let cmd = vec![
            "engine".to_owned(),
            "--connect".to_owned(),
            "{callback}".to_owned(),
            "--token={token}".to_owned(),
        ];
        let result = LaunchSpec::expand_command(&cmd, &vars(&ctx));
        assert_eq!(
            result,
            vec!["engine", "--connect", "127.0.0.1:4000", "--token=tok"]
        );
    }

    #[test]
    fn expand_command_context_placeholders() {
        let ctx = ExecutionContext::new("alice", "note1", "p1");
        let cmd = vec!["--user={owner}".to_owned(), "{collection}-{group}".to_owned()];
        let result = LaunchSpec::expand_command(&cmd, &vars(&ctx));
        assert_eq!(result, vec!["--user=alice", "note1-shared"]);
    }

    #[test]
    fn expand_command_no_placeholders() {
        let ctx = ExecutionContext::new("alice", "note1", "p1");
        let cmd = vec!["echo".to_owned(), "hello".to_owned()];
        let result = LaunchSpec::expand_command(&cmd, &vars(&ctx));
        assert_eq!(result, vec!["echo", "hello"]);
    }

    #[test]
    fn expand_command_empty() {
        let ctx = ExecutionContext::new("alice", "note1", "p1");
        let result = LaunchSpec::expand_command(&[], &vars(&ctx));
        assert!(result.is_empty());
    }

    #[test]
    fn expanded_properties_substitute_owner() {
        let ctx = ExecutionContext::new("bob", "note9", "p1");
        let binding = Binding::new(
            "Test",
            EngineKind::new("calc").unwrap(),
            IsolationPolicy::IsolatedPerOwner,
            LaunchSpec::new(vec!["engine".to_owned()]),
        )
        .with_property("user.name", "{owner}")
        .with_property("plain", "value");

        let props = binding.expanded_properties(&vars(&ctx));
        assert_eq!(props["user.name"], "bob");
        assert_eq!(props["plain"], "value");
    }
}
