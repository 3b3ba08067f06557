use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::scheduler::Scheduler;
use crate::types::{ExecutionContext, ResolvedLimits};

/// How execution contexts of one binding are mapped onto engine processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// One process for every context
    #[default]
    Shared,
    /// One process per collection
    ScopedPerCollection,
    /// One process per owner
    IsolatedPerOwner,
}

impl IsolationPolicy {
    /// Group key a context belongs to under this policy
    pub fn group_key(&self, context: &ExecutionContext) -> GroupKey {
        match self {
            IsolationPolicy::Shared => GroupKey("shared".to_string()),
            IsolationPolicy::ScopedPerCollection => {
                GroupKey(format!("collection:{}", context.collection))
            }
            IsolationPolicy::IsolatedPerOwner => GroupKey(format!("owner:{}", context.owner)),
        }
    }

    /// Whether the group goes away with its last member
    pub fn tears_down_when_empty(&self) -> bool {
        !matches!(self, IsolationPolicy::Shared)
    }
}

impl fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationPolicy::Shared => "shared",
            IsolationPolicy::ScopedPerCollection => "scoped_per_collection",
            IsolationPolicy::IsolatedPerOwner => "isolated_per_owner",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an engine process slot: one binding, one group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleKey {
    pub binding: String,
    pub group: GroupKey,
}

impl HandleKey {
    pub fn new(binding: impl Into<String>, group: GroupKey) -> Self {
        Self {
            binding: binding.into(),
            group,
        }
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.binding, self.group)
    }
}

/// Contexts sharing one engine process, and the queue in front of it
#[derive(Debug)]
pub struct IsolationGroup {
    key: HandleKey,
    policy: IsolationPolicy,
    scheduler: Scheduler,
    members: Mutex<HashSet<ExecutionContext>>,
}

impl IsolationGroup {
    pub fn new(key: HandleKey, policy: IsolationPolicy, limits: &ResolvedLimits) -> Self {
        let scheduler = Scheduler::new(
            key.to_string(),
            limits.concurrency_limit,
            limits.queue_depth,
        );
        Self {
            key,
            policy,
            scheduler,
            members: Mutex::new(HashSet::new()),
        }
    }

    fn members(&self) -> MutexGuard<'_, HashSet<ExecutionContext>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn policy(&self) -> IsolationPolicy {
        self.policy
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Add a member context. Returns false if it was already a member.
    pub fn join(&self, context: &ExecutionContext) -> bool {
        self.members().insert(context.clone())
    }

    /// Remove a member context and return how many remain
    pub fn leave(&self, context: &ExecutionContext) -> usize {
        let mut members = self.members();
        members.remove(context);
        members.len()
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    /// No job is queued or running
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Abort queued jobs and signal running ones
    pub fn close(&self, reason: &str) {
        self.scheduler.close(reason);
    }
}
