//! Command hooks: external code attached to individual commands.
//!
//! A hook runs before the command's effect. For declarative effects it acts
//! as a preparer (rewrites the payload, e.g. hashing a password); for
//! `compute` commands it is the effect itself and must be registered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{InstanceId, Properties};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The command is not acceptable (bad credentials, invalid payload).
    #[error("{0}")]
    Rejected(String),

    #[error("Hook failed: {0}")]
    Failed(String),
}

/// Read-only view of the instance a hook runs against.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub aggregate_type: &'a str,
    pub instance_id: &'a InstanceId,
    pub command: &'a str,
    pub state: &'a str,
    pub properties: &'a Properties,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutcome {
    /// Prepared payload; replaces the command payload.
    pub payload: Properties,
    /// Property changes computed by the hook.
    pub changes: Properties,
}

impl HookOutcome {
    pub fn prepared(payload: Properties) -> Self {
        Self {
            payload,
            changes: Properties::new(),
        }
    }

    pub fn with_changes(mut self, changes: Properties) -> Self {
        self.changes = changes;
        self
    }
}

#[async_trait]
pub trait CommandHook: Send + Sync {
    async fn execute(
        &self,
        ctx: HookContext<'_>,
        payload: Properties,
    ) -> Result<HookOutcome, HookError>;
}

/// Hooks keyed by (aggregate type, command).
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<(String, String), Arc<dyn CommandHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        aggregate_type: impl Into<String>,
        command: impl Into<String>,
        hook: Arc<dyn CommandHook>,
    ) {
        self.hooks.insert((aggregate_type.into(), command.into()), hook);
    }

    pub fn with(
        mut self,
        aggregate_type: impl Into<String>,
        command: impl Into<String>,
        hook: Arc<dyn CommandHook>,
    ) -> Self {
        self.register(aggregate_type, command, hook);
        self
    }

    pub fn get(&self, aggregate_type: &str, command: &str) -> Option<Arc<dyn CommandHook>> {
        self.hooks
            .get(&(aggregate_type.to_string(), command.to_string()))
            .cloned()
    }

    /// Add every hook of `other`, replacing duplicates.
    pub fn extend(&mut self, other: HookRegistry) {
        self.hooks.extend(other.hooks);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
