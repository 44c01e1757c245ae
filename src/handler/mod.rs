//! Aggregate handler: executes commands against one aggregate type.
//!
//! Pipeline per command (load → resolve state → hook → effect → transition →
//! append → publish). Produced commands run in the same unit of work and
//! everything is written with a single atomic append.

pub mod hooks;
mod locks;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::feed::EventFeed;
use crate::model::{AggregateType, CommandKind, Effect, ModelError, TransitionSelection};
use crate::storage::{AggregateInstance, Commit, InstanceStore, StorageError};
use crate::types::{merge_properties, CommandRequest, Event, InstanceId, Properties};

pub use hooks::{CommandHook, HookContext, HookError, HookOutcome, HookRegistry};
use locks::InstanceLocks;

/// Default bound on chains of produced commands.
pub const DEFAULT_MAX_PRODUCE_DEPTH: usize = 16;

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Instance not found: {aggregate_type}/{id}")]
    NotFound {
        aggregate_type: String,
        id: InstanceId,
    },

    #[error("Instance already exists: {aggregate_type}/{id}")]
    DuplicateCreate {
        aggregate_type: String,
        id: InstanceId,
    },

    #[error("Command '{command}' not allowed in state '{state}'")]
    CommandNotAllowedInState { command: String, state: String },

    #[error("Unknown command '{command}' for aggregate type '{aggregate_type}'")]
    UnknownCommand {
        aggregate_type: String,
        command: String,
    },

    #[error("Unknown aggregate type '{0}'")]
    UnknownAggregateType(String),

    #[error("Concurrent modification: expected version {expected}, actual {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("Command '{command}' rejected in state '{state}': {reason}")]
    GuardEvaluation {
        command: String,
        state: String,
        reason: String,
    },

    #[error("Produced command '{command}' exceeds depth limit {limit}")]
    ProduceDepthExceeded { command: String, limit: usize },

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl HandlerError {
    /// Only version conflicts can succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::ConcurrentModification { .. })
    }
}

impl From<StorageError> for HandlerError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::ConcurrentModification { expected, actual } => {
                HandlerError::ConcurrentModification { expected, actual }
            }
            other => HandlerError::Storage(other),
        }
    }
}

/// Result of applying one command to the working copy.
struct Step {
    event: Event,
    produce: Vec<String>,
}

pub struct AggregateHandler {
    model: Arc<AggregateType>,
    store: Arc<dyn InstanceStore>,
    feed: Arc<dyn EventFeed>,
    hooks: HookRegistry,
    locks: InstanceLocks,
    max_produce_depth: usize,
}

impl AggregateHandler {
    /// Fails with `MissingHook` if a `compute` command has no hook.
    pub fn new(
        model: Arc<AggregateType>,
        store: Arc<dyn InstanceStore>,
        feed: Arc<dyn EventFeed>,
        hooks: HookRegistry,
    ) -> std::result::Result<Self, ModelError> {
        for command in model.commands() {
            if command.effect == Effect::Compute && hooks.get(model.name(), &command.name).is_none() {
                return Err(ModelError::MissingHook {
                    command: command.name.clone(),
                });
            }
        }
        Ok(Self {
            model,
            store,
            feed,
            hooks,
            locks: InstanceLocks::default(),
            max_produce_depth: DEFAULT_MAX_PRODUCE_DEPTH,
        })
    }

    pub fn with_max_produce_depth(mut self, depth: usize) -> Self {
        self.max_produce_depth = depth;
        self
    }

    pub fn model(&self) -> &Arc<AggregateType> {
        &self.model
    }

    /// Current snapshot of an instance.
    pub async fn load(&self, id: &InstanceId) -> Result<Option<AggregateInstance>> {
        Ok(self.store.load(self.model.name(), id).await?)
    }

    pub async fn handle(
        &self,
        id: &InstanceId,
        command: &str,
        payload: Properties,
    ) -> Result<Vec<Event>> {
        self.execute(CommandRequest::new(
            self.model.name(),
            id.clone(),
            command,
            payload,
        ))
        .await
    }

    /// Run a command and everything it produces; returns the recorded events.
    #[tracing::instrument(
        name = "aggregate.execute",
        skip_all,
        fields(aggregate_type = %self.model.name(), instance_id = %request.instance_id, command = %request.command)
    )]
    pub async fn execute(&self, request: CommandRequest) -> Result<Vec<Event>> {
        if request.aggregate_type != self.model.name() {
            return Err(HandlerError::UnknownAggregateType(request.aggregate_type));
        }
        let command = self
            .model
            .command(&request.command)
            .ok_or_else(|| self.unknown_command(&request.command))?;

        let _guard = self.locks.acquire(&request.instance_id).await;

        let loaded = self
            .store
            .load(self.model.name(), &request.instance_id)
            .await?;

        if let Some(expected) = request.expected_version {
            let actual = loaded.as_ref().map_or(0, |i| i.version);
            if actual != expected {
                return Err(HandlerError::ConcurrentModification { expected, actual });
            }
        }

        let mut work = self.starting_point(&request.instance_id, command.kind, loaded)?;
        let base_version = work.version;
        let correlation_id = request.correlation_id.as_deref();

        let mut events = Vec::new();
        let mut queue = VecDeque::from([(request.command, request.payload, 0usize)]);
        while let Some((command, payload, depth)) = queue.pop_front() {
            if depth > self.max_produce_depth {
                return Err(HandlerError::ProduceDepthExceeded {
                    command,
                    limit: self.max_produce_depth,
                });
            }
            let step = self.apply(&mut work, &command, payload, correlation_id).await?;
            events.push(step.event);
            queue.extend(
                step.produce
                    .into_iter()
                    .map(|produced| (produced, Properties::new(), depth + 1)),
            );
        }

        let version = self
            .store
            .append(Commit {
                aggregate_type: work.aggregate_type.clone(),
                instance_id: work.id.clone(),
                expected_version: base_version,
                state: work.state.clone(),
                properties: work.properties.clone(),
                events: events.clone(),
            })
            .await?;

        info!(
            version,
            state = %work.state,
            events = events.len(),
            "Command executed"
        );

        self.flush(&work.id).await;

        Ok(events)
    }

    /// Publish everything recorded for `id` but not yet published, oldest
    /// first, then advance the store's publication mark. Failures leave the
    /// events for `republish_pending`. Callers hold the instance lock.
    async fn flush(&self, id: &InstanceId) -> usize {
        let pending = match self.store.unpublished(self.model.name(), id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Failed to read unpublished events");
                return 0;
            }
        };
        let Some(last) = pending.last().map(|e| e.sequence) else {
            return 0;
        };

        if let Err(e) = self.feed.publish(&pending).await {
            warn!(instance_id = %id, error = %e, "Failed to publish events, left for recovery");
            return 0;
        }
        // A failed mark republishes these later; delivery is at least once.
        if let Err(e) = self.store.mark_published(self.model.name(), id, last).await {
            warn!(instance_id = %id, error = %e, "Failed to mark events published");
        }
        pending.len()
    }

    /// Publish events whose earlier publication failed. Returns how many
    /// events went out.
    #[tracing::instrument(name = "aggregate.republish", skip_all, fields(aggregate_type = %self.model.name()))]
    pub async fn republish_pending(&self) -> Result<usize> {
        let mut published = 0;
        for id in self.store.unpublished_ids(self.model.name()).await? {
            let _guard = self.locks.acquire(&id).await;
            published += self.flush(&id).await;
        }
        if published > 0 {
            info!(events = published, "Republished pending events");
        }
        Ok(published)
    }

    /// Instances with recorded events that have not been published yet.
    pub async fn unpublished_count(&self) -> Result<usize> {
        Ok(self.store.unpublished_ids(self.model.name()).await?.len())
    }

    /// Every instance of this aggregate type, ordered by id.
    pub async fn list(&self) -> Result<Vec<AggregateInstance>> {
        Ok(self.store.list(self.model.name()).await?)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.count(self.model.name()).await?)
    }

    pub async fn exists(&self, id: &InstanceId) -> Result<bool> {
        Ok(self.store.exists(self.model.name(), id).await?)
    }

    /// Recorded events of an instance with sequence greater than `after`.
    pub async fn events(&self, id: &InstanceId, after: u64) -> Result<Vec<Event>> {
        Ok(self.store.events(self.model.name(), id, after).await?)
    }

    /// Instance the unit of work starts from, honouring create semantics.
    fn starting_point(
        &self,
        id: &InstanceId,
        kind: CommandKind,
        loaded: Option<AggregateInstance>,
    ) -> Result<AggregateInstance> {
        match (kind, loaded) {
            (CommandKind::Create, None) => Ok(self.fresh_instance(id, 0)),
            (CommandKind::Create, Some(existing)) => {
                if self.model.allow_recreate() && self.model.graph().is_terminal(&existing.state) {
                    debug!(previous_state = %existing.state, "Recreating terminal instance");
                    Ok(self.fresh_instance(id, existing.version))
                } else {
                    Err(HandlerError::DuplicateCreate {
                        aggregate_type: self.model.name().to_string(),
                        id: id.clone(),
                    })
                }
            }
            (_, None) => Err(HandlerError::NotFound {
                aggregate_type: self.model.name().to_string(),
                id: id.clone(),
            }),
            (_, Some(existing)) => Ok(existing),
        }
    }

    fn fresh_instance(&self, id: &InstanceId, version: u64) -> AggregateInstance {
        AggregateInstance {
            aggregate_type: self.model.name().to_string(),
            id: id.clone(),
            state: self.model.graph().initial().to_string(),
            version,
            properties: self.model.initial_properties(),
        }
    }

    async fn apply(
        &self,
        work: &mut AggregateInstance,
        command: &str,
        payload: Properties,
        correlation_id: Option<&str>,
    ) -> Result<Step> {
        let def = self
            .model
            .command(command)
            .ok_or_else(|| self.unknown_command(command))?;
        let graph = self.model.graph();

        if graph.resolve_command(&work.state, command).is_none() {
            return Err(HandlerError::CommandNotAllowedInState {
                command: command.to_string(),
                state: work.state.clone(),
            });
        }

        let rejected = |reason: String| HandlerError::GuardEvaluation {
            command: command.to_string(),
            state: work.state.clone(),
            reason,
        };

        if def.restricts_payload() {
            if let Some(unexpected) = payload.keys().find(|key| !def.accepts(key)) {
                return Err(rejected(format!("unexpected parameter '{unexpected}'")));
            }
        }

        let outcome = match self.hooks.get(self.model.name(), command) {
            Some(hook) => {
                let ctx = HookContext {
                    aggregate_type: self.model.name(),
                    instance_id: &work.id,
                    command,
                    state: &work.state,
                    properties: &work.properties,
                };
                hook.execute(ctx, payload)
                    .await
                    .map_err(|e| rejected(e.to_string()))?
            }
            None => HookOutcome::prepared(payload),
        };

        let mut changes = outcome.changes;
        match &def.effect {
            Effect::Merge => {
                let mut merged = outcome.payload.clone();
                merge_properties(&mut merged, &changes);
                changes = merged;
            }
            Effect::Assign(values) => merge_properties(&mut changes, values),
            Effect::Record | Effect::Compute => {}
        }

        let mut proposed = work.properties.clone();
        merge_properties(&mut proposed, &changes);

        // A create records the defaults its guards saw, so consumers of the
        // event select the same transitions.
        let mut event_payload = match def.kind {
            CommandKind::Create => work.properties.clone(),
            _ => Properties::new(),
        };
        merge_properties(&mut event_payload, &outcome.payload);
        merge_properties(&mut event_payload, &changes);

        let event_name = def.event.as_str();
        let transition = match graph.select_transition(&work.state, event_name, &proposed) {
            TransitionSelection::Selected { transition, .. } => transition,
            TransitionSelection::NoMatch { declared_in } => {
                return Err(rejected(format!(
                    "no guard on '{event_name}' in '{}' matches",
                    declared_in.name
                )))
            }
            TransitionSelection::Unhandled => {
                return Err(rejected(format!("no handler for '{event_name}'")))
            }
        };
        merge_properties(&mut proposed, &transition.assign);

        let from = std::mem::take(&mut work.state);
        work.state = transition.target.clone().unwrap_or_else(|| from.clone());
        work.version += 1;
        work.properties = proposed;

        debug!(
            event = %event_name,
            from = %from,
            to = %work.state,
            sequence = work.version,
            "Applied command"
        );

        Ok(Step {
            event: Event {
                aggregate_type: work.aggregate_type.clone(),
                instance_id: work.id.clone(),
                name: event_name.to_string(),
                command: command.to_string(),
                sequence: work.version,
                payload: event_payload,
                correlation_id: correlation_id.map(str::to_string),
                recorded_at: Utc::now(),
            },
            produce: transition.produce.clone(),
        })
    }

    fn unknown_command(&self, command: &str) -> HandlerError {
        HandlerError::UnknownCommand {
            aggregate_type: self.model.name().to_string(),
            command: command.to_string(),
        }
    }
}
