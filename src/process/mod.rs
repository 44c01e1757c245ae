//! Process manager runtime.
//!
//! A process manager is a saga keyed by correlation id (the identity of the
//! source aggregate instance). It reacts to the source's events by moving
//! through its own state graph, updating saga-local flags and emitting
//! commands back to the instance that raised the event.
//!
//! Flow per event:
//! 1. Load the saga instance by correlation id
//! 2. Drop duplicates (sequence at or below the last processed one)
//! 3. Select a transition for the event against flags ∪ event payload
//! 4. Persist the new state, flags and offset
//! 5. Dispatch produced commands; record failures on the instance

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::feed::{EventHandler, FeedError};
use crate::intake::{CommandDispatcher, CommandOutcome};
use crate::model::{ProcessDefinition, TransitionSelection};
use crate::storage::{DispatchFailure, ProcessInstance, ProcessStore, StorageError};
use crate::types::{merge_properties, CommandRequest, Event, InstanceId, Properties};

/// Result type for process manager operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process store error: {0}")]
    Storage(#[from] StorageError),
}

/// What an event did to the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// A transition fired.
    Applied { from: String, to: String },
    /// No handler for the event in the current state.
    Ignored,
    /// Already processed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub outcome: ReactionOutcome,
    /// Commands emitted by the transition, in dispatch order.
    pub commands: Vec<CommandRequest>,
    /// Emitted commands that were not accepted.
    pub failures: Vec<DispatchFailure>,
}

impl Reaction {
    fn without_commands(outcome: ReactionOutcome) -> Self {
        Self {
            outcome,
            commands: Vec::new(),
            failures: Vec::new(),
        }
    }
}

pub struct ProcessManager {
    definition: Arc<ProcessDefinition>,
    store: Arc<dyn ProcessStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl ProcessManager {
    pub fn new(
        definition: Arc<ProcessDefinition>,
        store: Arc<dyn ProcessStore>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            definition,
            store,
            dispatcher,
        }
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    /// Saga instance for a correlation id, if one was ever created.
    pub async fn instance(&self, correlation_id: &InstanceId) -> Result<Option<ProcessInstance>> {
        Ok(self
            .store
            .load(self.definition.name(), correlation_id)
            .await?)
    }

    /// Dispatch failures recorded for a correlation id.
    pub async fn failures(&self, correlation_id: &InstanceId) -> Result<Vec<DispatchFailure>> {
        Ok(self
            .instance(correlation_id)
            .await?
            .map(|instance| instance.failures)
            .unwrap_or_default())
    }

    #[tracing::instrument(
        name = "pm.on_event",
        skip_all,
        fields(process = %self.definition.name(), correlation_id = %event.instance_id, event = %event.name, sequence = event.sequence)
    )]
    pub async fn on_event(&self, event: &Event) -> Result<Reaction> {
        if event.aggregate_type != self.definition.source() {
            return Ok(Reaction::without_commands(ReactionOutcome::Ignored));
        }

        let loaded = self.instance(&event.instance_id).await?;
        if let Some(existing) = &loaded {
            if event.sequence <= existing.last_sequence {
                debug!(last_sequence = existing.last_sequence, "Duplicate event");
                return Ok(Reaction::without_commands(ReactionOutcome::Duplicate));
            }
        }

        let graph = self.definition.graph();
        let current = loaded
            .as_ref()
            .map_or_else(|| graph.initial().to_string(), |i| i.state.clone());
        let flags = loaded
            .as_ref()
            .map_or_else(|| self.definition.initial_flags(), |i| i.flags.clone());

        let mut facts = flags;
        merge_properties(&mut facts, &event.payload);

        let transition = match graph.select_transition(&current, &event.name, &facts) {
            TransitionSelection::Selected { transition, .. } => transition,
            TransitionSelection::NoMatch { .. } | TransitionSelection::Unhandled => {
                // Interest only; an event never creates an instance on its own.
                if let Some(mut existing) = loaded {
                    let expected = existing.version;
                    existing.last_sequence = event.sequence;
                    self.store.save(&existing, expected).await?;
                }
                debug!(state = %current, "No handler for event");
                return Ok(Reaction::without_commands(ReactionOutcome::Ignored));
            }
        };

        let mut instance = loaded.unwrap_or_else(|| {
            ProcessInstance::new(
                self.definition.name(),
                event.instance_id.clone(),
                graph.initial(),
                self.definition.initial_flags(),
            )
        });

        let from = instance.state.clone();
        let to = transition.target.clone().unwrap_or_else(|| from.clone());
        instance.state = to.clone();
        merge_properties(&mut instance.flags, &transition.assign);
        instance.last_sequence = event.sequence;

        let expected = instance.version;
        instance.version = self.store.save(&instance, expected).await?;

        info!(from = %from, to = %to, commands = transition.produce.len(), "Process transition");

        let commands: Vec<CommandRequest> = transition
            .produce
            .iter()
            .map(|command| {
                CommandRequest::new(
                    self.definition.source(),
                    event.instance_id.clone(),
                    command.as_str(),
                    Properties::new(),
                )
                .with_correlation_id(event.instance_id.as_str())
            })
            .collect();

        let failures = self.dispatch_all(&commands, event.sequence).await;
        if !failures.is_empty() {
            instance.failures.extend(failures.iter().cloned());
            let expected = instance.version;
            self.store.save(&instance, expected).await?;
        }

        Ok(Reaction {
            outcome: ReactionOutcome::Applied { from, to },
            commands,
            failures,
        })
    }

    /// Dispatch in order. Failures are recorded, never retried.
    async fn dispatch_all(
        &self,
        commands: &[CommandRequest],
        trigger_sequence: u64,
    ) -> Vec<DispatchFailure> {
        let mut failures = Vec::new();
        for request in commands {
            let (reason, retryable) = match self.dispatcher.dispatch(request.clone()).await {
                CommandOutcome::Success(events) => {
                    debug!(command = %request.command, events = events.len(), "Dispatched command");
                    continue;
                }
                CommandOutcome::Retryable { reason } => (reason, true),
                CommandOutcome::Rejected(reason) => (reason, false),
            };
            warn!(
                command = %request.command,
                retryable,
                error = %reason,
                "Process command failed"
            );
            failures.push(DispatchFailure {
                command: request.command.clone(),
                trigger_sequence,
                reason,
                retryable,
                recorded_at: Utc::now(),
            });
        }
        failures
    }
}

/// Feeds deliveries into a `ProcessManager`.
///
/// Errors leave the delivery unacknowledged, so the consumer redelivers it.
pub struct ProcessManagerHandler {
    manager: Arc<ProcessManager>,
}

impl ProcessManagerHandler {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Self { manager }
    }
}

impl EventHandler for ProcessManagerHandler {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, std::result::Result<(), FeedError>> {
        let manager = self.manager.clone();

        Box::pin(async move {
            manager
                .on_event(&event)
                .await
                .map(|_| ())
                .map_err(|e| FeedError::HandlerFailed {
                    name: manager.definition().name().to_string(),
                    message: e.to_string(),
                })
        })
    }
}
