//! Command intake: routes command requests to the handler of their aggregate type.
//!
//! `CommandDispatcher` is the seam process managers emit through; the intake
//! classifies handler results into a `CommandOutcome` for them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tracing::{debug, warn};

use crate::handler::{AggregateHandler, HandlerError, Result};
use crate::types::{CommandRequest, Event, InstanceId, Properties};
use crate::utils::retry::RetryConfig;

/// Outcome of dispatching a single command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Command executed; the recorded events.
    Success(Vec<Event>),
    /// Version conflict. The same command may succeed later.
    Retryable { reason: String },
    /// Non-retryable rejection.
    Rejected(String),
}

impl CommandOutcome {
    pub fn from_result(result: Result<Vec<Event>>) -> Self {
        match result {
            Ok(events) => CommandOutcome::Success(events),
            Err(e) if e.is_retryable() => CommandOutcome::Retryable {
                reason: e.to_string(),
            },
            Err(e) => CommandOutcome::Rejected(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success(_))
    }
}

/// Sends commands to aggregates and classifies the outcome.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, request: CommandRequest) -> CommandOutcome;
}

/// Entry point for commands. Holds one handler per aggregate type.
#[derive(Default)]
pub struct CommandIntake {
    handlers: HashMap<String, Arc<AggregateHandler>>,
}

impl CommandIntake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route commands for the handler's aggregate type to it, replacing any
    /// handler registered earlier for that type.
    pub fn register(&mut self, handler: Arc<AggregateHandler>) {
        let name = handler.model().name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(aggregate_type = %name, "Replaced aggregate handler");
        }
    }

    pub fn with_handler(mut self, handler: Arc<AggregateHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn handler(&self, aggregate_type: &str) -> Option<&Arc<AggregateHandler>> {
        self.handlers.get(aggregate_type)
    }

    /// Registered aggregate type names, sorted.
    pub fn aggregate_types(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn submit(
        &self,
        aggregate_type: &str,
        instance_id: InstanceId,
        command: &str,
        payload: Properties,
    ) -> Result<Vec<Event>> {
        self.submit_request(CommandRequest::new(
            aggregate_type,
            instance_id,
            command,
            payload,
        ))
        .await
    }

    pub async fn submit_request(&self, request: CommandRequest) -> Result<Vec<Event>> {
        let handler = self
            .handlers
            .get(&request.aggregate_type)
            .ok_or_else(|| HandlerError::UnknownAggregateType(request.aggregate_type.clone()))?;
        handler.execute(request).await
    }

    /// Submit, retrying `ConcurrentModification` with exponential backoff.
    ///
    /// Any other error is returned at once. A pinned `expected_version` is
    /// kept on every attempt.
    pub async fn submit_with_retry(
        &self,
        request: CommandRequest,
        retry: &RetryConfig,
    ) -> Result<Vec<Event>> {
        let mut delays = retry.backoff().build();
        let mut attempt = 0u32;

        loop {
            match self.submit_request(request.clone()).await {
                Err(e) if e.is_retryable() => match delays.next() {
                    Some(delay) => {
                        debug!(attempt, error = %e, "Version conflict, retrying command");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(attempt, error = %e, "Command retries exhausted");
                        return Err(e);
                    }
                },
                other => return other,
            }
        }
    }

    /// Republish, for every aggregate type, events whose publication failed.
    /// Returns how many events went out.
    pub async fn republish_pending(&self) -> usize {
        let mut published = 0;
        for handler in self.handlers.values() {
            match handler.republish_pending().await {
                Ok(count) => published += count,
                Err(e) => {
                    warn!(aggregate_type = %handler.model().name(), error = %e, "Republishing failed")
                }
            }
        }
        published
    }

    /// Instances, across all aggregate types, holding unpublished events.
    pub async fn unpublished_count(&self) -> Result<usize> {
        let mut count = 0;
        for handler in self.handlers.values() {
            count += handler.unpublished_count().await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl CommandDispatcher for CommandIntake {
    async fn dispatch(&self, request: CommandRequest) -> CommandOutcome {
        CommandOutcome::from_result(self.submit_request(request).await)
    }
}
