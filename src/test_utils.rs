//! Shared test helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::feed::{EventFeed, FeedError, MemoryFeed, Result as FeedResult, Subscription};
use crate::intake::{CommandDispatcher, CommandOutcome};
use crate::types::{CommandRequest, Event, InstanceId, Properties};

/// Object literal to property map; anything else yields an empty map.
pub fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap_or_default()
}

/// Event with an empty payload.
pub fn event(aggregate_type: &str, id: &str, name: &str, sequence: u64) -> Event {
    event_with(aggregate_type, id, name, sequence, Properties::new())
}

pub fn event_with(
    aggregate_type: &str,
    id: &str,
    name: &str,
    sequence: u64,
    payload: Properties,
) -> Event {
    Event {
        aggregate_type: aggregate_type.to_string(),
        instance_id: InstanceId::new(id),
        name: name.to_string(),
        command: String::new(),
        sequence,
        payload,
        correlation_id: None,
        recorded_at: Utc::now(),
    }
}

/// Dispatcher that records every request and answers with a fixed outcome.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: RwLock<Vec<CommandRequest>>,
    outcome: RwLock<Option<CommandOutcome>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every following request with `outcome` instead of success.
    pub async fn set_outcome(&self, outcome: CommandOutcome) {
        *self.outcome.write().await = Some(outcome);
    }

    pub async fn requests(&self) -> Vec<CommandRequest> {
        self.requests.read().await.clone()
    }

    pub async fn commands(&self) -> Vec<String> {
        self.requests
            .read()
            .await
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }
}

#[async_trait]
impl CommandDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: CommandRequest) -> CommandOutcome {
        self.requests.write().await.push(request);
        self.outcome
            .read()
            .await
            .clone()
            .unwrap_or(CommandOutcome::Success(Vec::new()))
    }
}

/// Feed whose publish always fails.
#[derive(Default)]
pub struct FailingFeed;

#[async_trait]
impl EventFeed for FailingFeed {
    async fn publish(&self, _events: &[Event]) -> FeedResult<()> {
        Err(FeedError::Closed)
    }

    async fn subscribe(
        &self,
        _consumer: &str,
        _aggregate_type: &str,
    ) -> FeedResult<Box<dyn Subscription>> {
        Err(FeedError::Closed)
    }
}

/// Memory feed whose publish can be switched to fail.
pub struct SwitchableFeed {
    inner: MemoryFeed,
    failing: AtomicBool,
}

impl SwitchableFeed {
    pub fn new(inner: MemoryFeed) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventFeed for SwitchableFeed {
    async fn publish(&self, events: &[Event]) -> FeedResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedError::Publish("switched off".to_string()));
        }
        self.inner.publish(events).await
    }

    async fn subscribe(
        &self,
        consumer: &str,
        aggregate_type: &str,
    ) -> FeedResult<Box<dyn Subscription>> {
        self.inner.subscribe(consumer, aggregate_type).await
    }
}
