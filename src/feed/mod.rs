//! Event feed: ordered, at-least-once delivery of recorded events.
//!
//! This module contains:
//! - `EventFeed` trait: publish events, open named subscriptions
//! - `Subscription` trait: pull-style consumption with committed offsets
//! - `EventHandler` trait and `spawn_consumer`: push-style consumption
//! - `MemoryFeed`: in-process implementation

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::types::Event;

pub mod consumer;
pub mod memory;

pub use consumer::spawn_consumer;
pub use memory::MemoryFeed;

/// Filter that matches every aggregate type.
pub const ALL_TYPES: &str = "#";

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed is closed")]
    Closed,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler '{name}' failed: {message}")]
    HandlerFailed { name: String, message: String },
}

/// One event handed to a subscriber, positioned in the feed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub offset: u64,
    pub event: Arc<Event>,
}

/// Event publication and subscription.
///
/// Events of one instance are delivered in publication order. Delivery is
/// at least once: anything not acknowledged is seen again after a
/// redelivery or a new subscription under the same consumer name.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn publish(&self, events: &[Event]) -> Result<()>;

    /// Subscribe `consumer` to events of `aggregate_type` (or `ALL_TYPES`),
    /// resuming after its last committed offset.
    async fn subscribe(&self, consumer: &str, aggregate_type: &str) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Fails with `Closed` once the feed is
    /// closed and drained.
    async fn next(&mut self) -> Result<Delivery>;

    /// Next delivery if one is already available.
    async fn poll(&mut self) -> Result<Option<Delivery>>;

    /// Commit everything up to and including `delivery`.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Rewind to the committed offset so unacknowledged events are delivered again.
    async fn redeliver(&mut self) -> Result<()>;
}

/// Handler for push-style consumption.
pub trait EventHandler: Send + Sync {
    /// Process one event. An error leaves it unacknowledged.
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<()>>;
}

pub(crate) fn type_matches(aggregate_type: &str, filter: &str) -> bool {
    filter == ALL_TYPES || aggregate_type == filter
}

#[cfg(test)]
mod tests;
