//! In-memory event feed.
//!
//! An append-only log shared by all subscribers, with committed offsets kept
//! per consumer name. Suited to a single process and to tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use super::{type_matches, Delivery, EventFeed, FeedError, Result, Subscription};
use crate::types::Event;

#[derive(Default)]
struct Shared {
    log: RwLock<Vec<Arc<Event>>>,
    committed: RwLock<HashMap<String, u64>>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryFeed {
    shared: Arc<Shared>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting events and wake all waiting subscribers.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        info!("Event feed closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of events published so far.
    pub async fn len(&self) -> usize {
        self.shared.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Offset after the last event `consumer` acknowledged.
    pub async fn committed_offset(&self, consumer: &str) -> u64 {
        self.shared
            .committed
            .read()
            .await
            .get(consumer)
            .copied()
            .unwrap_or(0)
    }

    /// Events matching `aggregate_type` that `consumer` has not acknowledged.
    pub async fn pending(&self, consumer: &str, aggregate_type: &str) -> usize {
        let committed = self.committed_offset(consumer).await as usize;
        let log = self.shared.log.read().await;
        log.iter()
            .skip(committed)
            .filter(|event| type_matches(&event.aggregate_type, aggregate_type))
            .count()
    }
}

#[async_trait]
impl EventFeed for MemoryFeed {
    #[tracing::instrument(name = "feed.publish", skip_all, fields(count = events.len()))]
    async fn publish(&self, events: &[Event]) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        {
            let mut log = self.shared.log.write().await;
            log.extend(events.iter().cloned().map(Arc::new));
            debug!(log_len = log.len(), "Published events");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, consumer: &str, aggregate_type: &str) -> Result<Box<dyn Subscription>> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        let committed = *self
            .shared
            .committed
            .write()
            .await
            .entry(consumer.to_string())
            .or_insert(0);

        info!(
            consumer = %consumer,
            aggregate_type = %aggregate_type,
            offset = committed,
            "Subscribed to event feed"
        );

        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            consumer: consumer.to_string(),
            filter: aggregate_type.to_string(),
            cursor: committed,
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    consumer: String,
    filter: String,
    /// Log index of the next event to inspect.
    cursor: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery> {
        let shared = self.shared.clone();
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = shared.notify.notified();
            if let Some(delivery) = self.poll().await? {
                return Ok(delivery);
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Err(FeedError::Closed);
            }
            notified.await;
        }
    }

    async fn poll(&mut self) -> Result<Option<Delivery>> {
        let log = self.shared.log.read().await;
        while let Some(event) = log.get(self.cursor as usize) {
            let offset = self.cursor;
            self.cursor += 1;
            if type_matches(&event.aggregate_type, &self.filter) {
                return Ok(Some(Delivery {
                    offset,
                    event: event.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut committed = self.shared.committed.write().await;
        let offset = committed.entry(self.consumer.clone()).or_insert(0);
        *offset = (*offset).max(delivery.offset + 1);
        Ok(())
    }

    async fn redeliver(&mut self) -> Result<()> {
        self.cursor = self
            .shared
            .committed
            .read()
            .await
            .get(&self.consumer)
            .copied()
            .unwrap_or(0);
        debug!(consumer = %self.consumer, offset = self.cursor, "Rewound subscription");
        Ok(())
    }
}
