use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};

use super::*;
use crate::test_utils::event;
use crate::utils::retry::RetryConfig;

#[tokio::test]
async fn test_poll_in_publication_order() {
    let feed = MemoryFeed::new();
    feed.publish(&[event("Account", "a", "Created", 1), event("Account", "a", "Disabled", 2)])
        .await
        .unwrap();

    let mut sub = feed.subscribe("pm", "Account").await.unwrap();
    let first = sub.poll().await.unwrap().unwrap();
    let second = sub.poll().await.unwrap().unwrap();

    assert_eq!(first.event.name, "Created");
    assert_eq!(second.event.name, "Disabled");
    assert!(sub.poll().await.unwrap().is_none());
}

#[tokio::test]
async fn test_subscription_filters_by_type() {
    let feed = MemoryFeed::new();
    feed.publish(&[event("Order", "o", "Placed", 1), event("Account", "a", "Created", 1)])
        .await
        .unwrap();

    let mut accounts = feed.subscribe("pm", "Account").await.unwrap();
    let delivery = accounts.poll().await.unwrap().unwrap();
    assert_eq!(delivery.event.name, "Created");
    assert_eq!(delivery.offset, 1);

    let mut all = feed.subscribe("audit", ALL_TYPES).await.unwrap();
    assert_eq!(all.poll().await.unwrap().unwrap().event.name, "Placed");
}

#[tokio::test]
async fn test_pending_counts_matching_unacked_events() {
    let feed = MemoryFeed::new();
    feed.publish(&[
        event("Account", "a", "Created", 1),
        event("Order", "o", "Placed", 1),
        event("Account", "a", "Disabled", 2),
    ])
    .await
    .unwrap();

    let mut sub = feed.subscribe("pm", "Account").await.unwrap();
    assert_eq!(feed.pending("pm", "Account").await, 2);
    assert_eq!(feed.pending("pm", ALL_TYPES).await, 3);

    let created = sub.poll().await.unwrap().unwrap();
    sub.ack(&created).await.unwrap();
    assert_eq!(feed.pending("pm", "Account").await, 1);

    let disabled = sub.poll().await.unwrap().unwrap();
    sub.ack(&disabled).await.unwrap();
    assert_eq!(feed.pending("pm", "Account").await, 0);
}

#[tokio::test]
async fn test_unacked_events_redelivered() {
    let feed = MemoryFeed::new();
    feed.publish(&[event("Account", "a", "Created", 1), event("Account", "a", "Disabled", 2)])
        .await
        .unwrap();

    let mut sub = feed.subscribe("pm", "Account").await.unwrap();
    let created = sub.poll().await.unwrap().unwrap();
    sub.ack(&created).await.unwrap();
    let _disabled = sub.poll().await.unwrap().unwrap();

    sub.redeliver().await.unwrap();
    assert_eq!(sub.poll().await.unwrap().unwrap().event.name, "Disabled");
}

#[tokio::test]
async fn test_new_subscription_resumes_after_committed_offset() {
    let feed = MemoryFeed::new();
    feed.publish(&[event("Account", "a", "Created", 1), event("Account", "a", "Disabled", 2)])
        .await
        .unwrap();

    {
        let mut sub = feed.subscribe("pm", "Account").await.unwrap();
        let created = sub.poll().await.unwrap().unwrap();
        sub.ack(&created).await.unwrap();
    }
    assert_eq!(feed.committed_offset("pm").await, 1);

    let mut resumed = feed.subscribe("pm", "Account").await.unwrap();
    assert_eq!(resumed.poll().await.unwrap().unwrap().event.name, "Disabled");

    // Other consumers keep their own offsets.
    let mut other = feed.subscribe("audit", "Account").await.unwrap();
    assert_eq!(other.poll().await.unwrap().unwrap().event.name, "Created");
}

#[tokio::test]
async fn test_next_waits_for_publish() {
    let feed = MemoryFeed::new();
    let mut sub = feed.subscribe("pm", "Account").await.unwrap();

    let publisher = feed.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher
            .publish(&[event("Account", "a", "Created", 1)])
            .await
            .unwrap();
    });

    let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.event.name, "Created");
}

#[tokio::test]
async fn test_closed_feed() {
    let feed = MemoryFeed::new();
    feed.publish(&[event("Account", "a", "Created", 1)]).await.unwrap();
    let mut sub = feed.subscribe("pm", "Account").await.unwrap();
    feed.close();

    // Remaining events drain before Closed is reported.
    assert!(sub.next().await.is_ok());
    assert!(matches!(sub.next().await, Err(FeedError::Closed)));
    assert!(matches!(
        feed.publish(&[event("Account", "a", "Disabled", 2)]).await,
        Err(FeedError::Closed)
    ));
    assert!(feed.subscribe("late", "Account").await.is_err());
}

/// Records event names; fails the first `failures` calls.
struct FlakyHandler {
    seen: Arc<Mutex<Vec<String>>>,
    failures: AtomicUsize,
}

impl EventHandler for FlakyHandler {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<()>> {
        let seen = self.seen.clone();
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        async move {
            if fail {
                return Err(FeedError::HandlerFailed {
                    name: "flaky".to_string(),
                    message: format!("rejected {}", event.name),
                });
            }
            seen.lock().await.push(event.name.clone());
            Ok(())
        }
        .boxed()
    }
}

async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, count: usize) {
    for _ in 0..200 {
        if seen.lock().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_consumer_acks_handled_events() {
    let feed = MemoryFeed::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(FlakyHandler {
        seen: seen.clone(),
        failures: AtomicUsize::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sub = feed.subscribe("pm", "Account").await.unwrap();
    let task = spawn_consumer("pm", sub, handler, &RetryConfig::for_test(), shutdown_rx);

    feed.publish(&[event("Account", "a", "Created", 1), event("Account", "a", "Disabled", 2)])
        .await
        .unwrap();
    wait_for(&seen, 2).await;
    for _ in 0..200 {
        if feed.committed_offset("pm").await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(*seen.lock().await, vec!["Created", "Disabled"]);
    assert_eq!(feed.committed_offset("pm").await, 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_consumer_redelivers_after_handler_failure() {
    let feed = MemoryFeed::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(FlakyHandler {
        seen: seen.clone(),
        failures: AtomicUsize::new(2),
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let sub = feed.subscribe("pm", "Account").await.unwrap();
    let task = spawn_consumer("pm", sub, handler, &RetryConfig::for_test(), shutdown_rx);

    feed.publish(&[event("Account", "a", "Created", 1), event("Account", "a", "Disabled", 2)])
        .await
        .unwrap();
    wait_for(&seen, 2).await;

    // Nothing skipped, nothing out of order.
    assert_eq!(*seen.lock().await, vec!["Created", "Disabled"]);

    feed.close();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
