//! Push-style consumption of a subscription.

use std::sync::Arc;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::{EventHandler, FeedError, Subscription};
use crate::utils::retry::RetryConfig;

/// Drive `handler` with every delivery of `subscription` until the feed
/// closes or `shutdown` flips to true.
///
/// A delivery is acknowledged only after the handler succeeds. On failure the
/// subscription is rewound and the event redelivered after a back-off delay;
/// once the back-off is exhausted the maximum delay is used.
pub fn spawn_consumer(
    name: impl Into<String>,
    mut subscription: Box<dyn Subscription>,
    handler: Arc<dyn EventHandler>,
    redelivery: &RetryConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let name = name.into();
    let backoff_builder = redelivery.backoff();
    let fallback = redelivery.max_delay();

    tokio::spawn(async move {
        info!(consumer = %name, "Starting feed consumer");
        let mut backoff_iter = backoff_builder.build();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };

            let delivery = match next {
                Ok(delivery) => delivery,
                Err(FeedError::Closed) => {
                    info!(consumer = %name, "Feed closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(fallback);
                    error!(consumer = %name, error = %e, backoff_ms = %delay.as_millis(), "Feed read failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let consume_span = tracing::info_span!(
                "feed.consume",
                consumer = %name,
                offset = delivery.offset,
                event = %delivery.event.name,
            );

            match handler
                .handle(Arc::clone(&delivery.event))
                .instrument(consume_span)
                .await
            {
                Ok(()) => {
                    if let Err(e) = subscription.ack(&delivery).await {
                        error!(consumer = %name, error = %e, "Failed to acknowledge delivery");
                    }
                    backoff_iter = backoff_builder.build();
                    debug!(consumer = %name, offset = delivery.offset, "Delivery acknowledged");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(fallback);
                    warn!(
                        consumer = %name,
                        offset = delivery.offset,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Handler failed, redelivering after backoff"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(e) = subscription.redeliver().await {
                        error!(consumer = %name, error = %e, "Failed to rewind subscription");
                    }
                }
            }
        }

        info!(consumer = %name, "Feed consumer stopped");
    })
}
