use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::{
    EventBusError, EventEnvelope, Result,
    bus::{ALL_EVENTS, EventBus, EventHandler},
};

/// A delivery that failed and is waiting to be retried.
struct FailedDelivery {
    envelope: EventEnvelope,
    handler: Arc<dyn EventHandler>,
    attempts: u32,
    last_error: String,
}

/// In-memory event bus.
///
/// Keeps a log of every accepted event, fans each one out to the handlers
/// subscribed to its name (plus [`ALL_EVENTS`] subscribers) and queues
/// failed deliveries for [`InMemoryEventBus::redeliver_failed`].
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>>,
    published: Arc<RwLock<Vec<EventEnvelope>>>,
    failed: Arc<RwLock<VecDeque<FailedDelivery>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryEventBus {
    /// Creates a new bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns every accepted event in publish order.
    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.published.read().await.clone()
    }

    /// Returns the accepted events with the given name.
    pub async fn published_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.published
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the number of accepted events.
    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Returns the number of deliveries waiting for a retry.
    pub async fn pending_redeliveries(&self) -> usize {
        self.failed.read().await.len()
    }

    /// Returns the number of handlers subscribed to a name.
    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Retries every queued delivery once.
    ///
    /// Deliveries that fail again go back on the queue. Returns how many
    /// were delivered on this pass.
    #[tracing::instrument(skip(self))]
    pub async fn redeliver_failed(&self) -> usize {
        let queued: Vec<FailedDelivery> = self.failed.write().await.drain(..).collect();
        let mut delivered = 0;
        let mut still_failing = Vec::new();

        for mut delivery in queued {
            match delivery.handler.handle(&delivery.envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    delivery.attempts += 1;
                    delivery.last_error = e.to_string();
                    tracing::warn!(
                        handler = delivery.handler.name(),
                        event_type = %delivery.envelope.event_type,
                        attempts = delivery.attempts,
                        error = %delivery.last_error,
                        "event redelivery failed"
                    );
                    still_failing.push(delivery);
                }
            }
        }

        self.failed.write().await.extend(still_failing);
        delivered
    }

    async fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().await;
        handlers
            .get(event_type)
            .into_iter()
            .chain(handlers.get(ALL_EVENTS))
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(EventBusError::Unavailable(
                "bus is rejecting events".to_string(),
            ));
        }

        self.published.write().await.push(event.clone());
        metrics::counter!("event_bus_published_total").increment(1);

        let handlers = self.handlers_for(&event.event_type).await;
        let results = join_all(handlers.iter().map(|h| h.handle(&event))).await;

        let mut failed = Vec::new();
        for (handler, result) in handlers.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    handler = handler.name(),
                    error = %e,
                    "event handler failed, queued for redelivery"
                );
                metrics::counter!("event_bus_delivery_failures_total").increment(1);
                failed.push(FailedDelivery {
                    envelope: event.clone(),
                    handler,
                    attempts: 1,
                    last_error: e.to_string(),
                });
            }
        }

        if !failed.is_empty() {
            self.failed.write().await.extend(failed);
        }
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        if event_type.trim().is_empty() {
            return Err(EventBusError::EmptyEventName);
        }
        tracing::debug!(event_type, handler = handler.name(), "handler subscribed");
        self.handlers
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}
