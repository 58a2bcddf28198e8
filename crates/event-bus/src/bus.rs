use std::sync::Arc;

use async_trait::async_trait;

use crate::{EventEnvelope, HandlerError, Result};

/// Subscription name that receives every published event.
pub const ALL_EVENTS: &str = "*";

/// A subscriber that reacts to published events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the handler name, used in logs and redelivery bookkeeping.
    fn name(&self) -> &str;

    /// Handles a single event.
    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Publish/subscribe channel for domain events.
///
/// Publishing is best-effort from the caller's point of view: once `publish`
/// returns `Ok` the bus owns delivery. Implementations must be thread-safe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event to every subscriber of its name.
    async fn publish(&self, event: EventEnvelope) -> Result<()>;

    /// Registers a handler for an event name, or [`ALL_EVENTS`].
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()>;
}

#[async_trait]
impl<T: EventBus + ?Sized> EventBus for Arc<T> {
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        (**self).publish(event).await
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        (**self).subscribe(event_type, handler).await
    }
}
