//! Domain event trait.

use event_bus::{EventBusError, EventEnvelope};
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the bus name subscribers match on (e.g. "order.created").
    fn event_type(&self) -> &'static str;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Returns the id of the aggregate the event belongs to.
    fn aggregate_id(&self) -> String;

    /// Wraps the event into a bus envelope.
    fn to_envelope(&self) -> Result<EventEnvelope, EventBusError> {
        EventEnvelope::builder()
            .event_type(self.event_type())
            .aggregate_id(self.aggregate_id())
            .aggregate_type(Self::aggregate_type())
            .payload(self)?
            .build()
    }
}
