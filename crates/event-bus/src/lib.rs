//! In-process event bus.
//!
//! Events travel as [`EventEnvelope`]s: a name, a timestamp, the id of the
//! aggregate that raised them and a JSON payload. Delivery is fire-and-forget
//! and at-least-once: a handler that fails is queued for redelivery instead of
//! failing the publisher.

pub mod bus;
pub mod error;
pub mod event;
pub mod memory;

pub use bus::{ALL_EVENTS, EventBus, EventHandler};
pub use error::{EventBusError, HandlerError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use memory::InMemoryEventBus;
