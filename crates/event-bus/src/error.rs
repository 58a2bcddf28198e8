use thiserror::Error;

/// Errors that can occur when publishing to or subscribing on the bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The bus could not accept the event.
    #[error("Event bus unavailable: {0}")]
    Unavailable(String),

    /// An envelope was built without a required field.
    #[error("Invalid event envelope: missing {field}")]
    InvalidEnvelope { field: &'static str },

    /// Subscribing with an empty event name.
    #[error("Event name is required to subscribe")]
    EmptyEventName,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by an event handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("failed to decode event payload: {e}"))
    }
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
