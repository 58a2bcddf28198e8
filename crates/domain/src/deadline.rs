//! Deadlines for repository and stock calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::DomainError;

/// The point in time by which a service operation must finish.
///
/// Every awaited repository or stock call of the operation goes through
/// [`Deadline::run`], so the whole operation shares one time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now, or none when `timeout` is `None`.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            expires_at: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    /// Returns the time left, or `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// Awaits `future`, failing with [`DomainError::Timeout`] if the deadline passes first.
    pub async fn run<F, T, E>(&self, operation: &'static str, future: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<DomainError>,
    {
        match self.expires_at {
            None => future.await.map_err(Into::into),
            Some(at) => match tokio::time::timeout_at(at, future).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => {
                    tracing::warn!(operation, "operation deadline exceeded");
                    metrics::counter!("operation_timeouts_total", "operation" => operation)
                        .increment(1);
                    Err(DomainError::Timeout { operation })
                }
            },
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}
