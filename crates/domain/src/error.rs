//! Domain error types.

use common::{MoneyError, OrderId, ProductId};
use event_bus::EventBusError;
use thiserror::Error;

use crate::order::OrderError;
use crate::product::ProductError;
use crate::repository::RepositoryError;

/// Errors returned by the order and product services.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error raised by the order aggregate.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// An error raised by the product entity.
    #[error(transparent)]
    Product(#[from] ProductError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    /// A repository call failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Event publication failed.
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// The operation deadline passed before a call returned.
    #[error("Operation timed out: {operation}")]
    Timeout { operation: &'static str },

    /// Another error, annotated with what the service was doing.
    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<DomainError>,
    },
}

/// Root-cause categories callers can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    ValidationFailed,
    InvalidStatusTransition,
    InvalidOrderStatusForPayment,
    InsufficientStock,
    PriceMismatch,
    PaymentAmountMismatch,
    InvalidPaymentInfo,
    CurrencyMismatch,
    Conflict,
    Timeout,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::InvalidStatusTransition => "invalid_status_transition",
            ErrorKind::InvalidOrderStatusForPayment => "invalid_order_status_for_payment",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::PriceMismatch => "price_mismatch",
            ErrorKind::PaymentAmountMismatch => "payment_amount_mismatch",
            ErrorKind::InvalidPaymentInfo => "invalid_payment_info",
            ErrorKind::CurrencyMismatch => "currency_mismatch",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl DomainError {
    /// Wraps this error with operation context.
    pub fn context(self, context: impl Into<String>) -> Self {
        DomainError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping context layers.
    pub fn root(&self) -> &DomainError {
        let mut current = self;
        while let DomainError::Context { source, .. } = current {
            current = source.as_ref();
        }
        current
    }

    /// Returns the root-cause category.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            DomainError::Order(e) => e.kind(),
            DomainError::Product(e) => match e {
                ProductError::InvalidStatusTransition { .. } | ProductError::Deleted { .. } => {
                    ErrorKind::InvalidStatusTransition
                }
                ProductError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
                ProductError::Validation { .. } => ErrorKind::ValidationFailed,
                ProductError::Money(e) => money_kind(e),
            },
            DomainError::Money(e) => money_kind(e),
            DomainError::Repository(e) => match e {
                RepositoryError::NotFound { .. } => ErrorKind::NotFound,
                RepositoryError::AlreadyExists { .. } | RepositoryError::Conflict { .. } => {
                    ErrorKind::Conflict
                }
                RepositoryError::Backend(_) => ErrorKind::Storage,
            },
            DomainError::EventBus(_) => ErrorKind::Storage,
            DomainError::OrderNotFound(_) | DomainError::ProductNotFound(_) => {
                ErrorKind::NotFound
            }
            DomainError::Timeout { .. } => ErrorKind::Timeout,
            // root() never returns a context layer
            DomainError::Context { source, .. } => source.kind(),
        }
    }

    /// Returns true if the root cause has the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }
}

pub(crate) fn money_kind(error: &MoneyError) -> ErrorKind {
    match error {
        MoneyError::CurrencyMismatch { .. } => ErrorKind::CurrencyMismatch,
        MoneyError::InvalidCurrency | MoneyError::InvalidAmount { .. } | MoneyError::Overflow => {
            ErrorKind::ValidationFailed
        }
    }
}

/// Adds operation context to any result whose error converts into [`DomainError`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, DomainError>;

    fn with_context<F>(self, f: F) -> Result<T, DomainError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<DomainError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, DomainError> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T, DomainError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
