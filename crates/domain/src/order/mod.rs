//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod payment;
mod repository;
mod service;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::*;
pub use events::{
    ItemAddedData, ItemRemovedData, OrderCancelledData, OrderCreatedData, OrderEvent,
    OrderPaidData, StatusChangedData,
};
pub use payment::{PaymentChannel, PaymentInfo, PaymentInfoError, PaymentMethod};
pub use repository::{InMemoryOrderRepository, OrderRepository};
pub use service::{CancelOutcome, OrderService};
pub use state::OrderStatus;
pub use value_objects::OrderItem;

use common::{Money, MoneyError, ProductId};
use thiserror::Error;

use crate::config::CancellationPolicy;
use crate::error::{ErrorKind, money_kind};

/// Errors raised by the order aggregate.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The status change is not an edge of the order state machine.
    #[error("Invalid order status transition: {from} -> {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    /// Payment is only accepted for orders in `Created` status.
    #[error("Order cannot be paid in {status} status")]
    InvalidOrderStatusForPayment { status: OrderStatus },

    /// The configured cancellation policy rejects this status.
    #[error("Order cannot be cancelled in {status} status (policy: {policy})")]
    CancellationNotAllowed {
        status: OrderStatus,
        policy: CancellationPolicy,
    },

    /// Items can only change while the order is `Created`.
    #[error("Cannot {action} in {status} status")]
    ItemsLocked {
        status: OrderStatus,
        action: &'static str,
    },

    /// Stock can only be released again for cancelled orders.
    #[error("Stock release requires a cancelled order, found {status}")]
    NotCancelled { status: OrderStatus },

    /// Item not found in order.
    #[error("Item not found: {product_id}")]
    ItemNotFound { product_id: ProductId },

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// Invalid price.
    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: Money },

    /// The captured unit price no longer matches the product.
    #[error("Price mismatch for product {product_id}: expected {expected}, got {actual}")]
    PriceMismatch {
        product_id: ProductId,
        expected: Money,
        actual: Money,
    },

    /// The paid amount differs from the order total.
    #[error("Payment amount mismatch: expected {expected}, got {actual}")]
    PaymentAmountMismatch { expected: Money, actual: Money },

    #[error("Invalid payment info: {0}")]
    InvalidPaymentInfo(#[from] PaymentInfoError),

    /// A field failed validation.
    #[error("Invalid order {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl OrderError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        OrderError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Returns the root-cause category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidStatusTransition { .. }
            | OrderError::CancellationNotAllowed { .. }
            | OrderError::ItemsLocked { .. }
            | OrderError::NotCancelled { .. } => ErrorKind::InvalidStatusTransition,
            OrderError::InvalidOrderStatusForPayment { .. } => {
                ErrorKind::InvalidOrderStatusForPayment
            }
            OrderError::ItemNotFound { .. } => ErrorKind::NotFound,
            OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. }
            | OrderError::Validation { .. } => ErrorKind::ValidationFailed,
            OrderError::PriceMismatch { .. } => ErrorKind::PriceMismatch,
            OrderError::PaymentAmountMismatch { .. } => ErrorKind::PaymentAmountMismatch,
            OrderError::InvalidPaymentInfo(_) => ErrorKind::InvalidPaymentInfo,
            OrderError::Money(e) => money_kind(e),
        }
    }
}
