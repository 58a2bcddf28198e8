//! Product entity, stock state machine, repository and service.

mod entity;
mod repository;
mod service;
mod state;

pub use entity::Product;
pub use repository::{InMemoryProductRepository, ProductRepository};
pub use service::{CreateProduct, ProductService, UpdateProduct};
pub use state::ProductStatus;

use common::{MoneyError, ProductId};
use thiserror::Error;

/// Errors raised by the product entity.
#[derive(Debug, Error)]
pub enum ProductError {
    /// The requested status change is not an edge of the product graph.
    #[error("Invalid product status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: ProductStatus,
        to: ProductStatus,
    },

    /// Not enough purchasable stock for a reservation.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available} ({status})"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
        status: ProductStatus,
    },

    /// The product was deleted and can no longer change.
    #[error("Product {product_id} is deleted")]
    Deleted { product_id: ProductId },

    /// A field failed validation.
    #[error("Invalid product {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl ProductError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        ProductError::Validation {
            field,
            reason: reason.into(),
        }
    }
}
