//! Shared kernel for the order and product domain.
//!
//! Holds the value types both the order and product sides agree on:
//! - `Money` and `Currency` with currency-checked arithmetic
//! - Opaque identifiers (`OrderId`, `ProductId`, `UserId`)
//! - `Version` for optimistic concurrency on persisted aggregates

pub mod money;
pub mod types;
pub mod version;

pub use money::{Currency, Money, MoneyError};
pub use types::{OrderId, ProductId, UserId};
pub use version::Version;
