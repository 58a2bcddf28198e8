//! Product status state machine.

use serde::{Deserialize, Serialize};

/// The sales status of a product.
///
/// State transitions:
/// ```text
/// Draft ──► OnSale ◄──► OffSale
///   │         ▲ │          │
///   │         │ ▼          │
///   │       SoldOut        │
///   │         │            │
///   └─────────┴──► Deleted ◄┘   (OnSale ──► Deleted as well)
/// ```
/// `SoldOut` is entered and left automatically as stock hits zero or is
/// replenished; it is never requested by a caller directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    /// Product is being prepared and cannot be bought.
    #[default]
    Draft,

    /// Product is purchasable.
    OnSale,

    /// Product was withdrawn from sale.
    OffSale,

    /// Stock is depleted.
    SoldOut,

    /// Product was removed (terminal state).
    Deleted,
}

impl ProductStatus {
    /// Returns true if the product can move from this status to `target`.
    pub fn can_transition_to(&self, target: ProductStatus) -> bool {
        use ProductStatus::*;
        matches!(
            (self, target),
            (Draft, OnSale)
                | (Draft, Deleted)
                | (OnSale, OffSale)
                | (OnSale, SoldOut)
                | (OnSale, Deleted)
                | (OffSale, OnSale)
                | (OffSale, Deleted)
                | (SoldOut, OnSale)
                | (SoldOut, Deleted)
        )
    }

    /// Returns true if orders can reserve stock in this status.
    pub fn is_purchasable(&self) -> bool {
        matches!(self, ProductStatus::OnSale)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProductStatus::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::OnSale => "on_sale",
            ProductStatus::OffSale => "off_sale",
            ProductStatus::SoldOut => "sold_out",
            ProductStatus::Deleted => "deleted",
        }
    }

    /// All statuses, in declaration order.
    pub fn all() -> [ProductStatus; 5] {
        [
            ProductStatus::Draft,
            ProductStatus::OnSale,
            ProductStatus::OffSale,
            ProductStatus::SoldOut,
            ProductStatus::Deleted,
        ]
    }
}

impl std::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
