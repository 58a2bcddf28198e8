//! Value objects for the order domain.

use common::{Money, MoneyError, ProductId};
use serde::{Deserialize, Serialize};

use super::OrderError;

/// A line of an order.
///
/// The unit price is a snapshot taken when the line was added and does not
/// follow later changes to the product's live price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// The product identifier.
    pub product_id: ProductId,

    /// Human-readable product name.
    pub product_name: String,

    /// Quantity ordered.
    pub quantity: u32,

    /// Price per unit at order time.
    pub unit_price: Money,
}

impl OrderItem {
    /// Creates a new order item.
    pub fn new(
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns `unit_price * quantity`.
    pub fn subtotal(&self) -> Result<Money, MoneyError> {
        self.unit_price.multiply(self.quantity)
    }

    /// Checks the line is complete: ids and name set, quantity and price positive.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.product_id.is_empty() {
            return Err(OrderError::validation("product_id", "is required"));
        }
        if self.product_name.trim().is_empty() {
            return Err(OrderError::validation("product_name", "is required"));
        }
        if self.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                quantity: self.quantity,
            });
        }
        self.unit_price.validate()?;
        if !self.unit_price.is_positive() {
            return Err(OrderError::InvalidPrice {
                price: self.unit_price.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(quantity: u32, price: Money) -> OrderItem {
        OrderItem::new("SKU-001", "Widget", quantity, price)
    }

    #[test]
    fn test_subtotal() {
        let line = item(3, Money::new(dec!(10.00), "CNY"));
        assert_eq!(line.subtotal().unwrap(), Money::new(dec!(30.00), "CNY"));
    }

    #[test]
    fn test_valid_item() {
        assert!(item(1, Money::new(dec!(0.01), "CNY")).validate().is_ok());
    }

    #[test]
    fn test_zero_quantity_fails() {
        let err = item(0, Money::new(dec!(1), "CNY")).validate().unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity { quantity: 0 }));
    }

    #[test]
    fn test_zero_price_fails() {
        let err = item(1, Money::zero("CNY")).validate().unwrap_err();
        assert!(matches!(err, OrderError::InvalidPrice { .. }));
    }

    #[test]
    fn test_missing_name_fails() {
        let line = OrderItem::new("SKU-001", "  ", 1, Money::new(dec!(1), "CNY"));
        assert!(matches!(
            line.validate(),
            Err(OrderError::Validation {
                field: "product_name",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_product_id_fails() {
        let line = OrderItem::new("", "Widget", 1, Money::new(dec!(1), "CNY"));
        assert!(matches!(
            line.validate(),
            Err(OrderError::Validation {
                field: "product_id",
                ..
            })
        ));
    }
}
