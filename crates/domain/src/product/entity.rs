//! Product entity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, Version};
use serde::{Deserialize, Serialize};

use super::{ProductError, ProductStatus};

/// A sellable product with an integer stock count.
///
/// Stock taken by orders is tracked as holds keyed by the holding order, so
/// reserving or releasing for the same order twice has no further effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    description: String,
    price: Money,
    stock: u32,
    status: ProductStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,

    /// Current version for optimistic concurrency.
    #[serde(default)]
    version: Version,

    /// Quantities currently held for orders.
    #[serde(default)]
    reservations: BTreeMap<OrderId, u32>,
}

// Query methods
impl Product {
    pub fn id(&self) -> &ProductId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn price(&self) -> &Money {
        &self.price
    }

    /// Returns the stock available for new reservations.
    pub fn stock(&self) -> u32 {
        self.stock
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Returns the quantity held for an order, if any.
    pub fn reserved_for(&self, order_id: &OrderId) -> Option<u32> {
        self.reservations.get(order_id).copied()
    }

    /// Returns the total quantity held across all orders.
    pub fn reserved_total(&self) -> u32 {
        self.reservations.values().sum()
    }

    /// Returns true if the product is on sale with at least `quantity` in stock.
    pub fn has_sufficient_stock(&self, quantity: u32) -> bool {
        self.status.is_purchasable() && self.stock >= quantity
    }

    /// Returns true if the hold for `order_id` could be set to `quantity`.
    ///
    /// Units the order already holds count toward the request, so a repeated
    /// reservation succeeds even after it sold the product out.
    pub fn can_reserve(&self, order_id: &OrderId, quantity: u32) -> bool {
        let held = self.reserved_for(order_id).unwrap_or(0);
        quantity <= held || self.has_sufficient_stock(quantity - held)
    }
}

// Command methods
impl Product {
    /// Creates a new product in `Draft` status.
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        description: impl Into<String>,
        price: Money,
        stock: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: description.into(),
            price,
            stock,
            status: ProductStatus::Draft,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
            reservations: BTreeMap::new(),
        }
    }

    /// Makes the product purchasable.
    ///
    /// A product with no stock lands directly in `SoldOut`.
    pub fn put_on_sale(&mut self) -> Result<(), ProductError> {
        self.transition(ProductStatus::OnSale)?;
        self.apply_stock_rule();
        Ok(())
    }

    /// Withdraws the product from sale.
    pub fn take_off_sale(&mut self) -> Result<(), ProductError> {
        self.transition(ProductStatus::OffSale)
    }

    /// Marks the product deleted (terminal).
    pub fn delete(&mut self) -> Result<(), ProductError> {
        self.transition(ProductStatus::Deleted)
    }

    /// Updates the name and description.
    pub fn update_details(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), ProductError> {
        self.ensure_not_deleted()?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ProductError::validation("name", "is required"));
        }
        self.name = name;
        self.description = description.into();
        self.touch();
        Ok(())
    }

    /// Replaces the live price. Existing order lines keep their snapshot.
    pub fn update_price(&mut self, price: Money) -> Result<(), ProductError> {
        self.ensure_not_deleted()?;
        price.validate()?;
        self.price = price;
        self.touch();
        Ok(())
    }

    /// Overwrites the available stock count.
    pub fn set_stock(&mut self, stock: u32) -> Result<(), ProductError> {
        self.ensure_not_deleted()?;
        self.stock = stock;
        self.apply_stock_rule();
        self.touch();
        Ok(())
    }

    /// Adds replenished stock.
    pub fn restock(&mut self, quantity: u32) -> Result<(), ProductError> {
        self.ensure_not_deleted()?;
        self.stock = self.stock.checked_add(quantity).ok_or_else(|| {
            ProductError::validation("stock", format!("restocking {quantity} overflows"))
        })?;
        self.apply_stock_rule();
        self.touch();
        Ok(())
    }

    /// Holds `quantity` units for an order.
    ///
    /// The hold for the order becomes exactly `quantity`: only the difference
    /// to an existing hold is taken from (or given back to) stock. Returns
    /// false when the hold already had that size.
    pub fn reserve(&mut self, order_id: OrderId, quantity: u32) -> Result<bool, ProductError> {
        if quantity == 0 {
            return Err(ProductError::validation(
                "quantity",
                "must be greater than 0",
            ));
        }

        let held = self.reserved_for(&order_id).unwrap_or(0);
        if quantity == held {
            return Ok(false);
        }

        if quantity > held {
            let delta = quantity - held;
            if !self.has_sufficient_stock(delta) {
                return Err(ProductError::InsufficientStock {
                    product_id: self.id.clone(),
                    requested: delta,
                    available: self.stock,
                    status: self.status,
                });
            }
            self.stock -= delta;
        } else {
            self.stock += held - quantity;
        }

        self.reservations.insert(order_id, quantity);
        self.apply_stock_rule();
        self.touch();
        Ok(true)
    }

    /// Returns an order's hold to stock. Returns the released quantity, or
    /// `None` if the order held nothing.
    pub fn release(&mut self, order_id: &OrderId) -> Option<u32> {
        let held = self.reservations.remove(order_id)?;
        self.stock = self.stock.saturating_add(held);
        self.apply_stock_rule();
        self.touch();
        Some(held)
    }

    /// Drops an order's hold without returning it to stock (the sale is final).
    pub fn commit(&mut self, order_id: &OrderId) -> Option<u32> {
        let held = self.reservations.remove(order_id)?;
        self.touch();
        Some(held)
    }

    /// Checks the product is complete and consistent.
    pub fn validate(&self) -> Result<(), ProductError> {
        if self.id.is_empty() {
            return Err(ProductError::validation("id", "is required"));
        }
        if self.name.trim().is_empty() {
            return Err(ProductError::validation("name", "is required"));
        }
        self.price.validate()?;
        if self.updated_at < self.created_at {
            return Err(ProductError::validation(
                "updated_at",
                "cannot be earlier than created_at",
            ));
        }
        Ok(())
    }

    fn transition(&mut self, target: ProductStatus) -> Result<(), ProductError> {
        if !self.status.can_transition_to(target) {
            return Err(ProductError::InvalidStatusTransition {
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.touch();
        Ok(())
    }

    /// Stock depletion forces `SoldOut`; replenishment lifts it back to `OnSale`.
    fn apply_stock_rule(&mut self) {
        match self.status {
            ProductStatus::OnSale if self.stock == 0 => self.status = ProductStatus::SoldOut,
            ProductStatus::SoldOut if self.stock > 0 => self.status = ProductStatus::OnSale,
            _ => {}
        }
    }

    fn ensure_not_deleted(&self) -> Result<(), ProductError> {
        if self.status.is_terminal() {
            return Err(ProductError::Deleted {
                product_id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }
}
