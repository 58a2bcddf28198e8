//! Order aggregate root.

use chrono::{DateTime, Utc};
use common::{Currency, Money, OrderId, ProductId, UserId, Version};
use serde::{Deserialize, Serialize};

use super::{OrderError, OrderItem, OrderStatus, PaymentInfo};

/// Order aggregate root.
///
/// Owns its items and payment info. `total_amount` is recomputed on every
/// item change and is always in the order currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    currency: Currency,
    items: Vec<OrderItem>,
    total_amount: Money,
    status: OrderStatus,
    payment_info: Option<PaymentInfo>,
    remark: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,

    /// Current version for optimistic concurrency.
    #[serde(default)]
    version: Version,
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// Returns the items in the order they were first added.
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// Returns the line for a product, if any.
    pub fn item(&self, product_id: &ProductId) -> Option<&OrderItem> {
        self.items.iter().find(|i| &i.product_id == product_id)
    }

    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    /// Returns the total quantity across all items.
    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|i| i.quantity).sum()
    }

    pub fn total_amount(&self) -> &Money {
        &self.total_amount
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_info(&self) -> Option<&PaymentInfo> {
        self.payment_info.as_ref()
    }

    pub fn remark(&self) -> &str {
        &self.remark
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn is_paid(&self) -> bool {
        self.status == OrderStatus::Paid
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == OrderStatus::Cancelled
    }
}

// Command methods
impl Order {
    /// Creates an empty order in `Created` status.
    pub fn new(id: OrderId, user_id: UserId, currency: impl Into<Currency>) -> Self {
        let currency = currency.into();
        let now = Utc::now();
        Self {
            id,
            user_id,
            total_amount: Money::zero(currency.clone()),
            currency,
            items: Vec::new(),
            status: OrderStatus::Created,
            payment_info: None,
            remark: String::new(),
            created_at: now,
            updated_at: now,
            paid_at: None,
            version: Version::initial(),
        }
    }

    /// Adds an item to the order.
    ///
    /// If a line for the product already exists its quantity grows instead;
    /// the existing price snapshot is kept.
    pub fn add_item(&mut self, item: OrderItem) -> Result<(), OrderError> {
        self.ensure_items_modifiable("add item")?;
        item.validate()?;
        if item.unit_price.currency() != &self.currency {
            return Err(OrderError::Money(common::MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: item.unit_price.currency().clone(),
            }));
        }

        let mut items = self.items.clone();
        match items.iter_mut().find(|i| i.product_id == item.product_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(item.quantity)
                    .ok_or_else(|| OrderError::validation("quantity", "overflows"))?;
            }
            None => items.push(item),
        }

        self.replace_items(items)
    }

    /// Removes the line for a product and returns it.
    pub fn remove_item(&mut self, product_id: &ProductId) -> Result<OrderItem, OrderError> {
        self.ensure_items_modifiable("remove item")?;
        let index = self
            .items
            .iter()
            .position(|i| &i.product_id == product_id)
            .ok_or_else(|| OrderError::ItemNotFound {
                product_id: product_id.clone(),
            })?;

        let mut items = self.items.clone();
        let removed = items.remove(index);
        self.replace_items(items)?;
        Ok(removed)
    }

    /// Sets the quantity of an existing line. Returns the previous quantity.
    pub fn update_item_quantity(
        &mut self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<u32, OrderError> {
        self.ensure_items_modifiable("update item quantity")?;
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity });
        }

        let mut items = self.items.clone();
        let line = items
            .iter_mut()
            .find(|i| &i.product_id == product_id)
            .ok_or_else(|| OrderError::ItemNotFound {
                product_id: product_id.clone(),
            })?;
        let previous = line.quantity;
        line.quantity = quantity;

        self.replace_items(items)?;
        Ok(previous)
    }

    /// Moves the order to `target` if the state machine allows it.
    ///
    /// Leaves the order untouched on failure.
    pub fn update_status(&mut self, target: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(target) {
            return Err(OrderError::InvalidStatusTransition {
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.touch();
        Ok(())
    }

    /// Accepts a payment for the whole order.
    ///
    /// The amount must equal the total exactly, in value and currency.
    pub fn pay(&mut self, payment: PaymentInfo) -> Result<(), OrderError> {
        if !self.status.can_pay() {
            return Err(OrderError::InvalidOrderStatusForPayment {
                status: self.status,
            });
        }
        payment.validate()?;
        if payment.amount != self.total_amount {
            return Err(OrderError::PaymentAmountMismatch {
                expected: self.total_amount.clone(),
                actual: payment.amount.clone(),
            });
        }

        self.update_status(OrderStatus::Paid)?;
        if self.paid_at.is_none() {
            self.paid_at = Some(self.updated_at);
        }
        self.payment_info = Some(payment);
        Ok(())
    }

    pub fn ship(&mut self) -> Result<(), OrderError> {
        self.update_status(OrderStatus::Shipping)
    }

    pub fn deliver(&mut self) -> Result<(), OrderError> {
        self.update_status(OrderStatus::Delivered)
    }

    /// Cancels the order. Returns the status it was cancelled from.
    pub fn cancel(&mut self) -> Result<OrderStatus, OrderError> {
        let previous = self.status;
        self.update_status(OrderStatus::Cancelled)?;
        Ok(previous)
    }

    pub fn update_remark(&mut self, remark: impl Into<String>) {
        self.remark = remark.into();
        self.touch();
    }

    /// Checks every aggregate invariant. Called before persisting.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.user_id.is_empty() {
            return Err(OrderError::validation("user_id", "is required"));
        }
        if self.currency.is_empty() {
            return Err(OrderError::validation("currency", "is required"));
        }
        if self.items.is_empty() {
            return Err(OrderError::validation(
                "items",
                "at least one item is required",
            ));
        }
        for item in &self.items {
            item.validate()?;
        }
        if Self::sum(&self.currency, &self.items)? != self.total_amount {
            return Err(OrderError::validation(
                "total_amount",
                "does not match the items",
            ));
        }
        if self.status.is_paid_or_later() {
            let payment = self.payment_info.as_ref().ok_or_else(|| {
                OrderError::validation("payment_info", "is required once paid")
            })?;
            payment.validate()?;
            if self.paid_at.is_none() {
                return Err(OrderError::validation("paid_at", "is required once paid"));
            }
        }
        if self.updated_at < self.created_at {
            return Err(OrderError::validation(
                "updated_at",
                "cannot be earlier than created_at",
            ));
        }
        if let Some(paid_at) = self.paid_at {
            if paid_at < self.created_at {
                return Err(OrderError::validation(
                    "paid_at",
                    "cannot be earlier than created_at",
                ));
            }
        }
        Ok(())
    }

    fn ensure_items_modifiable(&self, action: &'static str) -> Result<(), OrderError> {
        if !self.status.can_modify_items() {
            return Err(OrderError::ItemsLocked {
                status: self.status,
                action,
            });
        }
        Ok(())
    }

    /// Swaps in a new item list, recomputing the total first so a failure
    /// leaves the order unchanged.
    fn replace_items(&mut self, items: Vec<OrderItem>) -> Result<(), OrderError> {
        self.total_amount = Self::sum(&self.currency, &items)?;
        self.items = items;
        self.touch();
        Ok(())
    }

    fn sum(currency: &Currency, items: &[OrderItem]) -> Result<Money, OrderError> {
        items
            .iter()
            .try_fold(Money::zero(currency.clone()), |total, item| {
                Ok(total.add(&item.subtotal()?)?)
            })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }
}
