//! Order commands.

use common::{Money, OrderId, ProductId, UserId};

use super::PaymentInfo;

/// One requested line of a new order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,

    /// Unit price the client saw. When set it must equal the live price.
    pub unit_price: Option<Money>,
}

impl OrderLine {
    /// A line priced at the product's live price.
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price: None,
        }
    }

    /// A line carrying the unit price captured by the client.
    pub fn at_price(product_id: impl Into<ProductId>, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price: Some(unit_price),
        }
    }
}

/// Command to place a new order.
///
/// `order_id` doubles as the idempotency key: retrying the same command
/// returns the order already placed instead of placing a second one.
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    pub remark: String,
}

impl CreateOrder {
    /// Creates a command with a generated order ID and no lines.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self::with_id(OrderId::new(), user_id)
    }

    pub fn with_id(order_id: OrderId, user_id: impl Into<UserId>) -> Self {
        Self {
            order_id,
            user_id: user_id.into(),
            lines: Vec::new(),
            remark: String::new(),
        }
    }

    /// Appends a line priced at the live product price.
    pub fn line(mut self, product_id: impl Into<ProductId>, quantity: u32) -> Self {
        self.lines.push(OrderLine::new(product_id, quantity));
        self
    }

    /// Appends a line with a client-captured unit price.
    pub fn line_at_price(
        mut self,
        product_id: impl Into<ProductId>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        self.lines
            .push(OrderLine::at_price(product_id, quantity, unit_price));
        self
    }

    pub fn remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }
}

/// Command to pay an order.
#[derive(Debug, Clone)]
pub struct PayOrder {
    pub order_id: OrderId,
    pub payment: PaymentInfo,
}

impl PayOrder {
    pub fn new(order_id: OrderId, payment: PaymentInfo) -> Self {
        Self { order_id, payment }
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: Option<String>,
}

impl CancelOrder {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            reason: None,
        }
    }

    pub fn with_reason(order_id: OrderId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: Some(reason.into()),
        }
    }
}

/// Command to hand a paid order to the carrier.
#[derive(Debug, Clone)]
pub struct ShipOrder {
    pub order_id: OrderId,
}

impl ShipOrder {
    pub fn new(order_id: OrderId) -> Self {
        Self { order_id }
    }
}

/// Command to mark a shipped order delivered.
#[derive(Debug, Clone)]
pub struct DeliverOrder {
    pub order_id: OrderId,
}

impl DeliverOrder {
    pub fn new(order_id: OrderId) -> Self {
        Self { order_id }
    }
}

/// Command to add a line to an unpaid order.
#[derive(Debug, Clone)]
pub struct AddItem {
    pub order_id: OrderId,
    pub line: OrderLine,
}

impl AddItem {
    pub fn new(order_id: OrderId, line: OrderLine) -> Self {
        Self { order_id, line }
    }
}

/// Command to remove a line from an unpaid order.
#[derive(Debug, Clone)]
pub struct RemoveItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
}

impl RemoveItem {
    pub fn new(order_id: OrderId, product_id: impl Into<ProductId>) -> Self {
        Self {
            order_id,
            product_id: product_id.into(),
        }
    }
}

/// Command to replace an order's remark.
#[derive(Debug, Clone)]
pub struct UpdateRemark {
    pub order_id: OrderId,
    pub remark: String,
}

impl UpdateRemark {
    pub fn new(order_id: OrderId, remark: impl Into<String>) -> Self {
        Self {
            order_id,
            remark: remark.into(),
        }
    }
}
