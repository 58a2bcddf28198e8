//! Order domain events.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, UserId};
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

use super::{Order, OrderItem, OrderStatus, PaymentInfo};

/// Events published by the order service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order was placed and its stock reserved.
    OrderCreated(OrderCreatedData),

    /// Item was added to a placed order.
    OrderItemAdded(ItemAddedData),

    /// Item was removed from a placed order.
    OrderItemRemoved(ItemRemovedData),

    /// Payment was accepted.
    OrderPaid(OrderPaidData),

    /// Order was cancelled.
    OrderCancelled(OrderCancelledData),

    /// Order moved from one status to another.
    OrderStatusChanged(StatusChangedData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "order.created",
            OrderEvent::OrderItemAdded(_) => "order.item.added",
            OrderEvent::OrderItemRemoved(_) => "order.item.removed",
            OrderEvent::OrderPaid(_) => "order.paid",
            OrderEvent::OrderCancelled(_) => "order.canceled",
            OrderEvent::OrderStatusChanged(_) => "order.status.changed",
        }
    }

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn aggregate_id(&self) -> String {
        self.order_id().to_string()
    }
}

impl OrderEvent {
    /// Returns the order this event belongs to.
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::OrderCreated(d) => d.order_id,
            OrderEvent::OrderItemAdded(d) => d.order_id,
            OrderEvent::OrderItemRemoved(d) => d.order_id,
            OrderEvent::OrderPaid(d) => d.order_id,
            OrderEvent::OrderCancelled(d) => d.order_id,
            OrderEvent::OrderStatusChanged(d) => d.order_id,
        }
    }

    pub fn created(order: &Order) -> Self {
        OrderEvent::OrderCreated(OrderCreatedData {
            order_id: order.id(),
            user_id: order.user_id().clone(),
            items: order.items().to_vec(),
            total_amount: order.total_amount().clone(),
            created_at: order.created_at(),
        })
    }

    /// `added` is the line as submitted; the order holds the merged line.
    pub fn item_added(order: &Order, added: &OrderItem) -> Self {
        OrderEvent::OrderItemAdded(ItemAddedData {
            order_id: order.id(),
            product_id: added.product_id.clone(),
            product_name: added.product_name.clone(),
            quantity: added.quantity,
            unit_price: added.unit_price.clone(),
            total_amount: order.total_amount().clone(),
        })
    }

    pub fn item_removed(order: &Order, removed: &OrderItem) -> Self {
        OrderEvent::OrderItemRemoved(ItemRemovedData {
            order_id: order.id(),
            product_id: removed.product_id.clone(),
            quantity: removed.quantity,
            total_amount: order.total_amount().clone(),
        })
    }

    pub fn paid(order: &Order, payment: &PaymentInfo) -> Self {
        OrderEvent::OrderPaid(OrderPaidData {
            order_id: order.id(),
            user_id: order.user_id().clone(),
            payment: payment.clone(),
            paid_at: order.paid_at().unwrap_or(payment.payment_time),
        })
    }

    pub fn cancelled(order: &Order, previous_status: OrderStatus, reason: Option<String>) -> Self {
        OrderEvent::OrderCancelled(OrderCancelledData {
            order_id: order.id(),
            user_id: order.user_id().clone(),
            previous_status,
            reason,
            cancelled_at: order.updated_at(),
        })
    }

    pub fn status_changed(order: &Order, from: OrderStatus) -> Self {
        OrderEvent::OrderStatusChanged(StatusChangedData {
            order_id: order.id(),
            from,
            to: order.status(),
            changed_at: order.updated_at(),
        })
    }
}

/// Data for OrderCreated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
}

/// Data for OrderItemAdded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAddedData {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,

    /// Quantity added by this change.
    pub quantity: u32,

    pub unit_price: Money,

    /// Order total after the change.
    pub total_amount: Money,
}

/// Data for OrderItemRemoved event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRemovedData {
    pub order_id: OrderId,
    pub product_id: ProductId,

    /// Quantity of the removed line.
    pub quantity: u32,

    /// Order total after the change.
    pub total_amount: Money,
}

/// Data for OrderPaid event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPaidData {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment: PaymentInfo,
    pub paid_at: DateTime<Utc>,
}

/// Data for OrderCancelled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: OrderId,
    pub user_id: UserId,

    /// Status the order was cancelled from.
    pub previous_status: OrderStatus,

    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

/// Data for OrderStatusChanged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangedData {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub changed_at: DateTime<Utc>,
}
