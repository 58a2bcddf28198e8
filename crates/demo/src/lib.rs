//! Wiring and scenario for the demo binary.

pub mod config;

use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, ProductId};
use domain::{
    CancelOrder, CreateOrder, CreateProduct, DomainError, ErrorKind, InMemoryOrderRepository,
    InMemoryProductRepository, OrderService, OrderStatus, PayOrder, PaymentChannel, PaymentInfo,
    PaymentMethod, ProductService, ResultExt, ServiceConfig,
};
use event_bus::{ALL_EVENTS, EventBus, EventEnvelope, EventHandler, HandlerError, InMemoryEventBus};
use rust_decimal_macros::dec;

/// Logs every event it receives.
pub struct EventLogger;

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        tracing::info!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            payload = %event.payload,
            "event received"
        );
        Ok(())
    }
}

/// In-memory collaborators shared by the scenario.
#[derive(Clone)]
pub struct App {
    pub orders: OrderService,
    pub bus: InMemoryEventBus,
}

/// Builds the services on in-memory repositories and subscribes the event logger.
pub async fn create_app(config: ServiceConfig) -> Result<App, DomainError> {
    let bus = InMemoryEventBus::new();
    bus.subscribe(ALL_EVENTS, Arc::new(EventLogger)).await?;

    let products = ProductService::new(
        Arc::new(InMemoryProductRepository::new()),
        config.clone(),
    );
    let orders = OrderService::new(
        Arc::new(InMemoryOrderRepository::new()),
        products,
        Arc::new(bus.clone()),
        config,
    );
    Ok(App { orders, bus })
}

/// What the scenario observed at each step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub stock_after_create: u32,
    pub status_after_pay: OrderStatus,
    pub stock_after_cancel: u32,
    pub status_after_cancel: OrderStatus,
    pub oversell_rejected: bool,
    pub events_published: usize,
}

/// Places, pays and cancels one order, then tries to oversell.
#[tracing::instrument(skip(app))]
pub async fn run_scenario(app: &App) -> Result<ScenarioReport, DomainError> {
    let product_id = ProductId::new("SKU-1001");
    let products = app.orders.products();

    products
        .create_product(
            CreateProduct::new("Mechanical keyboard", Money::new(dec!(10.00), "CNY"), 100)
                .with_id(product_id.clone())
                .description("Tenkeyless, brown switches")
                .on_sale(),
        )
        .await
        .context("failed to seed catalogue")?;

    let order = app
        .orders
        .create_order(
            CreateOrder::new("user-42")
                .line(product_id.clone(), 3)
                .remark("demo order"),
        )
        .await?;
    let stock_after_create = products.get_product(&product_id).await?.stock();
    tracing::info!(
        order_id = %order.id(),
        total = %order.total_amount(),
        stock = stock_after_create,
        "order placed"
    );

    let payment = PaymentInfo::new(
        order.total_amount().clone(),
        PaymentMethod::Alipay,
        PaymentChannel::App,
        "2024000000001",
    );
    let paid = app
        .orders
        .pay_order(PayOrder::new(order.id(), payment))
        .await?;

    let outcome = app
        .orders
        .cancel_order(CancelOrder::with_reason(order.id(), "customer request"))
        .await?;
    let stock_after_cancel = products.get_product(&product_id).await?.stock();

    let oversell = app
        .orders
        .create_order(CreateOrder::new("user-7").line(product_id.clone(), 101))
        .await;
    let oversell_rejected = match oversell {
        Err(e) if e.is(ErrorKind::InsufficientStock) => {
            tracing::info!(error = %e, "oversell rejected");
            true
        }
        Err(e) => return Err(e),
        Ok(_) => false,
    };

    Ok(ScenarioReport {
        stock_after_create,
        status_after_pay: paid.status(),
        stock_after_cancel,
        status_after_cancel: outcome.order.status(),
        oversell_rejected,
        events_published: app.bus.published_count().await,
    })
}
