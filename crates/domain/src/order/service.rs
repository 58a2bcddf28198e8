//! Order service: places, pays, cancels and fulfils orders.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use common::{OrderId, ProductId, UserId};
use event_bus::{EventBus, EventEnvelope};
use tokio::sync::Mutex;

use crate::config::ServiceConfig;
use crate::deadline::Deadline;
use crate::error::{DomainError, ResultExt};
use crate::event::DomainEvent;
use crate::product::{Product, ProductError, ProductService};
use crate::repository::RepositoryError;
use crate::reservation::{
    HoldResolution, ReconcileFailure, ReconcileReport, ReleaseReport, ReservationSaga,
    StrandedHold, release_holds,
};

use super::{
    AddItem, CancelOrder, CreateOrder, DeliverOrder, Order, OrderError, OrderEvent, OrderItem,
    OrderLine, OrderRepository, OrderStatus, PayOrder, RemoveItem, ShipOrder, UpdateRemark,
};

/// Result of a cancellation.
///
/// The order is cancelled even when some holds could not be released;
/// those are listed in `releases` and can be retried with
/// [`OrderService::retry_stock_release`].
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order: Order,
    pub releases: ReleaseReport,
}

impl CancelOutcome {
    pub fn is_fully_released(&self) -> bool {
        self.releases.is_complete()
    }
}

/// Service for managing orders.
///
/// Coordinates the order repository, the product service (for stock) and
/// the event bus. Events that the bus rejects are kept and can be sent again
/// with [`OrderService::republish_pending`]; a failed publish never undoes
/// the change that produced it.
///
/// Stock holds that could not be brought in line with their order (a
/// failed release, commit or restore) are queued and settled by
/// [`OrderService::reconcile_stock`].
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    products: ProductService,
    bus: Arc<dyn EventBus>,
    config: ServiceConfig,
    pending_events: Arc<Mutex<Vec<EventEnvelope>>>,
    stranded: Arc<Mutex<BTreeSet<StrandedHold>>>,
}

impl OrderService {
    /// Creates a new order service.
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        products: ProductService,
        bus: Arc<dyn EventBus>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            orders,
            products,
            bus,
            config,
            pending_events: Arc::new(Mutex::new(Vec::new())),
            stranded: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Returns the product service used for stock.
    pub fn products(&self) -> &ProductService {
        &self.products
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Places an order.
    ///
    /// Every line is checked against the live product (existence, price,
    /// stock), then stock is reserved line by line. The order is stored
    /// only once every reservation succeeded; any failure before that
    /// releases what was reserved. Repeating a command with the same
    /// `order_id` returns the stored order.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, user_id = %cmd.user_id))]
    pub async fn create_order(&self, cmd: CreateOrder) -> Result<Order, DomainError> {
        let started = Instant::now();
        let order_id = cmd.order_id;
        let result = self.place_order(cmd).await;
        record_duration("create", started);
        result.with_context(|| format!("failed to create order {order_id}"))
    }

    async fn place_order(&self, cmd: CreateOrder) -> Result<Order, DomainError> {
        let deadline = self.config.deadline();

        if let Some(existing) = self.find_order(cmd.order_id, &deadline).await? {
            return self.replayed(existing, &cmd.user_id);
        }
        if cmd.lines.is_empty() {
            return Err(OrderError::validation("items", "at least one item is required").into());
        }

        let mut order = Order::new(cmd.order_id, cmd.user_id, self.config.currency.clone());
        order.update_remark(cmd.remark);

        let mut products: HashMap<ProductId, Product> = HashMap::new();
        for line in &cmd.lines {
            let product = match products.get(&line.product_id) {
                Some(product) => product.clone(),
                None => {
                    self.products
                        .get_product_within(&line.product_id, &deadline)
                        .await?
                }
            };
            check_price(line, &product)?;
            order.add_item(snapshot(&product, line.quantity))?;

            // Repeated lines are checked against their merged quantity.
            let requested = order
                .item(product.id())
                .map_or(line.quantity, |i| i.quantity);
            if !product.can_reserve(&order.id(), requested) {
                return Err(ProductError::InsufficientStock {
                    product_id: product.id().clone(),
                    requested,
                    available: product.stock(),
                    status: product.status(),
                }
                .into());
            }
            products.insert(product.id().clone(), product);
        }
        order.validate()?;

        let mut saga = ReservationSaga::new(&self.products, order.id());
        if let Err(e) = saga.reserve_all(order.items(), &deadline).await {
            self.strand_failures(order.id(), saga.report()).await;
            return Err(e);
        }

        match deadline.run("save order", self.orders.save(&order)).await {
            Ok(version) => order.set_version(version),
            Err(e) => {
                // The write may have landed (timeout) or raced a retry of the same command.
                let recheck = self.config.deadline();
                if let Ok(Some(stored)) = self.find_order(order.id(), &recheck).await {
                    if stored.user_id() == order.user_id() {
                        tracing::info!(error = %e, "order already stored, keeping reservations");
                        return Ok(stored);
                    }
                }
                tracing::warn!(error = %e, "order save failed, releasing reserved stock");
                let report = saga.compensate().await;
                self.strand_failures(order.id(), &report).await;
                return Err(e);
            }
        }

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(
            total = %order.total_amount(),
            items = order.items().len(),
            "order created"
        );
        self.publish(vec![OrderEvent::created(&order)]).await;
        Ok(order)
    }

    fn replayed(&self, existing: Order, user_id: &UserId) -> Result<Order, DomainError> {
        if existing.user_id() != user_id {
            return Err(RepositoryError::AlreadyExists {
                entity: "Order",
                id: existing.id().to_string(),
            }
            .into());
        }
        tracing::info!(order_id = %existing.id(), "order already placed, returning stored order");
        Ok(existing)
    }

    /// Accepts payment for an order in `Created` status.
    ///
    /// The amount must equal the order total exactly. Stock is not touched.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn pay_order(&self, cmd: PayOrder) -> Result<Order, DomainError> {
        let started = Instant::now();
        let order_id = cmd.order_id;
        let result: Result<Order, DomainError> = async {
            let deadline = self.config.deadline();
            let mut order = self.load_order(cmd.order_id, &deadline).await?;
            let from = order.status();

            order.pay(cmd.payment.clone())?;
            self.persist(&mut order, &deadline).await?;

            metrics::counter!("orders_paid_total").increment(1);
            tracing::info!(
                amount = %cmd.payment.amount,
                method = %cmd.payment.method,
                trade_no = %cmd.payment.trade_no,
                "order paid"
            );
            self.publish(vec![
                OrderEvent::paid(&order, &cmd.payment),
                OrderEvent::status_changed(&order, from),
            ])
            .await;
            Ok(order)
        }
        .await;
        record_duration("pay", started);
        result.with_context(|| format!("failed to pay order {order_id}"))
    }

    /// Cancels an order and returns its held stock.
    ///
    /// The cancelled status is stored first; holds are released afterwards,
    /// one product at a time. Release failures do not fail the call.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn cancel_order(&self, cmd: CancelOrder) -> Result<CancelOutcome, DomainError> {
        let started = Instant::now();
        let order_id = cmd.order_id;
        let result: Result<CancelOutcome, DomainError> = async {
            let deadline = self.config.deadline();
            let mut order = self.load_order(cmd.order_id, &deadline).await?;

            let policy = self.config.cancellation_policy;
            if !policy.allows(order.status()) {
                return Err(OrderError::CancellationNotAllowed {
                    status: order.status(),
                    policy,
                }
                .into());
            }

            let previous = order.cancel()?;
            self.persist(&mut order, &deadline).await?;
            metrics::counter!("orders_cancelled_total").increment(1);
            tracing::info!(from = %previous, "order cancelled");

            let releases = self.release_order_stock(&order).await;

            self.publish(vec![
                OrderEvent::cancelled(&order, previous, cmd.reason.clone()),
                OrderEvent::status_changed(&order, previous),
            ])
            .await;
            Ok(CancelOutcome { order, releases })
        }
        .await;
        record_duration("cancel", started);
        result.with_context(|| format!("failed to cancel order {order_id}"))
    }

    /// Releases whatever stock a cancelled order still holds.
    #[tracing::instrument(skip(self))]
    pub async fn retry_stock_release(&self, order_id: OrderId) -> Result<ReleaseReport, DomainError> {
        let order = self.load_order(order_id, &self.config.deadline()).await?;
        if !order.is_cancelled() {
            return Err(OrderError::NotCancelled {
                status: order.status(),
            })
            .context(format!("failed to release stock for order {order_id}"));
        }
        Ok(self.release_order_stock(&order).await)
    }

    /// Releases the holds of the order's lines and any stranded holds it
    /// left behind on products it no longer references.
    async fn release_order_stock(&self, order: &Order) -> ReleaseReport {
        let mut product_ids: BTreeSet<ProductId> =
            order.items().iter().map(|i| i.product_id.clone()).collect();
        product_ids.extend(
            self.stranded
                .lock()
                .await
                .iter()
                .filter(|h| h.order_id == order.id())
                .map(|h| h.product_id.clone()),
        );

        let report = release_holds(
            &self.products,
            order.id(),
            product_ids,
            &self.config.deadline(),
        )
        .await;

        {
            let failed: BTreeSet<&ProductId> = report.failed_products().collect();
            let mut stranded = self.stranded.lock().await;
            stranded.retain(|h| h.order_id != order.id() || failed.contains(&h.product_id));
        }
        self.strand_failures(order.id(), &report).await;

        if !report.is_complete() {
            tracing::warn!(
                order_id = %order.id(),
                failed = report.failures.len(),
                "stock release incomplete, retry with retry_stock_release"
            );
        }
        report
    }

    /// Moves a paid order to `Shipping`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn ship_order(&self, cmd: ShipOrder) -> Result<Order, DomainError> {
        self.advance(cmd.order_id, "ship", Order::ship).await
    }

    /// Moves a shipped order to `Delivered` and makes its stock holds final.
    ///
    /// A commit that fails is queued for [`Self::reconcile_stock`].
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn deliver_order(&self, cmd: DeliverOrder) -> Result<Order, DomainError> {
        let order = self.advance(cmd.order_id, "deliver", Order::deliver).await?;

        let deadline = self.config.deadline();
        for item in order.items() {
            if let Err(e) = self
                .products
                .commit_stock_within(&item.product_id, order.id(), &deadline)
                .await
            {
                metrics::counter!("stock_commit_failures_total").increment(1);
                self.strand(order.id(), item.product_id.clone(), &e.to_string())
                    .await;
            }
        }
        Ok(order)
    }

    async fn advance(
        &self,
        order_id: OrderId,
        action: &'static str,
        transition: fn(&mut Order) -> Result<(), OrderError>,
    ) -> Result<Order, DomainError> {
        let result: Result<Order, DomainError> = async {
            let deadline = self.config.deadline();
            let mut order = self.load_order(order_id, &deadline).await?;
            let from = order.status();

            transition(&mut order)?;
            self.persist(&mut order, &deadline).await?;

            tracing::info!(%from, to = %order.status(), "order status changed");
            self.publish(vec![OrderEvent::status_changed(&order, from)])
                .await;
            Ok(order)
        }
        .await;
        result.with_context(|| format!("failed to {action} order {order_id}"))
    }

    /// Adds a line to an unpaid order, growing its stock hold.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, product_id = %cmd.line.product_id))]
    pub async fn add_item(&self, cmd: AddItem) -> Result<Order, DomainError> {
        let order_id = cmd.order_id;
        let result: Result<Order, DomainError> = async {
            let deadline = self.config.deadline();
            let mut order = self.load_order(order_id, &deadline).await?;
            if !order.status().can_modify_items() {
                return Err(OrderError::ItemsLocked {
                    status: order.status(),
                    action: "add item",
                }
                .into());
            }

            let product = self
                .products
                .get_product_within(&cmd.line.product_id, &deadline)
                .await?;
            check_price(&cmd.line, &product)?;

            let added = snapshot(&product, cmd.line.quantity);
            order.add_item(added.clone())?;
            let quantity = order
                .item(product.id())
                .map_or(added.quantity, |i| i.quantity);
            order.validate()?;

            self.products
                .reserve_stock_within(product.id(), order_id, quantity, &deadline)
                .await?;

            if let Err(e) = self.persist(&mut order, &deadline).await {
                // The stored order may have moved on; match the hold to it.
                self.settle_hold(order_id, product.id().clone()).await;
                return Err(e);
            }

            tracing::info!(quantity = added.quantity, "item added");
            self.publish(vec![OrderEvent::item_added(&order, &added)])
                .await;
            Ok(order)
        }
        .await;
        result.with_context(|| format!("failed to add item to order {order_id}"))
    }

    /// Removes a line from an unpaid order and releases its hold.
    ///
    /// If the release fails the hold is queued and released later by
    /// [`Self::reconcile_stock`] or a cancellation.
    ///
    /// The last line cannot be removed; cancel the order instead.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, product_id = %cmd.product_id))]
    pub async fn remove_item(&self, cmd: RemoveItem) -> Result<Order, DomainError> {
        let order_id = cmd.order_id;
        let result: Result<Order, DomainError> = async {
            let deadline = self.config.deadline();
            let mut order = self.load_order(order_id, &deadline).await?;

            let removed = order.remove_item(&cmd.product_id)?;
            self.persist(&mut order, &deadline).await?;

            if let Err(e) = self
                .products
                .release_stock_within(&cmd.product_id, order_id, &deadline)
                .await
            {
                metrics::counter!("stock_compensation_failures_total").increment(1);
                self.strand(order_id, cmd.product_id.clone(), &e.to_string())
                    .await;
            }

            tracing::info!(quantity = removed.quantity, "item removed");
            self.publish(vec![OrderEvent::item_removed(&order, &removed)])
                .await;
            Ok(order)
        }
        .await;
        result.with_context(|| format!("failed to remove item from order {order_id}"))
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn update_remark(&self, cmd: UpdateRemark) -> Result<Order, DomainError> {
        let deadline = self.config.deadline();
        let mut order = self.load_order(cmd.order_id, &deadline).await?;
        order.update_remark(cmd.remark);
        self.persist(&mut order, &deadline)
            .await
            .with_context(|| format!("failed to update remark of order {}", cmd.order_id))?;
        Ok(order)
    }

    /// Loads an order; fails with `OrderNotFound` if absent.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, DomainError> {
        self.load_order(order_id, &self.config.deadline()).await
    }

    /// Lists a user's orders, oldest first. Unknown users have no orders.
    #[tracing::instrument(skip(self))]
    pub async fn list_user_orders(&self, user_id: &UserId) -> Result<Vec<Order>, DomainError> {
        let found = self
            .config
            .deadline()
            .run("list orders", self.orders.find_by_user_id(user_id))
            .await;
        empty_if_not_found(found)
    }

    /// Lists a user's orders in one status, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_user_orders_with_status(
        &self,
        user_id: &UserId,
        status: OrderStatus,
    ) -> Result<Vec<Order>, DomainError> {
        let found = self
            .config
            .deadline()
            .run(
                "list orders",
                self.orders.find_by_user_id_and_status(user_id, status),
            )
            .await;
        empty_if_not_found(found)
    }

    /// Checks a status change against the order state machine without touching any order.
    pub fn validate_status_transition(
        &self,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), DomainError> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(OrderError::InvalidStatusTransition { from, to }.into())
        }
    }

    /// Returns the number of events waiting to be published again.
    pub async fn pending_event_count(&self) -> usize {
        self.pending_events.lock().await.len()
    }

    /// Publishes the events the bus rejected earlier. Returns how many went out.
    #[tracing::instrument(skip(self))]
    pub async fn republish_pending(&self) -> usize {
        let pending: Vec<EventEnvelope> = self.pending_events.lock().await.drain(..).collect();
        let mut published = 0;
        let mut still_pending = Vec::new();

        for envelope in pending {
            match self.bus.publish(envelope.clone()).await {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::warn!(event_type = %envelope.event_type, error = %e, "republish failed");
                    still_pending.push(envelope);
                }
            }
        }

        self.pending_events.lock().await.extend(still_pending);
        published
    }

    /// Returns the number of stock holds waiting for reconciliation.
    pub async fn pending_stock_count(&self) -> usize {
        self.stranded.lock().await.len()
    }

    /// Brings every stranded hold in line with its stored order.
    ///
    /// A hold is released when its order is gone, cancelled or no longer
    /// has the line, committed when the order was delivered, and otherwise
    /// set to the line's quantity. Holds that fail again stay queued.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_stock(&self) -> ReconcileReport {
        let holds = std::mem::take(&mut *self.stranded.lock().await);
        let mut report = ReconcileReport::default();

        for hold in holds {
            let deadline = self.config.deadline();
            let outcome = self
                .reconcile_hold(hold.order_id, &hold.product_id, &deadline)
                .await;
            match outcome {
                Ok(resolution) => {
                    tracing::info!(
                        order_id = %hold.order_id,
                        product_id = %hold.product_id,
                        ?resolution,
                        "stock hold reconciled"
                    );
                    report.settled.push((hold, resolution));
                }
                Err(e) => report.failures.push(ReconcileFailure {
                    hold,
                    kind: e.kind(),
                    error: e.to_string(),
                }),
            }
        }

        if !report.is_complete() {
            tracing::warn!(
                failed = report.failures.len(),
                "stock reconciliation incomplete"
            );
            self.stranded
                .lock()
                .await
                .extend(report.failures.iter().map(|f| f.hold.clone()));
        }
        report
    }

    async fn reconcile_hold(
        &self,
        order_id: OrderId,
        product_id: &ProductId,
        deadline: &Deadline,
    ) -> Result<HoldResolution, DomainError> {
        let stored = self.find_order(order_id, deadline).await?;
        let line = stored
            .as_ref()
            .filter(|o| !o.is_cancelled())
            .and_then(|o| o.item(product_id).map(|i| (o.status(), i.quantity)));

        match line {
            None => self
                .products
                .release_stock_within(product_id, order_id, deadline)
                .await
                .map(HoldResolution::Released),
            Some((OrderStatus::Delivered, _)) => self
                .products
                .commit_stock_within(product_id, order_id, deadline)
                .await
                .map(HoldResolution::Committed),
            Some((_, quantity)) => self
                .products
                .reserve_stock_within(product_id, order_id, quantity, deadline)
                .await
                .map(|_| HoldResolution::Held(quantity)),
        }
    }

    /// Reconciles one hold right away, queueing it if that fails too.
    async fn settle_hold(&self, order_id: OrderId, product_id: ProductId) {
        let deadline = self.config.deadline();
        if let Err(e) = self
            .reconcile_hold(order_id, &product_id, &deadline)
            .await
        {
            self.strand(order_id, product_id, &e.to_string()).await;
        }
    }

    /// Queues a hold for [`Self::reconcile_stock`].
    async fn strand(&self, order_id: OrderId, product_id: ProductId, error: &str) {
        metrics::counter!("stock_holds_stranded_total").increment(1);
        tracing::warn!(
            %order_id,
            %product_id,
            %error,
            "stock hold out of line with order, queued for reconciliation"
        );
        self.stranded
            .lock()
            .await
            .insert(StrandedHold { order_id, product_id });
    }

    async fn strand_failures(&self, order_id: OrderId, report: &ReleaseReport) {
        for failure in &report.failures {
            self.strand(order_id, failure.product_id.clone(), &failure.error)
                .await;
        }
    }

    async fn publish(&self, events: Vec<OrderEvent>) {
        for event in events {
            let envelope = match event.to_envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    metrics::counter!("event_publish_failures_total").increment(1);
                    tracing::error!(event_type = event.event_type(), error = %e, "event could not be encoded");
                    continue;
                }
            };

            if let Err(e) = self.bus.publish(envelope.clone()).await {
                metrics::counter!("event_publish_failures_total").increment(1);
                tracing::warn!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "event publication failed, kept for republishing"
                );
                self.pending_events.lock().await.push(envelope);
            }
        }
    }

    async fn find_order(
        &self,
        order_id: OrderId,
        deadline: &Deadline,
    ) -> Result<Option<Order>, DomainError> {
        deadline
            .run("load order", self.orders.find_by_id(&order_id))
            .await
    }

    async fn load_order(&self, order_id: OrderId, deadline: &Deadline) -> Result<Order, DomainError> {
        self.find_order(order_id, deadline)
            .await?
            .ok_or(DomainError::OrderNotFound(order_id))
    }

    /// Validates and conditionally writes an order, bumping its version.
    async fn persist(&self, order: &mut Order, deadline: &Deadline) -> Result<(), DomainError> {
        order.validate()?;
        let version = deadline
            .run("update order", self.orders.update(order))
            .await?;
        order.set_version(version);
        Ok(())
    }
}

/// Fails with `PriceMismatch` if the line carries a stale unit price.
fn check_price(line: &OrderLine, product: &Product) -> Result<(), OrderError> {
    match &line.unit_price {
        Some(price) if price != product.price() => Err(OrderError::PriceMismatch {
            product_id: product.id().clone(),
            expected: product.price().clone(),
            actual: price.clone(),
        }),
        _ => Ok(()),
    }
}

/// Builds an order line priced at the product's current price.
fn snapshot(product: &Product, quantity: u32) -> OrderItem {
    OrderItem::new(
        product.id().clone(),
        product.name(),
        quantity,
        product.price().clone(),
    )
}

fn empty_if_not_found(found: Result<Vec<Order>, DomainError>) -> Result<Vec<Order>, DomainError> {
    match found {
        Err(DomainError::Repository(RepositoryError::NotFound { .. })) => Ok(Vec::new()),
        other => other,
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::histogram!("order_operation_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::CancellationPolicy;
    use crate::error::ErrorKind;
    use crate::order::{InMemoryOrderRepository, PaymentChannel, PaymentInfo, PaymentMethod};
    use crate::product::{CreateProduct, InMemoryProductRepository};
    use common::Money;
    use event_bus::InMemoryEventBus;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: OrderService,
        orders: InMemoryOrderRepository,
        products: InMemoryProductRepository,
        bus: InMemoryEventBus,
    }

    async fn fixture(config: ServiceConfig) -> Fixture {
        let orders = InMemoryOrderRepository::new();
        let products = InMemoryProductRepository::new();
        let bus = InMemoryEventBus::new();
        let product_service = ProductService::new(Arc::new(products.clone()), config.clone());
        let service = OrderService::new(
            Arc::new(orders.clone()),
            product_service,
            Arc::new(bus.clone()),
            config,
        );

        for (id, price, stock) in [("p1", dec!(10.00), 100), ("p2", dec!(2.50), 5)] {
            service
                .products()
                .create_product(
                    CreateProduct::new(id, Money::new(price, "CNY"), stock)
                        .with_id(id)
                        .on_sale(),
                )
                .await
                .unwrap();
        }

        Fixture {
            service,
            orders,
            products,
            bus,
        }
    }

    fn cny(amount: rust_decimal::Decimal) -> Money {
        Money::new(amount, "CNY")
    }

    fn payment(amount: Money) -> PaymentInfo {
        PaymentInfo::new(amount, PaymentMethod::Alipay, PaymentChannel::App, "T-1")
    }

    async fn stock(f: &Fixture, id: &str) -> u32 {
        f.service
            .products()
            .get_product(&ProductId::new(id))
            .await
            .unwrap()
            .stock()
    }

    async fn reserved(f: &Fixture, id: &str) -> u32 {
        f.service
            .products()
            .get_product(&ProductId::new(id))
            .await
            .unwrap()
            .reserved_total()
    }

    #[tokio::test]
    async fn test_create_order_reserves_stock() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3))
            .await
            .unwrap();

        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.total_amount(), &cny(dec!(30.00)));
        assert_eq!(stock(&f, "p1").await, 97);
        assert_eq!(f.orders.len().await, 1);
        assert_eq!(f.bus.published_of_type("order.created").await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_lines_are_merged() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 2).line("p1", 3))
            .await
            .unwrap();

        assert_eq!(order.items().len(), 1);
        assert_eq!(order.items()[0].quantity, 5);
        assert_eq!(stock(&f, "p1").await, 95);
    }

    #[tokio::test]
    async fn test_create_with_unknown_product() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1).line("nope", 1))
            .await
            .unwrap_err();

        assert!(matches!(err.root(), DomainError::ProductNotFound(_)));
        assert_eq!(stock(&f, "p1").await, 100);
        assert!(f.orders.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_with_stale_price() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create_order(CreateOrder::new("u1").line_at_price("p1", 1, cny(dec!(9.99))))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PriceMismatch);
        assert_eq!(stock(&f, "p1").await, 100);
    }

    #[tokio::test]
    async fn test_create_with_matching_price() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line_at_price("p1", 1, cny(dec!(10))))
            .await
            .unwrap();
        assert_eq!(order.total_amount(), &cny(dec!(10)));
    }

    #[tokio::test]
    async fn test_create_without_lines() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create_order(CreateOrder::new("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_insufficient_stock_reserves_nothing() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1).line("p2", 6))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(stock(&f, "p2").await, 5);
        assert!(f.orders.is_empty().await);
        assert_eq!(f.bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_lines_checked_against_merged_quantity() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create_order(CreateOrder::new("u1").line("p2", 3).line("p2", 3))
            .await
            .unwrap_err();

        assert!(matches!(
            err.root(),
            DomainError::Product(ProductError::InsufficientStock {
                requested: 6,
                available: 5,
                ..
            })
        ));
        assert_eq!(stock(&f, "p2").await, 5);
        assert_eq!(reserved(&f, "p2").await, 0);
        assert!(f.orders.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_save_releases_stock() {
        let f = fixture(ServiceConfig::default()).await;
        f.orders.set_fail_on_save(true).await;

        let err = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3).line("p2", 5))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(stock(&f, "p2").await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_compensation_is_reconciled() {
        let f = fixture(ServiceConfig::default()).await;
        f.orders.set_fail_on_save(true).await;
        f.orders.set_latency(Some(Duration::from_millis(50))).await;
        let cmd = CreateOrder::new("u1").line("p1", 3).line("p2", 3);
        let order_id = cmd.order_id;

        // Stock is reserved at 50ms and released after the failed save at 150ms.
        let (result, _) = tokio::join!(f.service.create_order(cmd), async {
            tokio::time::sleep(Duration::from_millis(75)).await;
            f.products.fail_updates_for(&ProductId::new("p2")).await;
        });

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Storage);
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(stock(&f, "p2").await, 2);
        assert_eq!(f.service.pending_stock_count().await, 1);

        f.products.clear_failures().await;
        let report = f.service.reconcile_stock().await;
        assert!(report.is_complete());
        assert_eq!(
            report.settled,
            vec![(
                StrandedHold {
                    order_id,
                    product_id: ProductId::new("p2"),
                },
                HoldResolution::Released(Some(3)),
            )]
        );
        assert_eq!(stock(&f, "p2").await, 5);
        assert_eq!(reserved(&f, "p2").await, 0);
        assert_eq!(f.service.pending_stock_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_order_id() {
        let f = fixture(ServiceConfig::default()).await;
        let cmd = CreateOrder::new("u1").line("p1", 3);

        let first = f.service.create_order(cmd.clone()).await.unwrap();
        let second = f.service.create_order(cmd).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(stock(&f, "p1").await, 97);
        assert_eq!(f.orders.len().await, 1);
    }

    #[tokio::test]
    async fn test_order_id_of_other_user_is_rejected() {
        let f = fixture(ServiceConfig::default()).await;
        let first = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();

        let err = f
            .service
            .create_order(CreateOrder::with_id(first.id(), "u2").line("p1", 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(stock(&f, "p1").await, 99);
    }

    #[tokio::test]
    async fn test_pay_order() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3))
            .await
            .unwrap();

        let paid = f
            .service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(30.00)))))
            .await
            .unwrap();

        assert!(paid.is_paid());
        assert!(paid.paid_at().is_some());
        assert_eq!(stock(&f, "p1").await, 97);
        assert_eq!(f.bus.published_of_type("order.paid").await.len(), 1);
        assert_eq!(
            f.bus.published_of_type("order.status.changed").await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_pay_with_wrong_amount() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3))
            .await
            .unwrap();

        let err = f
            .service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(30.01)))))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PaymentAmountMismatch);
        let stored = f.service.get_order(order.id()).await.unwrap();
        assert_eq!(stored.status(), OrderStatus::Created);
    }

    #[tokio::test]
    async fn test_pay_missing_order() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .pay_order(PayOrder::new(OrderId::new(), payment(cny(dec!(1)))))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err.root(), DomainError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_pay_twice() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        let pay = PayOrder::new(order.id(), payment(cny(dec!(10))));

        f.service.pay_order(pay.clone()).await.unwrap();
        let err = f.service.pay_order(pay).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOrderStatusForPayment);
    }

    #[tokio::test]
    async fn test_cancel_paid_order_releases_stock() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3))
            .await
            .unwrap();
        f.service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(30)))))
            .await
            .unwrap();

        let outcome = f
            .service
            .cancel_order(CancelOrder::with_reason(order.id(), "changed mind"))
            .await
            .unwrap();

        assert!(outcome.is_fully_released());
        assert!(outcome.order.is_cancelled());
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(f.bus.published_of_type("order.canceled").await.len(), 1);
    }

    #[tokio::test]
    async fn test_created_only_policy_rejects_paid_cancel() {
        let config =
            ServiceConfig::default().with_cancellation_policy(CancellationPolicy::CreatedOnly);
        let f = fixture(config).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        f.service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(10)))))
            .await
            .unwrap();

        let err = f
            .service
            .cancel_order(CancelOrder::new(order.id()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatusTransition);
        assert_eq!(stock(&f, "p1").await, 99);
    }

    #[tokio::test]
    async fn test_cancel_shipping_order_is_rejected() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        f.service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(10)))))
            .await
            .unwrap();
        f.service.ship_order(ShipOrder::new(order.id())).await.unwrap();

        let err = f
            .service
            .cancel_order(CancelOrder::new(order.id()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.root(),
            DomainError::Order(OrderError::CancellationNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_release_is_reported_and_retryable() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 3).line("p2", 2))
            .await
            .unwrap();
        f.products.fail_updates_for(&ProductId::new("p2")).await;

        let outcome = f
            .service
            .cancel_order(CancelOrder::new(order.id()))
            .await
            .unwrap();

        assert!(outcome.order.is_cancelled());
        assert!(!outcome.is_fully_released());
        assert_eq!(
            outcome.releases.failed_products().collect::<Vec<_>>(),
            vec![&ProductId::new("p2")]
        );
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(stock(&f, "p2").await, 3);

        f.products.clear_failures().await;
        let retry = f.service.retry_stock_release(order.id()).await.unwrap();
        assert!(retry.is_complete());
        assert_eq!(retry.released, vec![(ProductId::new("p2"), 2)]);
        assert_eq!(stock(&f, "p2").await, 5);
        assert_eq!(stock(&f, "p1").await, 100);
    }

    #[tokio::test]
    async fn test_retry_release_requires_cancelled_order() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        let err = f
            .service
            .retry_stock_release(order.id())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatusTransition);
    }

    #[tokio::test]
    async fn test_ship_and_deliver_commit_holds() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p2", 5))
            .await
            .unwrap();
        f.service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(12.50)))))
            .await
            .unwrap();

        let shipping = f.service.ship_order(ShipOrder::new(order.id())).await.unwrap();
        assert_eq!(shipping.status(), OrderStatus::Shipping);

        let delivered = f
            .service
            .deliver_order(DeliverOrder::new(order.id()))
            .await
            .unwrap();
        assert_eq!(delivered.status(), OrderStatus::Delivered);

        let product = f
            .service
            .products()
            .get_product(&ProductId::new("p2"))
            .await
            .unwrap();
        assert_eq!(product.stock(), 0);
        assert_eq!(product.reserved_total(), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_is_reconciled() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 4).line("p2", 5))
            .await
            .unwrap();
        f.service
            .pay_order(PayOrder::new(order.id(), payment(cny(dec!(52.50)))))
            .await
            .unwrap();
        f.service.ship_order(ShipOrder::new(order.id())).await.unwrap();
        f.products.fail_updates_for(&ProductId::new("p2")).await;

        let delivered = f
            .service
            .deliver_order(DeliverOrder::new(order.id()))
            .await
            .unwrap();
        assert_eq!(delivered.status(), OrderStatus::Delivered);
        assert_eq!(reserved(&f, "p1").await, 0);
        assert_eq!(reserved(&f, "p2").await, 5);
        assert_eq!(f.service.pending_stock_count().await, 1);

        let still_failing = f.service.reconcile_stock().await;
        assert_eq!(still_failing.failures.len(), 1);
        assert_eq!(still_failing.failures[0].kind, ErrorKind::Storage);
        assert_eq!(f.service.pending_stock_count().await, 1);

        f.products.clear_failures().await;
        let report = f.service.reconcile_stock().await;
        assert_eq!(report.settled[0].1, HoldResolution::Committed(Some(5)));
        assert_eq!(reserved(&f, "p2").await, 0);
        assert_eq!(stock(&f, "p2").await, 0);
        assert_eq!(stock(&f, "p1").await, 96);
        assert_eq!(f.service.pending_stock_count().await, 0);
    }

    #[tokio::test]
    async fn test_ship_unpaid_order_fails() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        let err = f
            .service
            .ship_order(ShipOrder::new(order.id()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatusTransition);
        assert!(err.to_string().starts_with("failed to ship order"));
    }

    #[tokio::test]
    async fn test_add_and_remove_items() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();

        let order = f
            .service
            .add_item(AddItem::new(order.id(), OrderLine::new("p1", 2)))
            .await
            .unwrap();
        assert_eq!(order.item(&ProductId::new("p1")).unwrap().quantity, 3);
        assert_eq!(stock(&f, "p1").await, 97);

        let order = f
            .service
            .add_item(AddItem::new(order.id(), OrderLine::new("p2", 2)))
            .await
            .unwrap();
        assert_eq!(order.total_amount(), &cny(dec!(35.00)));
        assert_eq!(stock(&f, "p2").await, 3);

        let order = f
            .service
            .remove_item(RemoveItem::new(order.id(), "p2"))
            .await
            .unwrap();
        assert_eq!(order.total_amount(), &cny(dec!(30.00)));
        assert_eq!(stock(&f, "p2").await, 5);
        assert_eq!(f.bus.published_of_type("order.item.added").await.len(), 2);
        assert_eq!(f.bus.published_of_type("order.item.removed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_release_on_remove_is_reconciled() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1).line("p2", 3))
            .await
            .unwrap();
        f.products.fail_updates_for(&ProductId::new("p2")).await;

        let order = f
            .service
            .remove_item(RemoveItem::new(order.id(), "p2"))
            .await
            .unwrap();
        assert!(order.item(&ProductId::new("p2")).is_none());
        assert_eq!(stock(&f, "p2").await, 2);
        assert_eq!(f.service.pending_stock_count().await, 1);

        f.products.clear_failures().await;
        let report = f.service.reconcile_stock().await;
        assert_eq!(report.settled[0].1, HoldResolution::Released(Some(3)));
        assert_eq!(stock(&f, "p2").await, 5);
        assert_eq!(reserved(&f, "p2").await, 0);
        assert_eq!(reserved(&f, "p1").await, 1);
        assert_eq!(f.service.pending_stock_count().await, 0);
    }

    #[tokio::test]
    async fn test_removing_last_item_is_rejected() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();

        let err = f
            .service
            .remove_item(RemoveItem::new(order.id(), "p1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(stock(&f, "p1").await, 99);
    }

    #[tokio::test]
    async fn test_add_item_beyond_stock() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p2", 4))
            .await
            .unwrap();

        let err = f
            .service
            .add_item(AddItem::new(order.id(), OrderLine::new("p2", 2)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert_eq!(stock(&f, "p2").await, 1);
        let stored = f.service.get_order(order.id()).await.unwrap();
        assert_eq!(stored.items()[0].quantity, 4);
    }

    #[tokio::test]
    async fn test_add_item_restores_hold_when_update_fails() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        f.orders.set_fail_on_update(true).await;

        let err = f
            .service
            .add_item(AddItem::new(order.id(), OrderLine::new("p1", 4)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(stock(&f, "p1").await, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_item_racing_cancel_leaves_no_hold() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 2))
            .await
            .unwrap();
        f.orders.set_latency(Some(Duration::from_millis(30))).await;
        f.products.set_latency(Some(Duration::from_millis(10))).await;

        // Both load the order at 30ms. The cancel is stored at 60ms, while
        // the add has already grown the hold and then fails its write at 90ms.
        let (added, cancelled) = tokio::join!(
            f.service
                .add_item(AddItem::new(order.id(), OrderLine::new("p1", 3))),
            f.service.cancel_order(CancelOrder::new(order.id())),
        );

        assert_eq!(added.unwrap_err().kind(), ErrorKind::Conflict);
        let cancelled = cancelled.unwrap();
        assert!(cancelled.order.is_cancelled());
        assert!(cancelled.is_fully_released());
        assert_eq!(stock(&f, "p1").await, 100);
        assert_eq!(reserved(&f, "p1").await, 0);
        assert_eq!(f.service.pending_stock_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_remark() {
        let f = fixture(ServiceConfig::default()).await;
        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 1))
            .await
            .unwrap();
        let updated = f
            .service
            .update_remark(UpdateRemark::new(order.id(), "ring twice"))
            .await
            .unwrap();
        assert_eq!(updated.remark(), "ring twice");
        assert_eq!(updated.version(), common::Version::new(2));
    }

    #[tokio::test]
    async fn test_list_user_orders() {
        let f = fixture(ServiceConfig::default()).await;
        for _ in 0..2 {
            f.service
                .create_order(CreateOrder::new("u1").line("p1", 1))
                .await
                .unwrap();
        }

        let user = UserId::new("u1");
        assert_eq!(f.service.list_user_orders(&user).await.unwrap().len(), 2);
        assert_eq!(
            f.service
                .list_user_orders_with_status(&user, OrderStatus::Paid)
                .await
                .unwrap()
                .len(),
            0
        );
        assert!(
            f.service
                .list_user_orders(&UserId::new("nobody"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_validate_status_transition() {
        let f = fixture(ServiceConfig::default()).await;
        assert!(
            f.service
                .validate_status_transition(OrderStatus::Created, OrderStatus::Paid)
                .is_ok()
        );
        let err = f
            .service
            .validate_status_transition(OrderStatus::Delivered, OrderStatus::Paid)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatusTransition);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_state_change() {
        let f = fixture(ServiceConfig::default()).await;
        f.bus.set_fail_on_publish(true);

        let order = f
            .service
            .create_order(CreateOrder::new("u1").line("p1", 2))
            .await
            .unwrap();

        assert_eq!(f.orders.len().await, 1);
        assert_eq!(stock(&f, "p1").await, 98);
        assert_eq!(f.service.pending_event_count().await, 1);

        f.bus.set_fail_on_publish(false);
        assert_eq!(f.service.republish_pending().await, 1);
        assert_eq!(f.service.pending_event_count().await, 0);
        let created = f.bus.published_of_type("order.created").await;
        assert_eq!(created[0].aggregate_id, order.id().to_string());
    }
}
