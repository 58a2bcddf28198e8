//! Multi-line stock reservation with compensating release.
//!
//! Reserving stock for an order touches one product per line. Each line is
//! reserved in turn; if any line fails, the lines already reserved are
//! released in reverse order before the error is returned.

use common::{OrderId, ProductId};

use crate::deadline::Deadline;
use crate::error::{DomainError, ErrorKind};
use crate::order::OrderItem;
use crate::product::ProductService;

/// The state of a reservation saga.
///
/// State transitions:
/// ```text
/// Pending ──► Reserving ──┬──► Reserved ──► Compensating ──► Compensated
///                         └──────────────► Compensating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReservationState {
    /// Nothing reserved yet.
    #[default]
    Pending,

    /// Lines are being reserved.
    Reserving,

    /// Every line is reserved.
    Reserved,

    /// Reserved lines are being released.
    Compensating,

    /// Release finished (terminal state).
    Compensated,
}

impl ReservationState {
    pub fn can_reserve(&self) -> bool {
        matches!(self, ReservationState::Pending)
    }

    pub fn can_compensate(&self) -> bool {
        matches!(self, ReservationState::Reserving | ReservationState::Reserved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Compensated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "Pending",
            ReservationState::Reserving => "Reserving",
            ReservationState::Reserved => "Reserved",
            ReservationState::Compensating => "Compensating",
            ReservationState::Compensated => "Compensated",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hold that could not be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub product_id: ProductId,
    pub kind: ErrorKind,
    pub error: String,
}

/// Outcome of releasing an order's holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Products whose hold was returned to stock, with the quantity.
    pub released: Vec<(ProductId, u32)>,

    /// Products whose release failed and can be retried.
    pub failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    /// Returns true if no release failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn released_quantity(&self) -> u32 {
        self.released.iter().map(|(_, q)| q).sum()
    }

    pub fn failed_products(&self) -> impl Iterator<Item = &ProductId> {
        self.failures.iter().map(|f| &f.product_id)
    }
}

/// A hold that could not be brought in line with its order and awaits
/// [`OrderService::reconcile_stock`](crate::order::OrderService::reconcile_stock).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StrandedHold {
    pub order_id: OrderId,
    pub product_id: ProductId,
}

/// What reconciliation did to one hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldResolution {
    /// Returned to stock; `None` if nothing was held.
    Released(Option<u32>),

    /// Made final for a delivered order.
    Committed(Option<u32>),

    /// Set to the quantity the stored order references.
    Held(u32),
}

/// A stranded hold that failed to reconcile again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub hold: StrandedHold,
    pub kind: ErrorKind,
    pub error: String,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub settled: Vec<(StrandedHold, HoldResolution)>,

    /// Holds still stranded; they stay queued for the next pass.
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Releases the holds of `order_id` on each product.
///
/// Releases are idempotent, so products without a hold are skipped and the
/// whole call can be repeated. Failures are collected, not propagated.
pub async fn release_holds(
    products: &ProductService,
    order_id: OrderId,
    product_ids: impl IntoIterator<Item = ProductId>,
    deadline: &Deadline,
) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    for product_id in product_ids {
        match products
            .release_stock_within(&product_id, order_id, deadline)
            .await
        {
            Ok(Some(quantity)) => report.released.push((product_id, quantity)),
            Ok(None) => {}
            Err(e) => {
                metrics::counter!("stock_compensation_failures_total").increment(1);
                tracing::warn!(%order_id, %product_id, error = %e, "stock release failed");
                report.failures.push(ReleaseFailure {
                    product_id,
                    kind: e.kind(),
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

/// Reserves stock for every line of one order, undoing on failure.
pub struct ReservationSaga<'a> {
    products: &'a ProductService,
    order_id: OrderId,
    touched: Vec<ProductId>,
    state: ReservationState,
    report: ReleaseReport,
}

impl<'a> ReservationSaga<'a> {
    pub fn new(products: &'a ProductService, order_id: OrderId) -> Self {
        Self {
            products,
            order_id,
            touched: Vec::new(),
            state: ReservationState::Pending,
            report: ReleaseReport::default(),
        }
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    /// Products reserved (or attempted) so far, in order.
    pub fn touched(&self) -> &[ProductId] {
        &self.touched
    }

    /// Outcome of the last compensation; empty until the saga compensates.
    pub fn report(&self) -> &ReleaseReport {
        &self.report
    }

    /// Reserves every item in order.
    ///
    /// On the first failure the saga compensates and returns that failure.
    /// Holds the compensation could not release are listed in [`Self::report`].
    #[tracing::instrument(skip(self, items, deadline), fields(order_id = %self.order_id))]
    pub async fn reserve_all(
        &mut self,
        items: &[OrderItem],
        deadline: &Deadline,
    ) -> Result<(), DomainError> {
        if !self.state.can_reserve() {
            return Ok(());
        }
        self.state = ReservationState::Reserving;

        for item in items {
            let result = self
                .products
                .reserve_stock_within(&item.product_id, self.order_id, item.quantity, deadline)
                .await;

            // A timed out call may still have written its hold.
            if result.is_ok() || result.as_ref().is_err_and(|e| e.is(ErrorKind::Timeout)) {
                self.touched.push(item.product_id.clone());
            }

            if let Err(e) = result {
                tracing::warn!(
                    product_id = %item.product_id,
                    error = %e,
                    "stock reservation failed, compensating"
                );
                self.compensate().await;
                return Err(e);
            }
        }

        self.state = ReservationState::Reserved;
        Ok(())
    }

    /// Releases every touched line in reverse order.
    ///
    /// Runs under its own deadline so an expired operation can still clean up.
    pub async fn compensate(&mut self) -> ReleaseReport {
        if !self.state.can_compensate() {
            return ReleaseReport::default();
        }
        self.state = ReservationState::Compensating;

        let deadline = self.products.config().deadline();
        let touched: Vec<ProductId> = self.touched.drain(..).rev().collect();
        let report = release_holds(self.products, self.order_id, touched, &deadline).await;

        if report.is_complete() {
            tracing::info!(
                order_id = %self.order_id,
                released = report.released.len(),
                "reservations compensated"
            );
        } else {
            tracing::warn!(
                order_id = %self.order_id,
                failed = report.failures.len(),
                "reservations partially compensated"
            );
        }

        self.state = ReservationState::Compensated;
        self.report = report.clone();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ServiceConfig;
    use crate::product::{CreateProduct, InMemoryProductRepository};
    use common::Money;
    use rust_decimal_macros::dec;

    async fn setup(stocks: &[(&str, u32)]) -> (ProductService, InMemoryProductRepository) {
        let repo = InMemoryProductRepository::new();
        let service = ProductService::new(Arc::new(repo.clone()), ServiceConfig::default());
        for (id, stock) in stocks {
            service
                .create_product(
                    CreateProduct::new(*id, Money::new(dec!(1), "CNY"), *stock)
                        .with_id(*id)
                        .on_sale(),
                )
                .await
                .unwrap();
        }
        (service, repo)
    }

    fn item(product: &str, quantity: u32) -> OrderItem {
        OrderItem::new(product, product, quantity, Money::new(dec!(1), "CNY"))
    }

    async fn stock(service: &ProductService, id: &str) -> u32 {
        service
            .get_product(&ProductId::new(id))
            .await
            .unwrap()
            .stock()
    }

    #[test]
    fn test_state_predicates() {
        assert!(ReservationState::Pending.can_reserve());
        assert!(!ReservationState::Reserved.can_reserve());
        assert!(ReservationState::Reserving.can_compensate());
        assert!(ReservationState::Reserved.can_compensate());
        assert!(!ReservationState::Compensated.can_compensate());
        assert!(ReservationState::Compensated.is_terminal());
        assert_eq!(ReservationState::Compensating.to_string(), "Compensating");
    }

    #[tokio::test]
    async fn test_reserve_all() {
        let (service, _) = setup(&[("a", 10), ("b", 10)]).await;
        let mut saga = ReservationSaga::new(&service, OrderId::new());

        saga.reserve_all(&[item("a", 2), item("b", 3)], &Deadline::none())
            .await
            .unwrap();

        assert_eq!(saga.state(), ReservationState::Reserved);
        assert_eq!(stock(&service, "a").await, 8);
        assert_eq!(stock(&service, "b").await, 7);
    }

    #[tokio::test]
    async fn test_failure_releases_earlier_lines() {
        let (service, _) = setup(&[("a", 10), ("b", 10), ("c", 1)]).await;
        let mut saga = ReservationSaga::new(&service, OrderId::new());

        let err = saga
            .reserve_all(
                &[item("a", 2), item("b", 3), item("c", 5)],
                &Deadline::none(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert_eq!(saga.state(), ReservationState::Compensated);
        assert_eq!(stock(&service, "a").await, 10);
        assert_eq!(stock(&service, "b").await, 10);
        assert_eq!(stock(&service, "c").await, 1);
        assert!(saga.report().is_complete());
        assert_eq!(saga.report().released_quantity(), 5);
    }

    #[tokio::test]
    async fn test_failed_compensation_is_reported() {
        let (service, repo) = setup(&[("a", 10), ("b", 10)]).await;
        let mut saga = ReservationSaga::new(&service, OrderId::new());
        saga.reserve_all(&[item("a", 2), item("b", 3)], &Deadline::none())
            .await
            .unwrap();
        repo.fail_updates_for(&ProductId::new("b")).await;

        saga.compensate().await;

        assert_eq!(saga.report().released, vec![(ProductId::new("a"), 2)]);
        assert_eq!(
            saga.report().failed_products().collect::<Vec<_>>(),
            vec![&ProductId::new("b")]
        );
        assert_eq!(stock(&service, "b").await, 7);
    }

    #[tokio::test]
    async fn test_missing_product_compensates() {
        let (service, _) = setup(&[("a", 10)]).await;
        let mut saga = ReservationSaga::new(&service, OrderId::new());

        let err = saga
            .reserve_all(&[item("a", 4), item("ghost", 1)], &Deadline::none())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(stock(&service, "a").await, 10);
    }

    #[tokio::test]
    async fn test_compensate_after_success() {
        let (service, _) = setup(&[("a", 5)]).await;
        let mut saga = ReservationSaga::new(&service, OrderId::new());
        saga.reserve_all(&[item("a", 5)], &Deadline::none())
            .await
            .unwrap();

        let report = saga.compensate().await;
        assert!(report.is_complete());
        assert_eq!(report.released_quantity(), 5);
        assert_eq!(stock(&service, "a").await, 5);

        assert!(saga.compensate().await.released.is_empty());
    }

    #[tokio::test]
    async fn test_release_holds_reports_failures() {
        let (service, repo) = setup(&[("a", 5), ("b", 5)]).await;
        let order = OrderId::new();
        service.reserve_stock(&ProductId::new("a"), order, 1).await.unwrap();
        service.reserve_stock(&ProductId::new("b"), order, 2).await.unwrap();
        repo.fail_updates_for(&ProductId::new("b")).await;

        let report = release_holds(
            &service,
            order,
            [ProductId::new("a"), ProductId::new("b")],
            &Deadline::none(),
        )
        .await;

        assert!(!report.is_complete());
        assert_eq!(report.released, vec![(ProductId::new("a"), 1)]);
        assert_eq!(
            report.failed_products().collect::<Vec<_>>(),
            vec![&ProductId::new("b")]
        );
        assert_eq!(report.failures[0].kind, ErrorKind::Storage);

        repo.clear_failures().await;
        let retry = release_holds(
            &service,
            order,
            [ProductId::new("a"), ProductId::new("b")],
            &Deadline::none(),
        )
        .await;
        assert!(retry.is_complete());
        assert_eq!(retry.released, vec![(ProductId::new("b"), 2)]);
    }
}
