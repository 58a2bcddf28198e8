//! Order persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, UserId, Version};
use tokio::sync::RwLock;

use crate::repository::{RepositoryError, RepositoryResult};

use super::{Order, OrderStatus};

const ENTITY: &str = "Order";

/// Storage for orders. Items are stored embedded in their order.
///
/// `update` is a conditional write on the order's version and returns the
/// new version.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts a new order and returns its first version.
    async fn save(&self, order: &Order) -> RepositoryResult<Version>;

    async fn find_by_id(&self, id: &OrderId) -> RepositoryResult<Option<Order>>;

    /// Loads a user's orders, oldest first.
    async fn find_by_user_id(&self, user_id: &UserId) -> RepositoryResult<Vec<Order>>;

    /// Loads a user's orders in one status, oldest first.
    async fn find_by_user_id_and_status(
        &self,
        user_id: &UserId,
        status: OrderStatus,
    ) -> RepositoryResult<Vec<Order>>;

    /// Replaces a stored order if its version still matches.
    async fn update(&self, order: &Order) -> RepositoryResult<Version>;

    async fn delete(&self, id: &OrderId) -> RepositoryResult<()>;
}

#[derive(Default)]
struct InMemoryOrderState {
    orders: HashMap<OrderId, Order>,
    fail_on_save: bool,
    fail_on_update: bool,
    latency: Option<Duration>,
}

/// In-memory order repository for tests and the demo binary.
#[derive(Clone, Default)]
pub struct InMemoryOrderRepository {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every save fail with a backend error until reset.
    pub async fn set_fail_on_save(&self, fail: bool) {
        self.state.write().await.fail_on_save = fail;
    }

    /// Makes every update fail with a backend error until reset.
    pub async fn set_fail_on_update(&self, fail: bool) {
        self.state.write().await.fail_on_update = fail;
    }

    /// Delays every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn simulate_latency(&self) {
        let latency = self.state.read().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn collect(&self, filter: impl Fn(&Order) -> bool) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|&o| filter(o))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at(), o.id()));
        orders
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &Order) -> RepositoryResult<Version> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        if state.fail_on_save {
            return Err(RepositoryError::Backend(format!(
                "save of order {} rejected",
                order.id()
            )));
        }
        if state.orders.contains_key(&order.id()) {
            return Err(RepositoryError::AlreadyExists {
                entity: ENTITY,
                id: order.id().to_string(),
            });
        }

        let version = Version::first();
        let mut stored = order.clone();
        stored.set_version(version);
        state.orders.insert(order.id(), stored);
        Ok(version)
    }

    async fn find_by_id(&self, id: &OrderId) -> RepositoryResult<Option<Order>> {
        self.simulate_latency().await;
        Ok(self.state.read().await.orders.get(id).cloned())
    }

    async fn find_by_user_id(&self, user_id: &UserId) -> RepositoryResult<Vec<Order>> {
        self.simulate_latency().await;
        Ok(self.collect(|o| o.user_id() == user_id).await)
    }

    async fn find_by_user_id_and_status(
        &self,
        user_id: &UserId,
        status: OrderStatus,
    ) -> RepositoryResult<Vec<Order>> {
        self.simulate_latency().await;
        Ok(self
            .collect(|o| o.user_id() == user_id && o.status() == status)
            .await)
    }

    async fn update(&self, order: &Order) -> RepositoryResult<Version> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        if state.fail_on_update {
            return Err(RepositoryError::Backend(format!(
                "update of order {} rejected",
                order.id()
            )));
        }

        let stored = state
            .orders
            .get_mut(&order.id())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: ENTITY,
                id: order.id().to_string(),
            })?;

        if stored.version() != order.version() {
            return Err(RepositoryError::Conflict {
                entity: ENTITY,
                id: order.id().to_string(),
                expected: order.version(),
                actual: stored.version(),
            });
        }

        let version = order.version().next();
        *stored = order.clone();
        stored.set_version(version);
        Ok(version)
    }

    async fn delete(&self, id: &OrderId) -> RepositoryResult<()> {
        self.simulate_latency().await;
        self.state
            .write()
            .await
            .orders
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })
    }
}
