//! Product persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ProductId, Version};
use tokio::sync::RwLock;

use crate::repository::{RepositoryError, RepositoryResult};

use super::Product;

const ENTITY: &str = "Product";

/// Storage for products.
///
/// `update` is a conditional write: it succeeds only if the stored version
/// equals the version carried by `product`, and returns the new version.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Inserts a new product and returns its first version.
    async fn save(&self, product: &Product) -> RepositoryResult<Version>;

    /// Loads a product by id.
    async fn find_by_id(&self, id: &ProductId) -> RepositoryResult<Option<Product>>;

    /// Loads every product, ordered by id.
    async fn find_all(&self) -> RepositoryResult<Vec<Product>>;

    /// Replaces a stored product if its version still matches.
    async fn update(&self, product: &Product) -> RepositoryResult<Version>;

    /// Removes a product record.
    async fn delete(&self, id: &ProductId) -> RepositoryResult<()>;
}

#[derive(Default)]
struct InMemoryProductState {
    products: HashMap<ProductId, Product>,
    failing_updates: HashSet<ProductId>,
    fail_all_updates: bool,
    latency: Option<Duration>,
}

/// In-memory product repository for tests and the demo binary.
#[derive(Clone, Default)]
pub struct InMemoryProductRepository {
    state: Arc<RwLock<InMemoryProductState>>,
}

impl InMemoryProductRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every update fail with a backend error until reset.
    pub async fn set_fail_on_update(&self, fail: bool) {
        self.state.write().await.fail_all_updates = fail;
    }

    /// Makes updates to one product fail until [`Self::clear_failures`].
    pub async fn fail_updates_for(&self, id: &ProductId) {
        self.state.write().await.failing_updates.insert(id.clone());
    }

    /// Clears all injected failures.
    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.failing_updates.clear();
        state.fail_all_updates = false;
    }

    /// Delays every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    /// Returns the number of stored products.
    pub async fn len(&self) -> usize {
        self.state.read().await.products.len()
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
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn save(&self, product: &Product) -> RepositoryResult<Version> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        if state.products.contains_key(product.id()) {
            return Err(RepositoryError::AlreadyExists {
                entity: ENTITY,
                id: product.id().to_string(),
            });
        }

        let version = Version::first();
        let mut stored = product.clone();
        stored.set_version(version);
        state.products.insert(product.id().clone(), stored);
        Ok(version)
    }

    async fn find_by_id(&self, id: &ProductId) -> RepositoryResult<Option<Product>> {
        self.simulate_latency().await;
        Ok(self.state.read().await.products.get(id).cloned())
    }

    async fn find_all(&self) -> RepositoryResult<Vec<Product>> {
        self.simulate_latency().await;
        let mut products: Vec<Product> = self.state.read().await.products.values().cloned().collect();
        products.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(products)
    }

    async fn update(&self, product: &Product) -> RepositoryResult<Version> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        if state.fail_all_updates || state.failing_updates.contains(product.id()) {
            return Err(RepositoryError::Backend(format!(
                "update of product {} rejected",
                product.id()
            )));
        }

        let stored = state
            .products
            .get_mut(product.id())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: ENTITY,
                id: product.id().to_string(),
            })?;

        if stored.version() != product.version() {
            return Err(RepositoryError::Conflict {
                entity: ENTITY,
                id: product.id().to_string(),
                expected: product.version(),
                actual: stored.version(),
            });
        }

        let version = product.version().next();
        *stored = product.clone();
        stored.set_version(version);
        Ok(version)
    }

    async fn delete(&self, id: &ProductId) -> RepositoryResult<()> {
        self.simulate_latency().await;
        self.state
            .write()
            .await
            .products
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })
    }
}
