//! Product service: catalogue operations and stock reservations.

use std::sync::Arc;

use common::{Money, OrderId, ProductId};

use crate::config::ServiceConfig;
use crate::deadline::Deadline;
use crate::error::{DomainError, ResultExt};

use super::{Product, ProductError, ProductRepository};

/// Input for [`ProductService::create_product`].
#[derive(Debug, Clone)]
pub struct CreateProduct {
    /// Id to use; generated when `None`.
    pub id: Option<ProductId>,
    pub name: String,
    pub description: String,
    pub price: Money,
    pub stock: u32,

    /// Put the product on sale right away instead of leaving it in draft.
    pub on_sale: bool,
}

impl CreateProduct {
    pub fn new(name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            price,
            stock,
            on_sale: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<ProductId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn on_sale(mut self) -> Self {
        self.on_sale = true;
        self
    }
}

/// Partial update for [`ProductService::update_product`]. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateProduct {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Money>,
    pub stock: Option<u32>,
}

/// Service for managing products and their stock.
///
/// Every change is a read-modify-write against the repository's conditional
/// update. A version conflict means another writer got there first; the
/// change is then re-applied to a fresh read, up to
/// `max_conflict_retries` times.
#[derive(Clone)]
pub struct ProductService {
    repository: Arc<dyn ProductRepository>,
    config: ServiceConfig,
}

impl ProductService {
    pub fn new(repository: Arc<dyn ProductRepository>, config: ServiceConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Creates a product, in draft unless `on_sale` is set.
    #[tracing::instrument(skip(self, cmd), fields(name = %cmd.name))]
    pub async fn create_product(&self, cmd: CreateProduct) -> Result<Product, DomainError> {
        let deadline = self.config.deadline();
        let mut product = Product::new(
            cmd.id.unwrap_or_else(ProductId::generate),
            cmd.name,
            cmd.description,
            cmd.price,
            cmd.stock,
        );
        product.validate()?;
        if cmd.on_sale {
            product.put_on_sale()?;
        }

        let version = deadline
            .run("save product", self.repository.save(&product))
            .await
            .with_context(|| format!("failed to create product {}", product.id()))?;
        product.set_version(version);

        tracing::info!(product_id = %product.id(), status = %product.status(), "product created");
        Ok(product)
    }

    /// Applies a partial update.
    #[tracing::instrument(skip(self, update))]
    pub async fn update_product(
        &self,
        product_id: &ProductId,
        update: UpdateProduct,
    ) -> Result<Product, DomainError> {
        let (product, ()) = self
            .mutate("update product", product_id, &self.config.deadline(), |p| {
                if update.name.is_some() || update.description.is_some() {
                    let name = update.name.clone().unwrap_or_else(|| p.name().to_string());
                    let description = update
                        .description
                        .clone()
                        .unwrap_or_else(|| p.description().to_string());
                    p.update_details(name, description)?;
                }
                if let Some(price) = &update.price {
                    p.update_price(price.clone())?;
                }
                if let Some(stock) = update.stock {
                    p.set_stock(stock)?;
                }
                Ok(())
            })
            .await?;
        Ok(product)
    }

    /// Loads a product; fails with `ProductNotFound` if absent.
    #[tracing::instrument(skip(self))]
    pub async fn get_product(&self, product_id: &ProductId) -> Result<Product, DomainError> {
        self.get_product_within(product_id, &self.config.deadline())
            .await
    }

    pub(crate) async fn get_product_within(
        &self,
        product_id: &ProductId,
        deadline: &Deadline,
    ) -> Result<Product, DomainError> {
        deadline
            .run("load product", self.repository.find_by_id(product_id))
            .await?
            .ok_or_else(|| DomainError::ProductNotFound(product_id.clone()))
    }

    /// Lists every product, ordered by id.
    #[tracing::instrument(skip(self))]
    pub async fn list_products(&self) -> Result<Vec<Product>, DomainError> {
        self.config
            .deadline()
            .run("list products", self.repository.find_all())
            .await
    }

    /// Marks a product deleted. The record is kept so existing orders can
    /// still release their holds.
    #[tracing::instrument(skip(self))]
    pub async fn delete_product(&self, product_id: &ProductId) -> Result<Product, DomainError> {
        let (product, ()) = self
            .mutate("delete product", product_id, &self.config.deadline(), |p| {
                p.delete()
            })
            .await?;
        tracing::info!(%product_id, "product deleted");
        Ok(product)
    }

    #[tracing::instrument(skip(self))]
    pub async fn put_on_sale(&self, product_id: &ProductId) -> Result<Product, DomainError> {
        let (product, ()) = self
            .mutate("put product on sale", product_id, &self.config.deadline(), |p| {
                p.put_on_sale()
            })
            .await?;
        Ok(product)
    }

    #[tracing::instrument(skip(self))]
    pub async fn take_off_sale(&self, product_id: &ProductId) -> Result<Product, DomainError> {
        let (product, ()) = self
            .mutate("take product off sale", product_id, &self.config.deadline(), |p| {
                p.take_off_sale()
            })
            .await?;
        Ok(product)
    }

    /// Adds replenished stock; a sold-out product goes back on sale.
    #[tracing::instrument(skip(self))]
    pub async fn restock(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<Product, DomainError> {
        let (product, ()) = self
            .mutate("restock product", product_id, &self.config.deadline(), |p| {
                p.restock(quantity)
            })
            .await?;
        tracing::info!(%product_id, quantity, stock = product.stock(), "product restocked");
        Ok(product)
    }

    /// Returns true if the product is on sale with at least `quantity` in stock.
    #[tracing::instrument(skip(self))]
    pub async fn has_sufficient_stock(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<bool, DomainError> {
        let product = self.get_product(product_id).await?;
        Ok(product.has_sufficient_stock(quantity))
    }

    /// Sets the hold of `order_id` on a product to `quantity`.
    ///
    /// Repeating the call with the same quantity changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn reserve_stock(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
        quantity: u32,
    ) -> Result<Product, DomainError> {
        self.reserve_stock_within(product_id, order_id, quantity, &self.config.deadline())
            .await
    }

    pub(crate) async fn reserve_stock_within(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
        quantity: u32,
        deadline: &Deadline,
    ) -> Result<Product, DomainError> {
        let (product, changed) = self
            .mutate("reserve stock", product_id, deadline, |p| {
                p.reserve(order_id, quantity)
            })
            .await
            .with_context(|| format!("failed to reserve stock for product {product_id}"))?;

        if changed {
            metrics::counter!("stock_reservations_total").increment(1);
            tracing::info!(
                %product_id,
                %order_id,
                quantity,
                stock = product.stock(),
                status = %product.status(),
                "stock reserved"
            );
        }
        Ok(product)
    }

    /// Returns the hold of `order_id` to stock. Returns the released
    /// quantity, or `None` if there was no hold.
    #[tracing::instrument(skip(self))]
    pub async fn release_stock(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
    ) -> Result<Option<u32>, DomainError> {
        self.release_stock_within(product_id, order_id, &self.config.deadline())
            .await
    }

    pub(crate) async fn release_stock_within(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
        deadline: &Deadline,
    ) -> Result<Option<u32>, DomainError> {
        let (product, released) = self
            .mutate("release stock", product_id, deadline, |p| {
                Ok(p.release(&order_id))
            })
            .await
            .with_context(|| format!("failed to release stock for product {product_id}"))?;

        if let Some(quantity) = released {
            metrics::counter!("stock_releases_total").increment(1);
            tracing::info!(
                %product_id,
                %order_id,
                quantity,
                stock = product.stock(),
                status = %product.status(),
                "stock released"
            );
        }
        Ok(released)
    }

    /// Finalizes the hold of `order_id`: the units stay sold.
    #[tracing::instrument(skip(self))]
    pub async fn commit_stock(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
    ) -> Result<Option<u32>, DomainError> {
        self.commit_stock_within(product_id, order_id, &self.config.deadline())
            .await
    }

    pub(crate) async fn commit_stock_within(
        &self,
        product_id: &ProductId,
        order_id: OrderId,
        deadline: &Deadline,
    ) -> Result<Option<u32>, DomainError> {
        let (_, committed) = self
            .mutate("commit stock", product_id, deadline, |p| Ok(p.commit(&order_id)))
            .await
            .with_context(|| format!("failed to commit stock for product {product_id}"))?;
        Ok(committed)
    }

    /// Loads a product, applies `apply` and writes it back conditionally,
    /// retrying from a fresh read on version conflicts.
    async fn mutate<T, F>(
        &self,
        operation: &'static str,
        product_id: &ProductId,
        deadline: &Deadline,
        mut apply: F,
    ) -> Result<(Product, T), DomainError>
    where
        F: FnMut(&mut Product) -> Result<T, ProductError>,
    {
        let mut retries = 0;
        loop {
            let mut product = self.get_product_within(product_id, deadline).await?;
            let value = apply(&mut product)?;

            match deadline
                .run(operation, self.repository.update(&product))
                .await
            {
                Ok(version) => {
                    product.set_version(version);
                    return Ok((product, value));
                }
                Err(DomainError::Repository(e))
                    if e.is_conflict() && retries < self.config.max_conflict_retries =>
                {
                    retries += 1;
                    metrics::counter!("stock_conflict_retries_total").increment(1);
                    tracing::debug!(%product_id, operation, retries, "version conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
