//! Concurrent reservations must never oversell a product.

use std::sync::Arc;

use common::{Money, OrderId, ProductId};
use domain::{
    CancelOrder, CreateOrder, CreateProduct, ErrorKind, InMemoryOrderRepository,
    InMemoryProductRepository, OrderService, ProductService, ProductStatus, ServiceConfig,
};
use event_bus::InMemoryEventBus;
use rust_decimal_macros::dec;

fn config() -> ServiceConfig {
    ServiceConfig::default().with_max_conflict_retries(1_000)
}

async fn product_service(stock: u32) -> ProductService {
    let service = ProductService::new(Arc::new(InMemoryProductRepository::new()), config());
    service
        .create_product(
            CreateProduct::new("Limited", Money::new(dec!(99.00), "CNY"), stock)
                .with_id("LIMITED")
                .on_sale(),
        )
        .await
        .unwrap();
    service
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_do_not_oversell() {
    let products = product_service(30).await;
    let id = ProductId::new("LIMITED");

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let products = products.clone();
            let id = id.clone();
            tokio::spawn(async move { products.reserve_stock(&id, OrderId::new(), 1).await })
        })
        .collect();

    let mut reserved = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => reserved += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::InsufficientStock);
                rejected += 1;
            }
        }
    }

    assert_eq!(reserved, 30);
    assert_eq!(rejected, 20);

    let product = products.get_product(&id).await.unwrap();
    assert_eq!(product.stock(), 0);
    assert_eq!(product.reserved_total(), 30);
    assert_eq!(product.status(), ProductStatus::SoldOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_orders_and_cancellations_balance_stock() {
    let products = product_service(10).await;
    let service = OrderService::new(
        Arc::new(InMemoryOrderRepository::new()),
        products.clone(),
        Arc::new(InMemoryEventBus::new()),
        config(),
    );

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .create_order(CreateOrder::new(format!("user-{i}")).line("LIMITED", 1))
                    .await
            })
        })
        .collect();

    let mut placed = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(order) => placed.push(order),
            Err(e) => assert_eq!(e.kind(), ErrorKind::InsufficientStock),
        }
    }
    assert_eq!(placed.len(), 10);

    let id = ProductId::new("LIMITED");
    assert_eq!(products.get_product(&id).await.unwrap().stock(), 0);

    let cancels: Vec<_> = placed
        .iter()
        .map(|order| {
            let service = service.clone();
            let order_id = order.id();
            tokio::spawn(async move { service.cancel_order(CancelOrder::new(order_id)).await })
        })
        .collect();
    for cancel in cancels {
        assert!(cancel.await.unwrap().unwrap().is_fully_released());
    }

    let product = products.get_product(&id).await.unwrap();
    assert_eq!(product.stock(), 10);
    assert_eq!(product.reserved_total(), 0);
    assert_eq!(product.status(), ProductStatus::OnSale);
}
