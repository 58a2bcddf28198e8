//! Order management domain.
//!
//! This crate provides:
//! - Product entity with stock, per-order holds and an on-sale state machine
//! - Order aggregate with item management, payment and a status state machine
//! - Repository traits with optimistic concurrency and in-memory implementations
//! - Services that coordinate orders, stock reservation and event publication

pub mod config;
pub mod deadline;
pub mod error;
pub mod event;
pub mod order;
pub mod product;
pub mod repository;
pub mod reservation;

pub use config::{CancellationPolicy, ServiceConfig};
pub use deadline::Deadline;
pub use error::{DomainError, ErrorKind, ResultExt};
pub use event::DomainEvent;
pub use order::{
    AddItem, CancelOrder, CancelOutcome, CreateOrder, DeliverOrder, InMemoryOrderRepository,
    Order, OrderError, OrderEvent, OrderItem, OrderLine, OrderRepository, OrderService,
    OrderStatus, PayOrder, PaymentChannel, PaymentInfo, PaymentMethod, RemoveItem, ShipOrder,
    UpdateRemark,
};
pub use product::{
    CreateProduct, InMemoryProductRepository, Product, ProductError, ProductRepository,
    ProductService, ProductStatus, UpdateProduct,
};
pub use repository::{RepositoryError, RepositoryResult};
pub use reservation::{
    HoldResolution, ReconcileFailure, ReconcileReport, ReleaseFailure, ReleaseReport,
    ReservationSaga, ReservationState, StrandedHold, release_holds,
};
