use domain::{OrderStatus, ServiceConfig};

#[tokio::test]
async fn scenario_restores_stock_after_cancellation() {
    let app = demo::create_app(ServiceConfig::default()).await.unwrap();
    let report = demo::run_scenario(&app).await.unwrap();

    assert_eq!(report.stock_after_create, 97);
    assert_eq!(report.status_after_pay, OrderStatus::Paid);
    assert_eq!(report.stock_after_cancel, 100);
    assert_eq!(report.status_after_cancel, OrderStatus::Cancelled);
    assert!(report.oversell_rejected);
    assert_eq!(report.events_published, 5);
}

#[tokio::test]
async fn event_logger_is_subscribed_to_everything() {
    let app = demo::create_app(ServiceConfig::default()).await.unwrap();
    assert_eq!(app.bus.subscriber_count(event_bus::ALL_EVENTS).await, 1);
}
