//! Demo entry point.

use demo::config::{Config, LogFormat};
use domain::ServiceConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Wire in-memory services
    let service_config = ServiceConfig::from_env();
    tracing::info!(
        currency = %service_config.currency,
        cancellation_policy = %service_config.cancellation_policy,
        timeout_ms = service_config.operation_timeout.map(|t| t.as_millis() as u64),
        "starting demo"
    );
    let app = demo::create_app(service_config)
        .await
        .expect("failed to wire services");

    // 4. Run the scenario
    match demo::run_scenario(&app).await {
        Ok(report) => tracing::info!(?report, "scenario finished"),
        Err(e) => {
            tracing::error!(error = %e, kind = %e.kind(), "scenario failed");
            std::process::exit(1);
        }
    }

    // 5. Dump metrics
    println!("{}", metrics_handle.render());
}
