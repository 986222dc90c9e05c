use crate::cli::ServeArgs;
use crate::infra::{demo_draw, AppState, InMemoryDrawRepository, LoggingNotificationPublisher};
use crate::routes::with_draw_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Local;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use suite_draw::config::AppConfig;
use suite_draw::error::AppError;
use suite_draw::telemetry;
use suite_draw::workflows::draw::{DrawLifecycle, NotificationDispatcher};
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let repository = Arc::new(InMemoryDrawRepository::default());
    let lifecycle = Arc::new(DrawLifecycle::new(repository.clone()));
    if !args.no_seed {
        let seeded = lifecycle.open_draw(demo_draw(Local::now().date_naive()))?;
        info!(draw_id = %seeded.id(), "demo draw registered");
    }

    let dispatcher = NotificationDispatcher::new(
        repository,
        Arc::new(LoggingNotificationPublisher::default()),
        config.notifications.batch_size,
    );
    tokio::spawn(dispatcher.run(config.notifications.dispatch_interval()));

    let app = with_draw_routes(lifecycle)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "suite draw service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
