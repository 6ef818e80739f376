//! Geofence Monitor Service: standalone binary that watches memo locations
//! and sends an arrival notification when the device comes within range.
//!
//! Devices report positions and manage memos over an RPC API.
//! Default: http://127.0.0.1:9104/

mod config;
mod db;
mod dedup;
mod geo;
mod memo_store;
mod monitor;
mod notifier;
mod position;
mod routes;

use monitor::{GeofenceMonitor, MonitorSettings};
use notifier::{LogNotifier, Notifier, WebhookNotifier};
use position::{AccuracyHint, ReportedPositionSource};
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = config::ServiceConfig::from_env();

    log::info!("Opening database at: {}", config.db_path);
    let database = Arc::new(db::Db::open(&config.db_path).expect("Failed to open database"));

    let memos = Arc::new(memo_store::MemoStore::new(database.clone()));
    let positions = Arc::new(ReportedPositionSource::new(config.position_max_age()));

    let notifier: Arc<dyn Notifier> = match &config.notify_callback_url {
        Some(url) => {
            log::info!("Arrival notifications will be posted to {}", url);
            let client = reqwest::Client::builder()
                .timeout(config.notify_timeout())
                .build()
                .expect("Failed to build HTTP client");
            Arc::new(WebhookNotifier::new(client, url.clone()))
        }
        None => {
            log::warn!("GEOFENCE_NOTIFY_CALLBACK_URL not set, arrivals will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let monitor = Arc::new(GeofenceMonitor::new(
        MonitorSettings {
            poll_interval: config.poll_interval(),
            position_timeout: config.position_timeout(),
            accuracy: AccuracyHint::Low,
            notify_timeout: config.notify_timeout(),
        },
        memos.clone(),
        positions.clone(),
        notifier,
        database.clone(),
    ));

    // Resume monitoring if it was on before the last shutdown
    if config.autostart && monitor::monitoring_intent(database.as_ref()) {
        if monitor.start_monitoring().await {
            log::info!("Resumed geofence monitoring from previous session");
        } else {
            log::error!("Failed to resume geofence monitoring");
        }
    }

    let state = Arc::new(AppState {
        db: database.clone(),
        memos,
        monitor,
        positions,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Memos
        .route("/rpc/memos/list", axum::routing::get(routes::memos_list))
        .route("/rpc/memos/get", axum::routing::post(routes::memos_get))
        .route("/rpc/memos/add", axum::routing::post(routes::memos_add))
        .route(
            "/rpc/memos/update",
            axum::routing::post(routes::memos_update),
        )
        .route(
            "/rpc/memos/complete",
            axum::routing::post(routes::memos_complete),
        )
        .route(
            "/rpc/memos/delete",
            axum::routing::post(routes::memos_delete),
        )
        // Items
        .route("/rpc/items/add", axum::routing::post(routes::items_add))
        .route(
            "/rpc/items/toggle",
            axum::routing::post(routes::items_toggle),
        )
        .route(
            "/rpc/items/delete",
            axum::routing::post(routes::items_delete),
        )
        // Locations
        .route(
            "/rpc/locations/add",
            axum::routing::post(routes::locations_add),
        )
        .route(
            "/rpc/locations/update",
            axum::routing::post(routes::locations_update),
        )
        .route(
            "/rpc/locations/delete",
            axum::routing::post(routes::locations_delete),
        )
        // Position & monitor
        .route(
            "/rpc/position/report",
            axum::routing::post(routes::position_report),
        )
        .route(
            "/rpc/position/unavailable",
            axum::routing::post(routes::position_unavailable),
        )
        .route(
            "/rpc/monitor/start",
            axum::routing::post(routes::monitor_start),
        )
        .route(
            "/rpc/monitor/stop",
            axum::routing::post(routes::monitor_stop),
        )
        .route(
            "/rpc/monitor/status",
            axum::routing::get(routes::monitor_status),
        )
        .route("/rpc/cache/list", axum::routing::get(routes::cache_list))
        // Service
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Geofence Monitor Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
