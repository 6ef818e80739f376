//! Axum route handlers for the geofence monitor RPC API.

use crate::db::Db;
use crate::memo_store::{MemoStore, MemoStoreError, NewLocation};
use crate::monitor::{self, GeofenceMonitor};
use crate::position::ReportedPositionSource;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use geofence_monitor_types::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub db: Arc<Db>,
    pub memos: Arc<MemoStore>,
    pub monitor: Arc<GeofenceMonitor>,
    pub positions: Arc<ReportedPositionSource>,
    pub start_time: Instant,
}

type RpcResult<T> = (StatusCode, Json<RpcResponse<T>>);

fn ok<T: Serialize>(data: T) -> RpcResult<T> {
    (StatusCode::OK, Json(RpcResponse::ok(data)))
}

fn store_error<T: Serialize>(e: MemoStoreError) -> RpcResult<T> {
    let status = match &e {
        MemoStoreError::NotFound(_) => StatusCode::NOT_FOUND,
        MemoStoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        MemoStoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(RpcResponse::err(e.to_string())))
}

// =====================================================
// Memo Endpoints
// =====================================================

// GET /rpc/memos/list
pub async fn memos_list(State(state): State<Arc<AppState>>) -> RpcResult<Vec<Memo>> {
    match state.memos.list() {
        Ok(memos) => ok(memos),
        Err(e) => store_error(e),
    }
}

// POST /rpc/memos/get
pub async fn memos_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MemoIdRequest>,
) -> RpcResult<Memo> {
    match state.memos.get(&req.id) {
        Ok(Some(memo)) => ok(memo),
        Ok(None) => store_error(MemoStoreError::NotFound(format!("Memo {}", req.id))),
        Err(e) => store_error(e),
    }
}

// POST /rpc/memos/add
pub async fn memos_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddMemoRequest>,
) -> RpcResult<Memo> {
    match state.memos.add_memo(&req.title) {
        Ok(memo) => ok(memo),
        Err(e) => store_error(e),
    }
}

// POST /rpc/memos/update
pub async fn memos_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateMemoRequest>,
) -> RpcResult<Memo> {
    match state
        .memos
        .update_memo(&req.id, req.title.as_deref(), req.notification_enabled)
    {
        Ok(memo) => ok(memo),
        Err(e) => store_error(e),
    }
}

// POST /rpc/memos/complete
pub async fn memos_complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteMemoRequest>,
) -> RpcResult<Memo> {
    match state.memos.set_completed(&req.id, req.completed) {
        Ok(memo) => {
            if memo.completed {
                state.monitor.on_memo_completed(&memo.id).await;
            }
            ok(memo)
        }
        Err(e) => store_error(e),
    }
}

// POST /rpc/memos/delete
pub async fn memos_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MemoIdRequest>,
) -> RpcResult<bool> {
    match state.memos.delete_memo(&req.id) {
        Ok(true) => {
            state.monitor.on_memo_deleted(&req.id).await;
            ok(true)
        }
        Ok(false) => store_error(MemoStoreError::NotFound(format!("Memo {}", req.id))),
        Err(e) => store_error(e),
    }
}

// =====================================================
// Item Endpoints
// =====================================================

// POST /rpc/items/add
pub async fn items_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddItemRequest>,
) -> RpcResult<ShoppingItem> {
    match state.memos.add_item(&req.memo_id, &req.name) {
        Ok(item) => ok(item),
        Err(e) => store_error(e),
    }
}

// POST /rpc/items/toggle
pub async fn items_toggle(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ItemRequest>,
) -> RpcResult<ShoppingItem> {
    match state.memos.toggle_item(&req.memo_id, &req.item_id) {
        Ok(item) => ok(item),
        Err(e) => store_error(e),
    }
}

// POST /rpc/items/delete
pub async fn items_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ItemRequest>,
) -> RpcResult<bool> {
    match state.memos.delete_item(&req.memo_id, &req.item_id) {
        Ok(true) => ok(true),
        Ok(false) => store_error(MemoStoreError::NotFound(format!("Item {}", req.item_id))),
        Err(e) => store_error(e),
    }
}

// =====================================================
// Location Endpoints
// =====================================================

// POST /rpc/locations/add
pub async fn locations_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddLocationRequest>,
) -> RpcResult<MemoLocation> {
    let new = NewLocation {
        label: req.label,
        latitude: req.latitude,
        longitude: req.longitude,
        radius: req.radius,
        address: req.address,
    };
    match state.memos.add_location(&req.memo_id, new) {
        Ok(location) => ok(location),
        Err(e) => store_error(e),
    }
}

// POST /rpc/locations/update
pub async fn locations_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateLocationRequest>,
) -> RpcResult<MemoLocation> {
    match state.memos.update_location(&req) {
        Ok(location) => ok(location),
        Err(e) => store_error(e),
    }
}

// POST /rpc/locations/delete
pub async fn locations_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteLocationRequest>,
) -> RpcResult<bool> {
    match state.memos.delete_location(&req.memo_id, &req.location_id) {
        Ok(true) => {
            state
                .monitor
                .on_location_deleted(&req.memo_id, &req.location_id)
                .await;
            ok(true)
        }
        Ok(false) => store_error(MemoStoreError::NotFound(format!(
            "Location {}",
            req.location_id
        ))),
        Err(e) => store_error(e),
    }
}

// =====================================================
// Position & Monitor Endpoints
// =====================================================

// POST /rpc/position/report
pub async fn position_report(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReportPositionRequest>,
) -> RpcResult<Position> {
    match state
        .positions
        .report(req.latitude, req.longitude, req.accuracy_m)
    {
        Ok(position) => ok(position),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// POST /rpc/position/unavailable
pub async fn position_unavailable(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PositionUnavailableRequest>,
) -> RpcResult<bool> {
    let reason = req
        .reason
        .unwrap_or_else(|| "location unavailable".to_string());
    log::info!("[GEOFENCE] Device reported position unavailable: {}", reason);
    state.positions.report_unavailable(&reason);
    ok(true)
}

// POST /rpc/monitor/start
pub async fn monitor_start(State(state): State<Arc<AppState>>) -> RpcResult<MonitorStatus> {
    if !state.monitor.start_monitoring().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err("Failed to start monitoring")),
        );
    }
    monitor::set_monitoring_intent(state.db.as_ref(), true);
    ok(state.monitor.status())
}

// POST /rpc/monitor/stop
pub async fn monitor_stop(State(state): State<Arc<AppState>>) -> RpcResult<MonitorStatus> {
    state.monitor.stop_monitoring().await;
    monitor::set_monitoring_intent(state.db.as_ref(), false);
    ok(state.monitor.status())
}

// GET /rpc/monitor/status
pub async fn monitor_status(State(state): State<Arc<AppState>>) -> RpcResult<MonitorStatus> {
    ok(state.monitor.status())
}

// GET /rpc/cache/list
pub async fn cache_list(State(state): State<Arc<AppState>>) -> RpcResult<Vec<GeofenceKey>> {
    ok(state.monitor.inside_keys().await)
}

// =====================================================
// Service Endpoints
// =====================================================

// GET /rpc/status
pub async fn status(State(state): State<Arc<AppState>>) -> RpcResult<ServiceStatus> {
    let memos = state.memos.list().unwrap_or_default();

    let status = ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_memos: memos.len(),
        active_memos: memos.iter().filter(|m| m.is_active()).count(),
        monitor: state.monitor.status(),
    };

    ok(status)
}
