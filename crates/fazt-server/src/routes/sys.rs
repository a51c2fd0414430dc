//! System endpoints: capacity, recalibration, stats, maintenance.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use fazt_core::capacity::{Capacity, CapacityOverrides};

use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sys/capacity", get(get_capacity).put(put_capacity))
        .route("/sys/recalibrate", post(recalibrate))
        .route("/sys/stats", get(stats))
        .route("/sys/maintenance", post(maintenance))
}

async fn get_capacity(State(state): State<Arc<AppState>>) -> Json<Value> {
    data(json!({
        "capacity": state.capacity.get(),
        "overrides": state.overrides(),
    }))
}

/// Apply the full effective capacity across subsystems.
fn apply(state: &AppState, capacity: &Capacity) {
    state.capacity.set(capacity.clone());
    state.vfs.set_budget(capacity.vfs_cache_bytes);
    state.limits.reconfigure(
        capacity.rate_per_second,
        capacity.rate_burst,
        capacity.max_connections_per_ip,
    );
}

async fn put_capacity(
    State(state): State<Arc<AppState>>,
    Json(overrides): Json<CapacityOverrides>,
) -> Result<Json<Value>, ApiError> {
    let capacity = state
        .capacity_store
        .recalibrate(&state.queue, overrides.clone())
        .await?;
    state.set_overrides(overrides);
    apply(&state, &capacity);
    info!("capacity overrides applied");
    Ok(data(capacity))
}

async fn recalibrate(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let capacity = state
        .capacity_store
        .recalibrate(&state.queue, state.overrides())
        .await?;
    apply(&state, &capacity);
    info!("capacity recalibrated");
    Ok(data(capacity))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    data(json!({
        "vfs": state.vfs.stats(),
        "queue": {
            "depth": state.queue.depth(),
            "pending": state.queue.pending(),
            "completed": state.queue.completed(),
        },
        "telemetry": state.telemetry.stats(),
        "circuit": state.circuit_count(),
        "maintenance": state.in_maintenance(),
    }))
}

#[derive(Deserialize)]
struct MaintenanceRequest {
    on: bool,
}

async fn maintenance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MaintenanceRequest>,
) -> Json<Value> {
    state.set_maintenance(body.on);
    info!(on = body.on, "maintenance mode set");
    data(json!({ "maintenance": body.on }))
}
