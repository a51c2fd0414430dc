//! Activity log inspection and pruning.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use fazt_core::telemetry;

use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs/activity", get(activity))
        .route("/logs/prune", post(prune))
}

#[derive(Deserialize)]
struct ActivityQuery {
    #[serde(default)]
    min_weight: u8,
    limit: Option<usize>,
}

async fn activity(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(200).min(2000);
    let entries = telemetry::read_activity(&state.storage, params.min_weight, limit).await?;
    Ok(data(entries))
}

#[derive(Deserialize)]
struct PruneRequest {
    /// Entries at or below this weight are eligible.
    max_weight: u8,
    /// Only entries older than this many hours are pruned.
    #[serde(default)]
    older_than_hours: i64,
}

async fn prune(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PruneRequest>,
) -> Result<Json<Value>, ApiError> {
    let cutoff = Utc::now() - Duration::hours(body.older_than_hours);
    let pruned =
        telemetry::prune_activity(&state.storage, &state.queue, body.max_weight, cutoff).await?;
    Ok(data(json!({ "pruned": pruned })))
}
