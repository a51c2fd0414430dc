//! Alias management: list, upsert, delete, atomic swap.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use fazt_core::alias::AliasRecord;

use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/aliases", get(list_aliases).post(upsert_alias))
        .route("/aliases/{subdomain}", axum::routing::delete(delete_alias))
        .route("/aliases/swap", post(swap_aliases))
}

async fn list_aliases(State(state): State<Arc<AppState>>) -> Json<Value> {
    data(state.aliases.list().await)
}

async fn upsert_alias(
    State(state): State<Arc<AppState>>,
    Json(record): Json<AliasRecord>,
) -> Result<Json<Value>, ApiError> {
    state.aliases.upsert(record.clone()).await?;
    Ok(data(record))
}

async fn delete_alias(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.aliases.delete(&subdomain).await?;
    Ok(data(json!({ "deleted": subdomain })))
}

#[derive(Deserialize)]
struct SwapRequest {
    a: String,
    b: String,
}

async fn swap_aliases(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SwapRequest>,
) -> Result<Json<Value>, ApiError> {
    state.aliases.swap(&body.a, &body.b).await?;
    Ok(data(json!({ "swapped": [body.a, body.b] })))
}
