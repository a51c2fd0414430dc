//! User management: list, role edits.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use fazt_core::users::Role;

use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/{id}/role", put(set_role))
}

async fn list_users(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let users = state.users.list().await?;
    Ok(data(users))
}

#[derive(Deserialize)]
struct RoleRequest {
    role: Role,
}

async fn set_role(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RoleRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.users.set_role(&id, body.role).await?;
    Ok(data(user))
}
