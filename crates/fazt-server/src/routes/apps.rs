//! App management: list, inspect, create, fork, deploy, delete.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use fazt_core::deploy::DeployPayload;

use crate::error::ApiError;
use crate::routes::data;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/{id}", get(inspect_app).delete(delete_app))
        .route("/apps/{id}/fork", post(fork_app))
        .route("/apps/{id}/deploy", post(deploy_app))
}

async fn list_apps(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let apps = state.apps.list().await?;
    Ok(data(apps))
}

#[derive(Deserialize)]
struct CreateAppRequest {
    title: String,
}

async fn create_app(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAppRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.title.trim().is_empty() {
        return Err(ApiError::Validation("title must not be empty".to_owned()));
    }
    let app = state.apps.create(body.title.trim(), "deploy").await?;
    Ok(data(app))
}

async fn inspect_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let app = state.apps.get(&id).await?;

    let aliases: Vec<String> = state
        .aliases
        .list()
        .await
        .into_iter()
        .filter(|record| match &record.target {
            fazt_core::alias::AliasTarget::Proxy { app_id } => *app_id == id,
            fazt_core::alias::AliasTarget::Split { targets } => {
                targets.iter().any(|t| t.app_id == id)
            }
            _ => false,
        })
        .map(|record| record.subdomain)
        .collect();

    // File stats from the stored metadata.
    let meta_prefix = format!("vfsmeta/{id}/");
    let pairs = state
        .storage
        .scan(&meta_prefix)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut total_bytes = 0u64;
    for (_, bytes) in &pairs {
        if let Ok(meta) = serde_json::from_slice::<fazt_core::vfs::FileMeta>(bytes) {
            total_bytes += meta.size;
        }
    }

    Ok(data(json!({
        "app": app,
        "aliases": aliases,
        "files": pairs.len(),
        "bytes": total_bytes,
    })))
}

async fn delete_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.apps.delete(&id).await?;
    let removed_aliases = state.aliases.delete_for_app(&id).await?;
    state.vfs.invalidate_app(&id);
    Ok(data(json!({ "deleted": id, "aliases_removed": removed_aliases })))
}

#[derive(Deserialize)]
struct ForkRequest {
    title: Option<String>,
    #[serde(default)]
    copy_storage: bool,
}

async fn fork_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ForkRequest>,
) -> Result<Json<Value>, ApiError> {
    let fork = state
        .apps
        .fork(&id, body.title, body.copy_storage)
        .await?;
    Ok(data(fork))
}

async fn deploy_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<DeployPayload>,
) -> Result<Json<Value>, ApiError> {
    let max = state.capacity.get().max_upload_bytes;
    let summary = state.deployer.deploy(&id, payload, max).await?;
    Ok(data(summary))
}
