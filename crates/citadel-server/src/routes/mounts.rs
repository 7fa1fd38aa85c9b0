//! Mount management routes: `/v1/sys/mounts` and `/v1/sys/remount`.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use citadel_core::engine::Operation;
use citadel_core::mount::{MountConfig, MountEntry};

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;

/// Build the `/v1/sys/mounts` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/:path", post(mount).delete(unmount))
        .route("/:path/tune", post(tune))
}

/// Build the `/v1/sys/remount` router.
pub fn remount_router() -> Router<AppState> {
    Router::new().route("/", post(remount))
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/mounts",
            Operation::Read,
            false,
        )
        .await?;

    let mut out = serde_json::Map::new();
    for entry in state.core.list_mounts().await {
        out.insert(
            entry.path.clone(),
            serde_json::json!({
                "uuid": entry.uuid,
                "type": entry.entry_type,
                "accessor": entry.accessor,
                "description": entry.description,
                "config": entry.config,
                "local": entry.local,
                "seal_wrap": entry.seal_wrap,
                "running_version": entry.running_version,
                "version": entry.version,
            }),
        );
    }
    Ok(Json(serde_json::Value::Object(out)))
}

#[derive(Debug, Deserialize)]
struct MountRequest {
    #[serde(rename = "type")]
    engine_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    options: HashMap<String, String>,
    #[serde(default)]
    local: bool,
    #[serde(default)]
    seal_wrap: bool,
}

async fn mount(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(body): Json<MountRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/mounts/{path}"),
            Operation::Update,
            true,
        )
        .await?;

    let mut entry = MountEntry::new(path, body.engine_type);
    entry.description = body.description;
    entry.config.options = body.options;
    entry.local = body.local;
    entry.seal_wrap = body.seal_wrap;
    state.core.mount_engine(entry).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unmount(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/mounts/{path}"),
            Operation::Delete,
            true,
        )
        .await?;
    state.core.unmount_engine(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TuneRequest {
    #[serde(default)]
    default_lease_ttl: Option<i64>,
    #[serde(default)]
    max_lease_ttl: Option<i64>,
    #[serde(default)]
    options: HashMap<String, String>,
    /// Check-and-set on the mount entry version.
    #[serde(default)]
    cas: Option<u64>,
}

async fn tune(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(body): Json<TuneRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/mounts/{path}/tune"),
            Operation::Update,
            true,
        )
        .await?;

    let updated = state
        .core
        .tune_mount(
            &path,
            MountConfig {
                default_lease_ttl: body.default_lease_ttl,
                max_lease_ttl: body.max_lease_ttl,
                options: body.options,
            },
            body.cas,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "path": updated.path,
        "config": updated.config,
        "version": updated.version,
    })))
}

#[derive(Debug, Deserialize)]
struct RemountRequest {
    from: String,
    to: String,
}

async fn remount(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RemountRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/remount",
            Operation::Update,
            true,
        )
        .await?;
    state.core.remount_engine(&body.from, &body.to).await?;
    Ok(StatusCode::NO_CONTENT)
}
