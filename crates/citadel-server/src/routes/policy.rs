//! ACL policy routes: `/v1/sys/policies/acl`.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use citadel_core::engine::Operation;
use citadel_core::error::CoreError;
use citadel_core::policy::{PathRule, Policy};

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;

/// Build the `/v1/sys/policies/acl` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/:name", get(read).put(write).delete(remove))
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/policies/acl",
            Operation::List,
            false,
        )
        .await?;
    let names = state
        .core
        .policies()
        .list()
        .await
        .map_err(CoreError::from)?;
    Ok(Json(serde_json::json!({ "policies": names })))
}

#[derive(Debug, Serialize)]
struct PolicyResponse {
    name: String,
    rules: Vec<PathRule>,
    cas_version: u64,
}

async fn read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<PolicyResponse>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/policies/acl/{name}"),
            Operation::Read,
            false,
        )
        .await?;
    let policy = state
        .core
        .policies()
        .get(&name)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(PolicyResponse {
        name: policy.name.clone(),
        rules: policy.paths.clone(),
        cas_version: policy.cas_version,
    }))
}

#[derive(Debug, Deserialize)]
struct WritePolicyRequest {
    rules: Vec<PathRule>,
    /// Check-and-set: reject unless the stored version matches.
    #[serde(default)]
    cas: Option<u64>,
}

async fn write(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<WritePolicyRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/policies/acl/{name}"),
            Operation::Update,
            true,
        )
        .await?;
    state
        .core
        .policies()
        .set(
            Policy {
                name,
                paths: body.rules,
                cas_version: 0,
            },
            body.cas,
        )
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            &format!("sys/policies/acl/{name}"),
            Operation::Delete,
            true,
        )
        .await?;
    state
        .core
        .policies()
        .delete(&name)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}
