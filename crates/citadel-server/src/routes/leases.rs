//! Lease management routes: `/v1/sys/leases`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;

use citadel_core::engine::Operation;
use citadel_core::error::CoreError;

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;

/// Build the `/v1/sys/leases` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/lookup", put(lookup).post(lookup))
        .route("/renew", put(renew).post(renew))
        .route("/revoke", put(revoke).post(revoke))
        .route("/revoke-force", put(revoke_force).post(revoke_force))
        .route("/revoke-prefix", put(revoke_prefix).post(revoke_prefix))
}

#[derive(Debug, Deserialize)]
struct LeaseIdRequest {
    lease_id: String,
}

async fn lookup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeaseIdRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/leases/lookup",
            Operation::Update,
            false,
        )
        .await?;

    let lease = state
        .core
        .expiration()
        .lookup(&body.lease_id)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(serde_json::json!({
        "id": lease.lease_id,
        "issue_time": lease.issue_time.to_rfc3339(),
        "expire_time": lease.expire_time.to_rfc3339(),
        "last_renewal": lease.last_renewal.map(|t| t.to_rfc3339()),
        "renewable": lease.renewable,
        "ttl": lease.ttl_secs(chrono_now()),
        "irrevocable": lease.irrevocable,
    })))
}

#[derive(Debug, Deserialize)]
struct RenewRequest {
    lease_id: String,
    #[serde(default)]
    increment: Option<i64>,
}

async fn renew(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RenewRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/leases/renew",
            Operation::Update,
            false,
        )
        .await?;

    let increment = body
        .increment
        .unwrap_or(state.core.config().default_lease_ttl);
    let lease = state
        .core
        .expiration()
        .renew(&body.lease_id, increment)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(serde_json::json!({
        "lease_id": lease.lease_id,
        "lease_duration": lease.ttl_secs(chrono_now()),
        "renewable": lease.renewable,
    })))
}

async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeaseIdRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/leases/revoke",
            Operation::Update,
            false,
        )
        .await?;
    state
        .core
        .expiration()
        .revoke(&body.lease_id, false)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_force(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeaseIdRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/leases/revoke-force",
            Operation::Update,
            true,
        )
        .await?;
    state
        .core
        .expiration()
        .revoke(&body.lease_id, true)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RevokePrefixRequest {
    prefix: String,
    #[serde(default)]
    force: bool,
}

async fn revoke_prefix(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RevokePrefixRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/leases/revoke-prefix",
            Operation::Update,
            true,
        )
        .await?;
    let revoked = state
        .core
        .expiration()
        .revoke_prefix(&body.prefix, body.force)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(serde_json::json!({ "revoked": revoked })))
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
