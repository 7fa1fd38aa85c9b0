//! System routes: initialization, seal lifecycle, key ceremonies, health.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use citadel_core::engine::Operation;
use citadel_core::rekey::{RekeyConfig, RekeyMode, RekeyOutcome, RekeyTarget};
use citadel_core::{CoreState, GenerateRootOutcome, InitParams};

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;

/// Build the `/v1/sys` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/init", post(init))
        .route("/seal-status", get(seal_status))
        .route("/health", get(health))
        .route("/unseal", post(unseal))
        .route("/seal", post(seal))
        .route("/step-down", post(step_down))
        .route("/leader", get(leader))
        .route("/rotate", post(rotate))
        .route(
            "/rekey/init",
            get(rekey_status).post(rekey_init).delete(rekey_cancel),
        )
        .route("/rekey/update", post(rekey_update))
        .route("/generate-root/attempt", post(generate_root_attempt))
        .route("/generate-root/update", post(generate_root_update))
        .route("/generate-root/cancel", delete(generate_root_cancel))
        .route("/wrapping/unwrap", post(unwrap))
}

// ── Init ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InitRequest {
    #[serde(default)]
    secret_shares: u8,
    #[serde(default)]
    secret_threshold: u8,
    #[serde(default)]
    recovery_shares: u8,
    #[serde(default)]
    recovery_threshold: u8,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    keys: Vec<String>,
    recovery_keys: Vec<String>,
    root_token: String,
}

async fn init(
    State(state): State<AppState>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let result = state
        .core
        .initialize(InitParams {
            secret_shares: body.secret_shares,
            secret_threshold: body.secret_threshold,
            recovery_shares: body.recovery_shares,
            recovery_threshold: body.recovery_threshold,
        })
        .await?;
    Ok(Json(InitResponse {
        keys: result.key_shares,
        recovery_keys: result.recovery_shares,
        root_token: result.root_token,
    }))
}

// ── Seal status / health ─────────────────────────────────────────────

async fn seal_status(State(state): State<AppState>) -> Result<Response, AppError> {
    let status = state.core.seal_status().await?;
    Ok(Json(status).into_response())
}

async fn health(State(state): State<AppState>) -> Result<Response, AppError> {
    let status = state.core.seal_status().await?;
    let code = match state.core.state().await {
        CoreState::Active => StatusCode::OK,
        CoreState::Standby => StatusCode::TOO_MANY_REQUESTS,
        CoreState::Uninitialized => StatusCode::NOT_IMPLEMENTED,
        CoreState::Sealed | CoreState::Recovery => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((code, Json(status)).into_response())
}

// ── Unseal / seal / step-down ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UnsealRequest {
    #[serde(default)]
    key: String,
    #[serde(default)]
    reset: bool,
}

async fn unseal(
    State(state): State<AppState>,
    Json(body): Json<UnsealRequest>,
) -> Result<Response, AppError> {
    if body.reset {
        state.core.reset_unseal_progress().await;
        let status = state.core.seal_status().await?;
        return Ok(Json(status).into_response());
    }

    let share = B64
        .decode(body.key.trim())
        .map_err(|_| AppError::bad_request("key share is not valid base64"))?;
    let outcome = state.core.submit_unseal_share(share).await?;
    Ok(Json(outcome).into_response())
}

async fn seal(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/seal",
            Operation::Update,
            true,
        )
        .await?;
    state.core.seal_core().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn step_down(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/step-down",
            Operation::Update,
            true,
        )
        .await?;
    state.core.step_down().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct LeaderResponse {
    ha_enabled: bool,
    is_self: bool,
    leader_address: Option<String>,
}

async fn leader(State(state): State<AppState>) -> Result<Json<LeaderResponse>, AppError> {
    let is_self = matches!(state.core.state().await, CoreState::Active);
    let leader_address = if is_self {
        Some(state.core.config().api_addr.clone())
    } else {
        state.core.leader_addr().await
    };
    Ok(Json(LeaderResponse {
        ha_enabled: true,
        is_self,
        leader_address,
    }))
}

// ── Keyring rotation ─────────────────────────────────────────────────

async fn rotate(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(
            client_token(&headers).as_deref(),
            "sys/rotate",
            Operation::Update,
            true,
        )
        .await?;
    state.core.rotate_barrier().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Rekey ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RekeyInitRequest {
    secret_shares: u8,
    secret_threshold: u8,
    /// When set, the root key itself is rotated as well.
    #[serde(default)]
    rotate_root: bool,
    /// Rekey the recovery key set instead of the barrier's.
    #[serde(default)]
    recovery: bool,
}

async fn rekey_init(
    State(state): State<AppState>,
    Json(body): Json<RekeyInitRequest>,
) -> Result<Response, AppError> {
    let status = state
        .core
        .rekey()
        .init(
            RekeyConfig {
                secret_shares: body.secret_shares,
                secret_threshold: body.secret_threshold,
                mode: if body.rotate_root {
                    RekeyMode::RotateRoot
                } else {
                    RekeyMode::SplitOnly
                },
                target: if body.recovery {
                    RekeyTarget::Recovery
                } else {
                    RekeyTarget::Barrier
                },
            },
            state.core.migration_active(),
        )
        .await
        .map_err(citadel_core::error::CoreError::from)?;
    Ok(Json(status).into_response())
}

async fn rekey_status(State(state): State<AppState>) -> Response {
    match state.core.rekey().status().await {
        Some(status) => Json(status).into_response(),
        None => Json(serde_json::json!({ "started": false })).into_response(),
    }
}

async fn rekey_cancel(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state
        .core
        .rekey()
        .cancel()
        .await
        .map_err(citadel_core::error::CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RekeyUpdateRequest {
    key: String,
    nonce: String,
}

#[derive(Debug, Serialize)]
struct RekeyCompleteResponse {
    complete: bool,
    keys: Vec<String>,
}

async fn rekey_update(
    State(state): State<AppState>,
    Json(body): Json<RekeyUpdateRequest>,
) -> Result<Response, AppError> {
    let share = B64
        .decode(body.key.trim())
        .map_err(|_| AppError::bad_request("key share is not valid base64"))?;
    let outcome = state
        .core
        .rekey()
        .submit(&body.nonce, share)
        .await
        .map_err(citadel_core::error::CoreError::from)?;

    match outcome {
        RekeyOutcome::InProgress(status) => Ok(Json(status).into_response()),
        RekeyOutcome::Complete { new_shares } => Ok(Json(RekeyCompleteResponse {
            complete: true,
            keys: new_shares.iter().map(|s| B64.encode(s)).collect(),
        })
        .into_response()),
    }
}

// ── Generate root ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRootAttemptResponse {
    nonce: String,
    otp: String,
    started: bool,
}

async fn generate_root_attempt(
    State(state): State<AppState>,
) -> Result<Json<GenerateRootAttemptResponse>, AppError> {
    let (nonce, otp) = state.core.generate_root_init().await?;
    Ok(Json(GenerateRootAttemptResponse {
        nonce,
        otp,
        started: true,
    }))
}

#[derive(Debug, Deserialize)]
struct GenerateRootUpdateRequest {
    key: String,
    nonce: String,
}

async fn generate_root_update(
    State(state): State<AppState>,
    Json(body): Json<GenerateRootUpdateRequest>,
) -> Result<Response, AppError> {
    let share = B64
        .decode(body.key.trim())
        .map_err(|_| AppError::bad_request("key share is not valid base64"))?;
    let outcome = state.core.generate_root_update(&body.nonce, share).await?;
    match outcome {
        GenerateRootOutcome::Progress { progress, required } => Ok(Json(serde_json::json!({
            "complete": false,
            "progress": progress,
            "required": required,
        }))
        .into_response()),
        GenerateRootOutcome::Complete { encoded_token } => Ok(Json(serde_json::json!({
            "complete": true,
            "encoded_root_token": encoded_token,
        }))
        .into_response()),
    }
}

async fn generate_root_cancel(State(state): State<AppState>) -> StatusCode {
    state.core.generate_root_cancel().await;
    StatusCode::NO_CONTENT
}

// ── Response unwrapping ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UnwrapRequest {
    #[serde(default)]
    token: String,
}

async fn unwrap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UnwrapRequest>,
) -> Result<Response, AppError> {
    // The wrapping token comes from the body, or is the request token.
    let token = if body.token.is_empty() {
        client_token(&headers).ok_or_else(|| AppError::bad_request("missing wrapping token"))?
    } else {
        body.token
    };
    let response = state.core.unwrap_response(&token).await?;
    Ok(Json(response).into_response())
}
