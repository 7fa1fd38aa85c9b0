//! Route handlers.
//!
//! The system API (`/v1/sys/*`) is served by explicit handlers that call
//! the core's lifecycle and management methods directly; everything else
//! under `/v1/` falls through to the logical dispatcher, which maps HTTP
//! verbs onto logical operations and hands the request to the core's
//! pipeline.

pub mod leases;
pub mod logical;
pub mod mounts;
pub mod policy;
pub mod sys;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use citadel_core::CoreResponse;

/// Pull the client token from `X-Vault-Token` or `Authorization: Bearer`.
#[must_use]
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-vault-token").and_then(|v| v.to_str().ok()) {
        return Some(value.to_owned());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Parse `X-Vault-Wrap-TTL`: plain seconds or with an `s`/`m`/`h` suffix.
#[must_use]
pub fn wrap_ttl(headers: &HeaderMap) -> Option<i64> {
    let raw = headers.get("x-vault-wrap-ttl")?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: i64 = value.parse().ok()?;
    match unit {
        "s" => Some(value),
        "m" => Some(value * 60),
        "h" => Some(value * 3600),
        _ => None,
    }
}

/// Requested wrapping format from `X-Vault-Wrap-Format`.
#[must_use]
pub fn wrap_format(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-vault-wrap-format")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

/// Whether `X-Vault-Policy-Override` asks to bypass soft-mandatory
/// policies.
#[must_use]
pub fn policy_override(headers: &HeaderMap) -> bool {
    headers
        .get("x-vault-policy-override")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true" || v == "1")
}

/// The logical namespace for a request.
#[must_use]
pub fn namespace(headers: &HeaderMap) -> String {
    headers
        .get("x-vault-namespace")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('/').to_owned())
        .unwrap_or_default()
}

/// Whether the client asked for a redirect instead of forwarding.
#[must_use]
pub fn no_request_forwarding(headers: &HeaderMap) -> bool {
    headers
        .get("x-vault-no-request-forwarding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true" || v == "1")
}

/// MFA credentials from `X-Vault-MFA` (`method[:payload]`, comma separated).
#[must_use]
pub fn mfa_methods(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("x-vault-mfa")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .filter_map(|item| item.split(':').next())
                .map(|m| m.trim().to_owned())
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Render a core response: 200 with the envelope when it carries anything,
/// 204 otherwise.
#[must_use]
pub fn respond(response: CoreResponse) -> Response {
    let has_content = response.data.is_some()
        || response.auth.is_some()
        || response.wrap_info.is_some()
        || response.lease_id.is_some()
        || !response.warnings.is_empty();
    if has_content {
        (StatusCode::OK, axum::Json(response)).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}
