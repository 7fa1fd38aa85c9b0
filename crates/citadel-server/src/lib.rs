//! Citadel HTTP server: the transport in front of `citadel-core`.
//!
//! Routes under `/v1/sys/*` call the core's lifecycle and management
//! methods directly; every other `/v1/` path goes through the logical
//! dispatcher into the core's request pipeline.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Assemble the full application router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let sys = Router::new()
        .nest("/v1/sys/policies/acl", routes::policy::router())
        .nest("/v1/sys/mounts", routes::mounts::router())
        .nest("/v1/sys/remount", routes::mounts::remount_router())
        .nest("/v1/sys/leases", routes::leases::router())
        .nest("/v1/sys", routes::sys::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(64));

    Router::new()
        .merge(sys)
        .nest("/v1", routes::logical::router())
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}
