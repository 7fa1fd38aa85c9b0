//! The logical dispatcher: everything under `/v1/` that is not a system
//! route.
//!
//! HTTP verbs map onto logical operations: `GET → read`, `POST`/`PUT` →
//! create/update, `DELETE → delete`, `PATCH → patch`, and the extension
//! verbs `LIST` and `SCAN` (also reachable as `GET ?list=true` and
//! `GET ?scan=true`). Pagination rides the `after`/`limit` query
//! parameters. The core does the rest: state checks, authentication,
//! policy, routing, leases, wrapping, audit.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use axum::routing::any;
use axum::Router;

use citadel_core::engine::{Operation, PageArgs};
use citadel_core::Request;

use crate::error::AppError;
use crate::routes::{
    client_token, mfa_methods, namespace, policy_override, respond, wrap_format, wrap_ttl,
};
use crate::state::AppState;

/// Build the wildcard logical router.
pub fn router() -> Router<AppState> {
    Router::new().route("/*path", any(dispatch))
}

fn operation_for(
    method: &Method,
    query: &HashMap<String, String>,
) -> Result<Operation, AppError> {
    let truthy = |key: &str| {
        query
            .get(key)
            .is_some_and(|v| v == "true" || v == "1")
    };

    match method.as_str() {
        "GET" if truthy("list") => Ok(Operation::List),
        "GET" if truthy("scan") => Ok(Operation::Scan),
        "GET" => Ok(Operation::Read),
        "POST" => Ok(Operation::Create),
        "PUT" => Ok(Operation::Update),
        "DELETE" => Ok(Operation::Delete),
        "PATCH" => Ok(Operation::Patch),
        "LIST" => Ok(Operation::List),
        "SCAN" => Ok(Operation::Scan),
        other => Err(AppError::bad_request(format!(
            "unsupported method '{other}'"
        ))),
    }
}

fn page_args(query: &HashMap<String, String>) -> Option<PageArgs> {
    let after = query.get("after").cloned();
    let limit = query.get("limit").and_then(|v| v.parse::<i64>().ok());
    if after.is_none() && limit.is_none() {
        return None;
    }
    Some(PageArgs {
        after: after.unwrap_or_default(),
        limit: limit.unwrap_or(-1),
    })
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let operation = operation_for(&method, &query)?;

    let data = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| AppError::bad_request(format!("malformed JSON body: {e}")))?,
        )
    };

    let mut request = Request::new(operation, path);
    request.namespace = namespace(&headers);
    request.data = data;
    request.token = client_token(&headers);
    request.client_addr = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    request.wrap_ttl = wrap_ttl(&headers);
    request.wrap_format = wrap_format(&headers);
    request.policy_override = policy_override(&headers);
    request.mfa_methods = mfa_methods(&headers);
    request.page = page_args(&query);

    let response = state.core.handle_request(request).await?;
    Ok(respond(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn verb_mapping() {
        let empty = HashMap::new();
        assert_eq!(operation_for(&Method::GET, &empty).unwrap(), Operation::Read);
        assert_eq!(
            operation_for(&Method::POST, &empty).unwrap(),
            Operation::Create
        );
        assert_eq!(
            operation_for(&Method::PUT, &empty).unwrap(),
            Operation::Update
        );
        assert_eq!(
            operation_for(&Method::DELETE, &empty).unwrap(),
            Operation::Delete
        );
        assert_eq!(
            operation_for(&Method::PATCH, &empty).unwrap(),
            Operation::Patch
        );
    }

    #[test]
    fn list_and_scan_via_query() {
        assert_eq!(
            operation_for(&Method::GET, &query(&[("list", "true")])).unwrap(),
            Operation::List
        );
        assert_eq!(
            operation_for(&Method::GET, &query(&[("scan", "true")])).unwrap(),
            Operation::Scan
        );
    }

    #[test]
    fn list_and_scan_extension_verbs() {
        let list = Method::from_bytes(b"LIST").unwrap();
        let scan = Method::from_bytes(b"SCAN").unwrap();
        let empty = HashMap::new();
        assert_eq!(operation_for(&list, &empty).unwrap(), Operation::List);
        assert_eq!(operation_for(&scan, &empty).unwrap(), Operation::Scan);
    }

    #[test]
    fn pagination_args_parsed() {
        let args = page_args(&query(&[("after", "3"), ("limit", "5")])).unwrap();
        assert_eq!(args.after, "3");
        assert_eq!(args.limit, 5);

        let args = page_args(&query(&[("limit", "-1")])).unwrap();
        assert_eq!(args.limit, -1);

        assert!(page_args(&HashMap::new()).is_none());
    }
}
