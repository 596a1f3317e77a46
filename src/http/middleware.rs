//! Rate limit middleware and the forward-auth check endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        header::{HeaderName, RETRY_AFTER},
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::gate::Gate;
use crate::ratelimit::{Decision, QuotaState};

/// Requests allowed per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the current window closes.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Headers a fronting proxy uses to pass the original request URI.
const ORIGINAL_URI_HEADERS: [&str; 2] = ["x-original-uri", "x-forwarded-uri"];

/// Machine-readable code of a quota rejection.
pub const RATE_LIMITED_CODE: &str = "RATE_LIMITED";

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "tollgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Middleware that enforces the gate's policies in front of the wrapped routes.
///
/// Admitted requests continue to the next handler and get quota headers on
/// the way out; rejected requests are answered with 429 here.
pub async fn rate_limit(State(gate): State<Arc<Gate>>, request: Request, next: Next) -> Response {
    let Some(limiter) = gate.limiter_for(request.uri().path()) else {
        return next.run(request).await;
    };

    let identifier = gate
        .resolver()
        .resolve(request.headers(), peer_ip(&request));
    let decision = limiter.check(&identifier).await;

    match decision {
        Decision::Rejected { quota, retry_after } => {
            info!(
                identifier = %identifier,
                path = %request.uri().path(),
                retry_after,
                "Request rate limited"
            );
            rejection(&quota, retry_after)
        }
        admitted => {
            let mut response = next.run(request).await;
            insert_quota_headers(response.headers_mut(), &admitted);
            response
        }
    }
}

/// Forward-auth endpoint for a fronting proxy.
///
/// The proxy forwards the client's headers and passes the original path in
/// `X-Original-URI` (or `X-Forwarded-Uri`). Answers 204 when the request may
/// proceed and 429 when it may not.
#[instrument(skip_all)]
pub async fn check(State(gate): State<Arc<Gate>>, request: Request) -> Response {
    let Some(path) = original_path(request.headers()) else {
        warn!("Forward-auth request without an original URI header");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing X-Original-URI header".to_string(),
                code: "MISSING_ORIGINAL_URI",
                retry_after_secs: None,
            }),
        )
            .into_response();
    };

    let Some(limiter) = gate.limiter_for(&path) else {
        debug!(path = %path, "Path not covered by any policy");
        return StatusCode::NO_CONTENT.into_response();
    };

    let identifier = gate
        .resolver()
        .resolve(request.headers(), peer_ip(&request));
    let decision = limiter.check(&identifier).await;

    debug!(identifier = %identifier, path = %path, admitted = decision.is_admitted(), "Forward-auth decision made");

    match decision {
        Decision::Rejected { quota, retry_after } => rejection(&quota, retry_after),
        admitted => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            insert_quota_headers(response.headers_mut(), &admitted);
            response
        }
    }
}

/// Write the quota headers for `decision` into `headers`.
///
/// A degraded decision only reports the limit.
pub fn insert_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    match decision {
        Decision::Admitted(quota) | Decision::Rejected { quota, .. } => {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_at));
        }
        Decision::Degraded { limit } => {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
        }
    }
}

/// The 429 response for an exhausted window.
pub fn rejection(quota: &QuotaState, retry_after: u64) -> Response {
    let body = ErrorResponse {
        error: format!("Too many requests, retry in {} seconds", retry_after),
        code: RATE_LIMITED_CODE,
        retry_after_secs: Some(retry_after),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    insert_quota_headers(
        headers,
        &Decision::Rejected {
            quota: *quota,
            retry_after,
        },
    );
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Path component of the original URI passed by the proxy.
fn original_path(headers: &HeaderMap) -> Option<String> {
    let uri = ORIGINAL_URI_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))?
        .trim();
    if uri.is_empty() {
        return None;
    }

    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    Some(path.to_string())
}
