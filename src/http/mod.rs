//! HTTP boundary: rate limit middleware for embedding in an application
//! router, and the standalone forward-auth service.

mod middleware;
mod server;

pub use middleware::{
    check, health, insert_quota_headers, rate_limit, rejection, ErrorResponse, HealthResponse,
    RATE_LIMITED_CODE, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, HttpServer};
