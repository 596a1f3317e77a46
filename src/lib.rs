//! Tollgate - per-caller rate limiting for the invoicing API
//!
//! This crate derives a stable caller identity from each request (bearer
//! credential first, then the client address), enforces a fixed-window quota
//! per identity over a shared counter store, and exposes the result to the
//! HTTP layer as quota headers or a 429 rejection.

pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod identity;
pub mod ratelimit;
