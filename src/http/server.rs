//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{check, health};
use crate::error::Result;
use crate::gate::Gate;

/// Routes served by the standalone service.
pub fn router(gate: Arc<Gate>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/check", any(check))
        .with_state(gate)
}

/// Standalone HTTP server exposing the forward-auth check endpoint.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    gate: Arc<Gate>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, gate: Arc<Gate>) -> Self {
        Self { addr, gate }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(self.gate).layer(TraceLayer::new_for_http());
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let gate = Arc::new(Gate::from_config(&TollgateConfig::default()).await.unwrap());
        let _server = HttpServer::new(addr, gate);
    }

    #[tokio::test]
    async fn test_health_route_is_not_limited() {
        let gate = Arc::new(Gate::from_config(&TollgateConfig::default()).await.unwrap());
        let app = router(gate);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_serve_shuts_down_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let gate = Arc::new(Gate::from_config(&TollgateConfig::default()).await.unwrap());
        let server = HttpServer::new(addr, gate);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
