//! HTTP gateway server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{throttled, BoundaryState};
use super::proxy::{forward, Upstream};
use crate::error::{Result, ThrottleError};
use crate::throttle::RequestThrottle;

/// Build the gateway router: health check plus throttled forwarding.
pub fn router(throttle: Arc<RequestThrottle>, upstream: Upstream, protect_all_paths: bool) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .with_state(upstream);

    throttled(
        app,
        BoundaryState {
            throttle,
            protect_all_paths,
        },
    )
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// HTTP server fronting the marketplace.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    throttle: Arc<RequestThrottle>,
    upstream: Upstream,
    protect_all_paths: bool,
}

impl GatewayServer {
    pub fn new(
        addr: SocketAddr,
        throttle: Arc<RequestThrottle>,
        upstream: Upstream,
        protect_all_paths: bool,
    ) -> Self {
        Self {
            addr,
            throttle,
            upstream,
            protect_all_paths,
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            upstream = %self.upstream.base_url(),
            "Starting throttle gateway"
        );

        let app = router(self.throttle, self.upstream, self.protect_all_paths);

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "Gateway server failed");
                ThrottleError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let throttle = Arc::new(RequestThrottle::new(Arc::new(MemoryStore::new())));
        let _server = GatewayServer::new(addr, throttle, Upstream::new("http://127.0.0.1:3000"), false);
    }
}
