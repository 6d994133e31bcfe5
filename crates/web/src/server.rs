//! HTTP server wiring

use crate::routes::acl_router;
use axum::{response::IntoResponse, routing::get, Json, Router};
use meshplane_common::AclService;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// HTTP front of the control plane
pub struct WebServer {
    acls: AclService,
}

impl WebServer {
    pub fn new(acls: AclService) -> Self {
        Self { acls }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .merge(acl_router(self.acls.clone()))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until the listener fails
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("HTTP API starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "meshplane",
        "version": meshplane_common::VERSION,
    }))
}
