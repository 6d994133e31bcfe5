//! Network ACL API routes
//!
//! - `GET /api/networks/:network/acls` returns the network's matrix, or an
//!   empty object when none has been saved.
//! - `PUT /api/networks/:network/acls` overlays the posted rows onto the
//!   stored matrix and returns the saved result.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use meshplane_common::{AclService, Error, NetworkId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state of the ACL API
pub struct AclApiState {
    pub acls: AclService,
}

/// Error wrapper mapping engine errors to HTTP responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string()
            })),
        )
            .into_response()
    }
}

/// Create the ACL router
pub fn acl_router(acls: AclService) -> Router {
    let state = Arc::new(AclApiState { acls });
    Router::new()
        .route(
            "/api/networks/:network/acls",
            get(get_network_acl_handler).put(update_network_acl_handler),
        )
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> &str {
    headers
        .get("user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

async fn get_network_acl_handler(
    State(state): State<Arc<AclApiState>>,
    Path(network): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let network = NetworkId::new(network)?;
    let matrix = state.acls.get_matrix(&network).map_err(|e| {
        warn!(user = caller(&headers), "failed to fetch ACLs for network [{}]: {}", network, e);
        e
    })?;

    debug!(user = caller(&headers), "fetched acl for network {}", network);
    Ok((StatusCode::OK, Json(matrix)))
}

async fn update_network_acl_handler(
    State(state): State<Arc<AclApiState>>,
    Path(network): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let network = NetworkId::new(network)?;
    let saved = state
        .acls
        .overlay_and_save_json(&network, &body)
        .map_err(|e| {
            warn!(user = caller(&headers), "failed to update ACLs for network [{}]: {}", network, e);
            e
        })?;

    info!(user = caller(&headers), "updated ACLs for network {}", network);
    Ok((StatusCode::OK, Json(saved)))
}
