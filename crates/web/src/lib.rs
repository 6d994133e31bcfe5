//! Meshplane HTTP API
//!
//! Thin axum adapter over the ACL engine in `meshplane-common`.

pub mod routes;
pub mod server;

pub use routes::{acl_router, ApiError};
pub use server::WebServer;
