//! Meshplane Common Library
//!
//! The ACL matrix engine of the Meshplane control plane: per-network
//! permission matrices, their storage, the member directory they are checked
//! against, the one-shot schema migration and peer update notifications.

pub mod acl;
pub mod db;
pub mod directory;
pub mod error;
pub mod migrate;
pub mod notify;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use acl::{Acl, AclContainer, AclId, MemberId, MemberRoster, Permission, DEFAULT_PERMISSION};
pub use db::Database;
pub use directory::{MemberDirectory, SqliteDirectory};
pub use error::{Error, Result};
pub use migrate::{AclMigration, MigrationReport, MigrationStatus};
pub use notify::{
    BroadcastTransport, PeerUpdate, PeerUpdateNotifier, PeerUpdatePublisher, PeerUpdateTransport,
    WebhookTransport,
};
pub use service::AclService;
pub use store::{PermissionStore, SqlitePermissionStore};
pub use types::*;

/// Meshplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshplane")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
