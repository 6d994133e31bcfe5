//! Permission store: one ACL matrix record per network
//!
//! Saves are whole-matrix and guarded by a version stamp. A save names the
//! version it read; if the stored record has moved on, the save fails with
//! [`Error::Conflict`] and nothing is written.

use crate::acl::AclContainer;
use crate::db::Database;
use crate::types::{NetworkId, Versioned};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

/// Persistence for per-network ACL matrices
pub trait PermissionStore: Send + Sync {
    /// Load the matrix of a network. Fails with [`Error::NotFound`] when the
    /// network has never had one saved.
    fn load(&self, network: &NetworkId) -> Result<Versioned<AclContainer>>;

    /// Replace the stored matrix. `expected_version` is the version returned
    /// by the preceding load, or 0 when nothing was stored.
    fn save(
        &self,
        network: &NetworkId,
        matrix: &AclContainer,
        expected_version: u64,
    ) -> Result<Versioned<AclContainer>>;

    /// Drop the matrix of a network. Returns true if a record existed.
    fn delete(&self, network: &NetworkId) -> Result<bool>;
}

/// SQLite-backed permission store sharing the state database
#[derive(Clone)]
pub struct SqlitePermissionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePermissionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}

fn read_record(conn: &Connection, network: &NetworkId) -> Result<Option<(String, i64)>> {
    let record = conn
        .query_row(
            "SELECT matrix, version FROM network_acls WHERE network_id = ?1",
            params![network.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(record)
}

fn decode(raw: &str, version: i64) -> Result<Versioned<AclContainer>> {
    let matrix: AclContainer = serde_json::from_str(raw)?;
    Ok(Versioned::new(matrix, version as u64))
}

impl PermissionStore for SqlitePermissionStore {
    fn load(&self, network: &NetworkId) -> Result<Versioned<AclContainer>> {
        let conn = self.conn.lock();
        match read_record(&conn, network)? {
            Some((raw, version)) => decode(&raw, version),
            None => Err(Error::not_found("acl", network.as_str())),
        }
    }

    fn save(
        &self,
        network: &NetworkId,
        matrix: &AclContainer,
        expected_version: u64,
    ) -> Result<Versioned<AclContainer>> {
        let raw = serde_json::to_string(matrix)?;
        let now = chrono::Utc::now().timestamp();
        let next_version = expected_version as i64 + 1;

        let conn = self.conn.lock();
        let written = if expected_version == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO network_acls (network_id, matrix, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![network.as_str(), raw, next_version, now],
            )?
        } else {
            conn.execute(
                "UPDATE network_acls SET matrix = ?1, version = ?2, updated_at = ?3
                 WHERE network_id = ?4 AND version = ?5",
                params![raw, next_version, now, network.as_str(), expected_version as i64],
            )?
        };

        if written == 0 {
            let found = read_record(&conn, network)?
                .map(|(_, version)| version as u64)
                .unwrap_or(0);
            return Err(Error::Conflict {
                network: network.to_string(),
                expected: expected_version,
                found,
            });
        }

        debug!("Saved ACL matrix for network {} at version {}", network, next_version);

        match read_record(&conn, network)? {
            Some((raw, version)) => decode(&raw, version),
            None => Err(Error::Internal(format!(
                "ACL record for network {} vanished after save",
                network
            ))),
        }
    }

    fn delete(&self, network: &NetworkId) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM network_acls WHERE network_id = ?1",
            params![network.as_str()],
        )?;
        if rows > 0 {
            debug!("Deleted ACL matrix for network {}", network);
        }
        Ok(rows > 0)
    }
}
