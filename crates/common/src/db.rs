//! SQLite database for Meshplane state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that manage their own
    /// tables within the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Networks
            CREATE TABLE IF NOT EXISTS networks (
                net_id TEXT PRIMARY KEY,
                address_range TEXT,
                address_range6 TEXT,
                created_at INTEGER NOT NULL
            );

            -- Mesh nodes
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT NOT NULL,
                network TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (network, id)
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_network ON nodes(network);

            -- External clients, with their legacy deny-lists
            CREATE TABLE IF NOT EXISTS ext_clients (
                client_id TEXT NOT NULL,
                network TEXT NOT NULL,
                denied_acls TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                PRIMARY KEY (network, client_id)
            );
            CREATE INDEX IF NOT EXISTS idx_ext_clients_network ON ext_clients(network);

            -- One ACL matrix per network
            CREATE TABLE IF NOT EXISTS network_acls (
                network_id TEXT PRIMARY KEY,
                matrix TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Key-value store for misc state
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Set a key-value pair
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// List keys starting with `prefix`
    pub fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![prefix, prefix.chars().count() as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Delete a key
    pub fn kv_delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}
