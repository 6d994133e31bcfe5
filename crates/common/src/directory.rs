//! Member directory: networks, mesh nodes and external clients
//!
//! The ACL engine only reads from the directory. The SQLite implementation
//! also carries the small amount of write support needed to seed it and to
//! guard network deletion.

use crate::acl::AclId;
use crate::db::Database;
use crate::store::PermissionStore;
use crate::types::{ExtClient, Network, NetworkId, NodeRecord};
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Read-only view of network membership
pub trait MemberDirectory: Send + Sync {
    fn list_networks(&self) -> Result<Vec<Network>>;

    fn list_nodes(&self, network: &NetworkId) -> Result<Vec<NodeRecord>>;

    fn list_external_clients(&self, network: &NetworkId) -> Result<Vec<ExtClient>>;
}

/// Directory backed by the shared state database
#[derive(Clone)]
pub struct SqliteDirectory {
    db: Database,
}

impl SqliteDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a network after validating its address ranges
    pub fn create_network(&self, network: Network) -> Result<Network> {
        network.validate()?;

        let conn = self.db.connection();
        let conn = conn.lock();
        if network_exists(&conn, &network.net_id)? {
            return Err(Error::AlreadyExists {
                kind: "network".to_string(),
                id: network.net_id.to_string(),
            });
        }

        conn.execute(
            "INSERT INTO networks (net_id, address_range, address_range6, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                network.net_id.as_str(),
                network.address_range,
                network.address_range6,
                network.created_at,
            ],
        )?;

        info!("Created network {}", network.net_id);
        Ok(network)
    }

    pub fn get_network(&self, network: &NetworkId) -> Result<Option<Network>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row = conn
            .query_row(
                "SELECT net_id, address_range, address_range6, created_at
                 FROM networks WHERE net_id = ?1",
                params![network.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(net_id, v4, v6, created_at)| -> Result<Network> {
            Ok(Network {
                net_id: NetworkId::new(net_id)?,
                address_range: v4,
                address_range6: v6,
                created_at,
            })
        })
        .transpose()
    }

    /// Add a mesh node to a network
    pub fn add_node(&self, network: &NetworkId, id: AclId) -> Result<NodeRecord> {
        let conn = self.db.connection();
        let conn = conn.lock();
        ensure_network(&conn, network)?;
        ensure_id_free(&conn, network, &id)?;

        let node = NodeRecord {
            id,
            network: network.clone(),
            created_at: chrono::Utc::now().timestamp(),
        };
        conn.execute(
            "INSERT INTO nodes (id, network, created_at) VALUES (?1, ?2, ?3)",
            params![node.id.as_str(), network.as_str(), node.created_at],
        )?;

        debug!("Added node {} to network {}", node.id, network);
        Ok(node)
    }

    /// Add an external client, with its legacy deny-list, to a network
    pub fn add_ext_client(
        &self,
        network: &NetworkId,
        client_id: AclId,
        denied_acls: BTreeSet<AclId>,
    ) -> Result<ExtClient> {
        let conn = self.db.connection();
        let conn = conn.lock();
        ensure_network(&conn, network)?;
        ensure_id_free(&conn, network, &client_id)?;

        let client = ExtClient {
            client_id,
            network: network.clone(),
            denied_acls,
            created_at: chrono::Utc::now().timestamp(),
        };
        conn.execute(
            "INSERT INTO ext_clients (client_id, network, denied_acls, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                client.client_id.as_str(),
                network.as_str(),
                serde_json::to_string(&client.denied_acls)?,
                client.created_at,
            ],
        )?;

        debug!("Added external client {} to network {}", client.client_id, network);
        Ok(client)
    }

    /// Remove a mesh node. Returns true if it existed.
    pub fn remove_node(&self, network: &NetworkId, id: &AclId) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute(
            "DELETE FROM nodes WHERE network = ?1 AND id = ?2",
            params![network.as_str(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Delete a network that has no member nodes, together with its external
    /// clients and its ACL matrix.
    pub fn delete_network(&self, network: &NetworkId, acls: &dyn PermissionStore) -> Result<()> {
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            ensure_network(&conn, network)?;

            let nodes: i64 = conn.query_row(
                "SELECT COUNT(*) FROM nodes WHERE network = ?1",
                params![network.as_str()],
                |row| row.get(0),
            )?;
            if nodes > 0 {
                return Err(Error::NetworkInUse {
                    network: network.to_string(),
                    nodes: nodes as usize,
                });
            }

            conn.execute(
                "DELETE FROM ext_clients WHERE network = ?1",
                params![network.as_str()],
            )?;
            conn.execute(
                "DELETE FROM networks WHERE net_id = ?1",
                params![network.as_str()],
            )?;
        }

        acls.delete(network)?;
        info!("Deleted network {}", network);
        Ok(())
    }
}

fn network_exists(conn: &Connection, network: &NetworkId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM networks WHERE net_id = ?1",
        params![network.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_network(conn: &Connection, network: &NetworkId) -> Result<()> {
    if network_exists(conn, network)? {
        Ok(())
    } else {
        Err(Error::not_found("network", network.as_str()))
    }
}

/// Node and client ids share one key space per network
fn ensure_id_free(conn: &Connection, network: &NetworkId, id: &AclId) -> Result<()> {
    let taken: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM nodes WHERE network = ?1 AND id = ?2)
              + (SELECT COUNT(*) FROM ext_clients WHERE network = ?1 AND client_id = ?2)",
        params![network.as_str(), id.as_str()],
        |row| row.get(0),
    )?;
    if taken > 0 {
        return Err(Error::AlreadyExists {
            kind: "member".to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

impl MemberDirectory for SqliteDirectory {
    fn list_networks(&self) -> Result<Vec<Network>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT net_id, address_range, address_range6, created_at
             FROM networks ORDER BY net_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut networks = Vec::new();
        for row in rows {
            let (net_id, address_range, address_range6, created_at) = row?;
            networks.push(Network {
                net_id: NetworkId::new(net_id)?,
                address_range,
                address_range6,
                created_at,
            });
        }
        Ok(networks)
    }

    fn list_nodes(&self, network: &NetworkId) -> Result<Vec<NodeRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, created_at FROM nodes WHERE network = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![network.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, created_at) = row?;
            nodes.push(NodeRecord {
                id: AclId::new(id)?,
                network: network.clone(),
                created_at,
            });
        }
        Ok(nodes)
    }

    fn list_external_clients(&self, network: &NetworkId) -> Result<Vec<ExtClient>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT client_id, denied_acls, created_at
             FROM ext_clients WHERE network = ?1 ORDER BY client_id",
        )?;
        let rows = stmt.query_map(params![network.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut clients = Vec::new();
        for row in rows {
            let (client_id, denied, created_at) = row?;
            clients.push(ExtClient {
                client_id: AclId::new(client_id)?,
                network: network.clone(),
                denied_acls: serde_json::from_str(&denied)?,
                created_at,
            });
        }
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclContainer;
    use crate::store::SqlitePermissionStore;

    fn id(s: &str) -> AclId {
        AclId::new(s).unwrap()
    }

    fn net(s: &str) -> NetworkId {
        NetworkId::new(s).unwrap()
    }

    fn setup() -> (SqliteDirectory, SqlitePermissionStore) {
        let db = Database::open_memory().unwrap();
        let dir = SqliteDirectory::new(db.clone());
        dir.create_network(Network::new(net("net1"), Some("10.1.0.0/24".into()), None))
            .unwrap();
        (dir, SqlitePermissionStore::new(&db))
    }

    #[test]
    fn test_create_network_validates_and_dedups() {
        let (dir, _) = setup();
        assert!(matches!(
            dir.create_network(Network::new(net("bad"), None, None)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            dir.create_network(Network::new(net("net1"), None, Some("fd00::/64".into()))),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(dir.get_network(&net("net1")).unwrap().is_some());
        assert_eq!(dir.list_networks().unwrap().len(), 1);
    }

    #[test]
    fn test_members_are_listed_per_network() {
        let (dir, _) = setup();
        dir.create_network(Network::new(net("net2"), Some("10.2.0.0/24".into()), None))
            .unwrap();

        dir.add_node(&net("net1"), id("n1")).unwrap();
        dir.add_node(&net("net2"), id("n9")).unwrap();
        dir.add_ext_client(&net("net1"), id("c1"), [id("n1")].into_iter().collect())
            .unwrap();

        let nodes = dir.list_nodes(&net("net1")).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, id("n1"));

        let clients = dir.list_external_clients(&net("net1")).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients[0].denies(&id("n1")));
        assert!(dir.list_external_clients(&net("net2")).unwrap().is_empty());
    }

    #[test]
    fn test_member_ids_share_namespace() {
        let (dir, _) = setup();
        dir.add_node(&net("net1"), id("shared")).unwrap();
        assert!(matches!(
            dir.add_ext_client(&net("net1"), id("shared"), BTreeSet::new()),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(dir.add_node(&net("missing"), id("n1")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_network_requires_no_nodes() {
        let (dir, store) = setup();
        dir.add_node(&net("net1"), id("n1")).unwrap();
        store.save(&net("net1"), &AclContainer::new(), 0).unwrap();

        assert!(matches!(
            dir.delete_network(&net("net1"), &store),
            Err(Error::NetworkInUse { nodes: 1, .. })
        ));

        assert!(dir.remove_node(&net("net1"), &id("n1")).unwrap());
        dir.delete_network(&net("net1"), &store).unwrap();
        assert!(dir.get_network(&net("net1")).unwrap().is_none());
        assert!(store.load(&net("net1")).unwrap_err().is_not_found());
    }
}
