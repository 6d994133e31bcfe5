//! One-shot ACL schema migration
//!
//! Older matrices only had rows for mesh nodes; external clients carried
//! their own deny-lists. This pass folds every client into its network's
//! matrix, drops self entries and sweeps out rows and entries of members
//! that no longer exist.
//!
//! Each network is migrated on its own. A failing network is logged and
//! reported but never stops the others. Successful networks are marked in the
//! kv table under the current schema version and skipped on later runs.
//!
//! The transform is quadratic in the member count of a network. It runs at
//! startup only and must not be called from request handlers.

use crate::acl::{AclContainer, AclId, MemberId, MemberRoster, Permission};
use crate::db::Database;
use crate::directory::MemberDirectory;
use crate::service::AclService;
use crate::types::{ExtClient, NetworkId, Versioned};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Matrix layout version produced by this migration
pub const ACL_SCHEMA_VERSION: u32 = 2;

/// What the transform changed in one matrix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Client rows that did not exist before
    pub client_rows_added: usize,
    /// Entries written as NotAllowed from legacy deny-lists
    pub denied_entries: usize,
    /// Live nodes that had no row and were left alone
    pub skipped_nodes: Vec<AclId>,
    /// Members whose row held an entry for themselves
    pub self_entries_removed: Vec<AclId>,
    /// Members swept as garbage
    pub removed_members: Vec<AclId>,
}

/// Result of migrating one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    Migrated(MigrationStats),
    /// Marked as done under the current schema version
    AlreadyMigrated,
    /// No matrix is stored for the network
    NoMatrix,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOutcome {
    pub network: NetworkId,
    pub status: MigrationStatus,
}

/// Outcome of a migration run across all networks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub outcomes: Vec<NetworkOutcome>,
    /// Set when the network list itself could not be read
    pub listing_error: Option<String>,
}

impl MigrationReport {
    pub fn migrated(&self) -> impl Iterator<Item = &NetworkId> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, MigrationStatus::Migrated(_)))
            .map(|o| &o.network)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&NetworkId, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            MigrationStatus::Failed(reason) => Some((&o.network, reason.as_str())),
            _ => None,
        })
    }

    pub fn status_of(&self, network: &NetworkId) -> Option<&MigrationStatus> {
        self.outcomes
            .iter()
            .find(|o| &o.network == network)
            .map(|o| &o.status)
    }

    pub fn is_clean(&self) -> bool {
        self.listing_error.is_none() && self.failed().next().is_none()
    }
}

fn permission_for(denied: bool) -> Permission {
    if denied {
        Permission::NotAllowed
    } else {
        Permission::Allowed
    }
}

/// Fold external clients into a node-only matrix and drop dead members.
///
/// `roster` is the live membership of the network and `clients` the live
/// clients with their legacy deny-lists. Node rows are the matrix rows of
/// live nodes. A client's deny-list only governs its own row toward other
/// clients; toward nodes a denial is written in both directions.
pub fn migrate_matrix(
    mut matrix: AclContainer,
    roster: &MemberRoster,
    clients: &[ExtClient],
) -> (AclContainer, MigrationStats) {
    let mut stats = MigrationStats::default();
    let deny_lists: BTreeMap<&AclId, &ExtClient> =
        clients.iter().map(|c| (&c.client_id, c)).collect();

    let mut node_rows = Vec::new();
    let mut live_clients = Vec::new();
    for member in roster.members() {
        match member {
            MemberId::Node(node) if matrix.contains_member(&node) => node_rows.push(node),
            MemberId::Node(node) => {
                warn!("ACL migration: node {} has no ACL row, skipping", node);
                stats.skipped_nodes.push(node);
            }
            MemberId::Client(client) => live_clients.push(client),
        }
    }

    for c in &live_clients {
        let denies = |peer: &AclId| deny_lists.get(c).is_some_and(|client| client.denies(peer));

        if !matrix.contains_member(c) {
            stats.client_rows_added += 1;
        }
        matrix.ensure_row(c);

        for node in &node_rows {
            let denied = denies(node);
            let permission = permission_for(denied);
            matrix.set_entry(node, c, permission);
            matrix.set_entry(c, node, permission);
            if denied {
                stats.denied_entries += 2;
            }
        }

        for other in live_clients.iter().filter(|o| *o != c) {
            let denied = denies(other);
            matrix.set_entry(c, other, permission_for(denied));
            if denied {
                stats.denied_entries += 1;
            }
        }
    }

    stats.self_entries_removed = matrix.remove_self_entries();
    stats.removed_members = sweep_dead_members(&mut matrix, roster);
    (matrix, stats)
}

/// Remove every row and entry keyed by an id that is not a live member.
/// Returns the removed ids.
pub fn sweep_dead_members(matrix: &mut AclContainer, roster: &MemberRoster) -> Vec<AclId> {
    let mut referenced: BTreeSet<AclId> = BTreeSet::new();
    for (id, row) in matrix.rows() {
        referenced.insert(id.clone());
        referenced.extend(row.keys().cloned());
    }

    let dead: Vec<AclId> = referenced
        .into_iter()
        .filter(|id| roster.resolve(id).is_none())
        .collect();
    for id in &dead {
        matrix.remove_member(id);
    }
    dead
}

/// Drives the migration across every network in the directory
pub struct AclMigration {
    directory: Arc<dyn MemberDirectory>,
    acls: AclService,
    db: Database,
    force: bool,
}

impl AclMigration {
    pub fn new(directory: Arc<dyn MemberDirectory>, acls: AclService, db: Database) -> Self {
        Self {
            directory,
            acls,
            db,
            force: false,
        }
    }

    /// Migrate networks even if they are marked as done
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn marker_key(network: &NetworkId) -> String {
        format!("acl_migration.v{}.{}", ACL_SCHEMA_VERSION, network)
    }

    /// Migrate every network. Never fails as a whole.
    pub fn run(&self) -> MigrationReport {
        let mut report = MigrationReport::default();

        let networks = match self.directory.list_networks() {
            Ok(networks) => networks,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                error!("ACL migration failed, could not list networks: {}", e);
                report.listing_error = Some(e.to_string());
                return report;
            }
        };

        info!(
            "Running ACL migration v{} over {} network(s)",
            ACL_SCHEMA_VERSION,
            networks.len()
        );

        for network in networks {
            let status = self.run_network(&network.net_id);
            report.outcomes.push(NetworkOutcome {
                network: network.net_id,
                status,
            });
        }

        info!(
            "ACL migration finished: {} migrated, {} failed",
            report.migrated().count(),
            report.failed().count()
        );
        report
    }

    fn run_network(&self, network: &NetworkId) -> MigrationStatus {
        let marker = Self::marker_key(network);
        if !self.force {
            match self.db.kv_get(&marker) {
                Ok(Some(_)) => {
                    debug!("ACLs of network {} already migrated", network);
                    return MigrationStatus::AlreadyMigrated;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("ACL migration: cannot read marker for network {}: {}", network, e);
                    return MigrationStatus::Failed(e.to_string());
                }
            }
        }

        match self.migrate_network(network) {
            Ok(None) => MigrationStatus::NoMatrix,
            Ok(Some(stats)) => {
                let stamp = chrono::Utc::now().to_rfc3339();
                if let Err(e) = self.db.kv_set(&marker, &stamp) {
                    warn!("ACL migration: could not mark network {} as done: {}", network, e);
                }
                info!(
                    "ACL migration saved network {} ({} client rows added, {} members removed)",
                    network,
                    stats.client_rows_added,
                    stats.removed_members.len()
                );
                MigrationStatus::Migrated(stats)
            }
            Err(e) => {
                error!("{}", e);
                MigrationStatus::Failed(e.to_string())
            }
        }
    }

    /// Migrate one network. `Ok(None)` means there was no matrix to migrate.
    pub fn migrate_network(&self, network: &NetworkId) -> Result<Option<MigrationStats>> {
        let fail = |reason: String| Error::Migration {
            network: network.to_string(),
            reason,
        };

        let Versioned { value, version } = match self.acls.store().load(network) {
            Ok(matrix) => matrix,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(fail(format!("loading ACLs: {}", e))),
        };

        let nodes = self
            .directory
            .list_nodes(network)
            .map_err(|e| fail(format!("listing nodes: {}", e)))?;
        let clients = self
            .directory
            .list_external_clients(network)
            .map_err(|e| fail(format!("listing clients: {}", e)))?;

        let roster = MemberRoster::new(
            nodes.into_iter().map(|n| n.id),
            clients.iter().map(|c| c.client_id.clone()),
        )
        .map_err(|e| fail(e.to_string()))?;

        debug!("Migrating ACLs of network {} over {} live member(s)", network, roster.len());
        let (migrated, stats) = migrate_matrix(value, &roster, &clients);
        debug!("Migrated ACLs for network {}: {:?}", network, migrated);

        self.acls
            .save(network, &migrated, version)
            .map_err(|e| fail(format!("saving ACLs: {}", e)))?;

        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Acl;
    use crate::notify::PeerUpdateNotifier;
    use crate::store::{PermissionStore, SqlitePermissionStore};
    use crate::types::{Network, NodeRecord};
    use std::collections::HashMap;

    fn id(s: &str) -> AclId {
        AclId::new(s).unwrap()
    }

    fn net(s: &str) -> NetworkId {
        NetworkId::new(s).unwrap()
    }

    fn row(entries: &[(&str, Permission)]) -> Acl {
        entries.iter().map(|(k, p)| (id(k), *p)).collect()
    }

    fn client(network: &str, client_id: &str, denied: &[&str]) -> ExtClient {
        ExtClient {
            client_id: id(client_id),
            network: net(network),
            denied_acls: denied.iter().map(|d| id(d)).collect(),
            created_at: 0,
        }
    }

    fn roster(nodes: &[&str], clients: &[ExtClient]) -> MemberRoster {
        MemberRoster::new(
            nodes.iter().map(|n| id(n)),
            clients.iter().map(|c| c.client_id.clone()),
        )
        .unwrap()
    }

    fn node_matrix(nodes: &[&str]) -> AclContainer {
        let mut matrix = AclContainer::new();
        for a in nodes {
            matrix.ensure_row(&id(a));
            for b in nodes {
                if a != b {
                    matrix.set_permission(&id(a), &id(b), Permission::Allowed).unwrap();
                }
            }
        }
        matrix
    }

    use crate::acl::Permission::{Allowed, NotAllowed};

    #[test]
    fn test_end_to_end_scenario() {
        let matrix = node_matrix(&["n1", "n2"]);
        let clients = vec![client("net1", "c1", &["n2"])];

        let (migrated, stats) = migrate_matrix(matrix, &roster(&["n1", "n2"], &clients), &clients);

        let mut expected = AclContainer::new();
        expected.insert_row(id("n1"), row(&[("n2", Allowed), ("c1", Allowed)]));
        expected.insert_row(id("n2"), row(&[("n1", Allowed), ("c1", NotAllowed)]));
        expected.insert_row(id("c1"), row(&[("n1", Allowed), ("n2", NotAllowed)]));
        assert_eq!(migrated, expected);
        assert_eq!(stats.client_rows_added, 1);
        assert_eq!(stats.denied_entries, 2);
        assert!(stats.removed_members.is_empty());
    }

    #[test]
    fn test_node_client_pairs_are_symmetric() {
        let matrix = node_matrix(&["n1", "n2", "n3"]);
        let clients = vec![
            client("net1", "c1", &["n1"]),
            client("net1", "c2", &["n3", "c1"]),
            client("net1", "c3", &[]),
        ];
        let live = roster(&["n1", "n2", "n3"], &clients);

        let (migrated, _) = migrate_matrix(matrix, &live, &clients);

        let nodes: Vec<AclId> = live
            .members()
            .filter_map(|m| match m {
                MemberId::Node(id) => Some(id),
                MemberId::Client(_) => None,
            })
            .collect();
        for c in &clients {
            for n in &nodes {
                let c = &c.client_id;
                assert!(migrated.permission(n, c).is_some());
                assert_eq!(migrated.permission(n, c), migrated.permission(c, n));
            }
        }
        assert!(migrated.validate().is_ok());
    }

    #[test]
    fn test_client_denial_only_sets_own_row() {
        let matrix = node_matrix(&["n1"]);
        let clients = vec![client("net1", "c1", &["c2"]), client("net1", "c2", &[])];

        let (migrated, stats) = migrate_matrix(matrix, &roster(&["n1"], &clients), &clients);

        assert_eq!(migrated.permission(&id("c1"), &id("c2")), Some(NotAllowed));
        assert_eq!(migrated.permission(&id("c2"), &id("c1")), Some(Allowed));
        assert_eq!(migrated.permission(&id("c1"), &id("n1")), Some(Allowed));
        assert_eq!(stats.denied_entries, 1);
        assert_eq!(migrated.asymmetric_pairs(), vec![(id("c1"), id("c2"))]);
    }

    #[test]
    fn test_orphans_are_swept_everywhere() {
        let mut matrix = node_matrix(&["n1", "n2", "gone"]);
        matrix.ensure_row(&id("n1")).insert(id("dangling"), Allowed);
        let clients = vec![client("net1", "c1", &[])];

        let (migrated, stats) = migrate_matrix(matrix, &roster(&["n1", "n2"], &clients), &clients);

        assert!(!migrated.contains_member(&id("gone")));
        for (_, r) in migrated.rows() {
            assert!(!r.contains_key(&id("gone")));
            assert!(!r.contains_key(&id("dangling")));
        }
        assert_eq!(stats.removed_members, vec![id("dangling"), id("gone")]);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let matrix = node_matrix(&["n1", "n2", "gone"]);
        let clients = vec![client("net1", "c1", &["n1"])];
        let live = roster(&["n1", "n2"], &clients);

        let (once, first) = migrate_matrix(matrix, &live, &clients);
        assert_eq!(first.removed_members, vec![id("gone")]);

        let (twice, second) = migrate_matrix(once.clone(), &live, &clients);
        assert!(second.removed_members.is_empty());
        assert_eq!(once, twice);

        let mut again = twice.clone();
        assert!(sweep_dead_members(&mut again, &live).is_empty());
    }

    #[test]
    fn test_node_without_row_is_skipped() {
        let matrix = node_matrix(&["n1"]);
        let clients = vec![client("net1", "c1", &[])];

        let (migrated, stats) =
            migrate_matrix(matrix, &roster(&["n1", "n2"], &clients), &clients);

        assert_eq!(stats.skipped_nodes, vec![id("n2")]);
        assert!(!migrated.contains_member(&id("n2")));
        assert_eq!(migrated.permission(&id("c1"), &id("n2")), None);
        assert_eq!(migrated.permission(&id("c1"), &id("n1")), Some(Allowed));
    }

    #[test]
    fn test_client_self_entry_is_dropped() {
        let mut matrix = node_matrix(&["n1"]);
        matrix.insert_row(id("c1"), row(&[("c1", Allowed)]));
        let clients = vec![client("net1", "c1", &["c1"])];

        let (migrated, stats) = migrate_matrix(matrix, &roster(&["n1"], &clients), &clients);
        assert_eq!(stats.client_rows_added, 0);
        assert_eq!(stats.self_entries_removed, vec![id("c1")]);
        assert!(migrated.validate().is_ok());
    }

    #[test]
    fn test_node_self_entry_is_dropped() {
        let mut matrix = node_matrix(&["n1", "n2"]);
        matrix.ensure_row(&id("n1")).insert(id("n1"), Allowed);
        let clients = vec![client("net1", "c1", &[])];

        let (migrated, stats) =
            migrate_matrix(matrix, &roster(&["n1", "n2"], &clients), &clients);
        assert_eq!(stats.self_entries_removed, vec![id("n1")]);
        assert_eq!(migrated.permission(&id("n1"), &id("n1")), None);
        assert_eq!(migrated.permission(&id("n1"), &id("n2")), Some(Allowed));
        assert!(migrated.validate().is_ok());
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct FakeDirectory {
        networks: Vec<NetworkId>,
        nodes: HashMap<NetworkId, Vec<&'static str>>,
        clients: HashMap<NetworkId, Vec<ExtClient>>,
        broken: Option<NetworkId>,
    }

    impl MemberDirectory for FakeDirectory {
        fn list_networks(&self) -> Result<Vec<Network>> {
            Ok(self
                .networks
                .iter()
                .map(|n| Network::new(n.clone(), Some("10.0.0.0/24".into()), None))
                .collect())
        }

        fn list_nodes(&self, network: &NetworkId) -> Result<Vec<NodeRecord>> {
            if self.broken.as_ref() == Some(network) {
                return Err(Error::Internal("directory offline".into()));
            }
            Ok(self
                .nodes
                .get(network)
                .into_iter()
                .flatten()
                .map(|n| NodeRecord {
                    id: id(n),
                    network: network.clone(),
                    created_at: 0,
                })
                .collect())
        }

        fn list_external_clients(&self, network: &NetworkId) -> Result<Vec<ExtClient>> {
            Ok(self.clients.get(network).cloned().unwrap_or_default())
        }
    }

    struct Harness {
        db: Database,
        acls: AclService,
    }

    impl Harness {
        fn new() -> Self {
            let db = Database::open_memory().unwrap();
            let store = SqlitePermissionStore::new(&db);
            let acls = AclService::new(Arc::new(store), PeerUpdateNotifier::disabled());
            Self { db, acls }
        }

        fn seed(&self, network: &str, nodes: &[&str]) {
            self.acls
                .store()
                .save(&net(network), &node_matrix(nodes), 0)
                .unwrap();
        }

        fn migration(&self, directory: FakeDirectory) -> AclMigration {
            AclMigration::new(Arc::new(directory), self.acls.clone(), self.db.clone())
        }
    }

    #[test]
    fn test_failed_network_does_not_stop_others() {
        let harness = Harness::new();
        harness.seed("net1", &["n1", "n2"]);
        harness.seed("net2", &["m1"]);
        harness.seed("net3", &["x1"]);

        let mut directory = FakeDirectory {
            networks: vec![net("net1"), net("net2"), net("net3")],
            broken: Some(net("net2")),
            ..Default::default()
        };
        directory.nodes.insert(net("net1"), vec!["n1", "n2"]);
        directory.nodes.insert(net("net3"), vec!["x1", "dup"]);
        directory
            .clients
            .insert(net("net1"), vec![client("net1", "c1", &["n2"])]);
        // Node and client share an id: the roster refuses it
        directory
            .clients
            .insert(net("net3"), vec![client("net3", "dup", &[])]);

        let report = harness.migration(directory).run();

        assert!(!report.is_clean());
        assert!(matches!(
            report.status_of(&net("net1")),
            Some(MigrationStatus::Migrated(_))
        ));
        assert!(matches!(
            report.status_of(&net("net2")),
            Some(MigrationStatus::Failed(_))
        ));
        assert!(matches!(
            report.status_of(&net("net3")),
            Some(MigrationStatus::Failed(_))
        ));

        let net1 = harness.acls.get_matrix(&net("net1")).unwrap();
        assert_eq!(net1.permission(&id("c1"), &id("n2")), Some(NotAllowed));

        // Failed networks keep their old matrix
        let net3 = harness.acls.get_matrix(&net("net3")).unwrap();
        assert_eq!(net3, node_matrix(&["x1"]));
    }

    #[test]
    fn test_legacy_node_self_entry_does_not_block_network() {
        let harness = Harness::new();
        let legacy: AclContainer =
            serde_json::from_str(r#"{"n1":{"n1":2,"n2":2},"n2":{"n1":2}}"#).unwrap();
        harness.acls.store().save(&net("net1"), &legacy, 0).unwrap();

        let directory = || {
            let mut d = FakeDirectory {
                networks: vec![net("net1")],
                ..Default::default()
            };
            d.nodes.insert(net("net1"), vec!["n1", "n2"]);
            d.clients
                .insert(net("net1"), vec![client("net1", "c1", &[])]);
            d
        };

        let report = harness.migration(directory()).run();
        match report.status_of(&net("net1")) {
            Some(MigrationStatus::Migrated(stats)) => {
                assert_eq!(stats.self_entries_removed, vec![id("n1")]);
            }
            other => panic!("unexpected status {:?}", other),
        }

        let matrix = harness.acls.get_matrix(&net("net1")).unwrap();
        assert!(matrix.validate().is_ok());
        assert_eq!(matrix.permission(&id("c1"), &id("n1")), Some(Allowed));
        assert_eq!(matrix.permission(&id("n2"), &id("c1")), Some(Allowed));

        let again = harness.migration(directory()).run();
        assert_eq!(again.status_of(&net("net1")), Some(&MigrationStatus::AlreadyMigrated));
    }

    #[test]
    fn test_migration_runs_once_per_version() {
        let harness = Harness::new();
        harness.seed("net1", &["n1"]);

        let directory = || {
            let mut d = FakeDirectory {
                networks: vec![net("net1"), net("empty")],
                ..Default::default()
            };
            d.nodes.insert(net("net1"), vec!["n1"]);
            d.clients
                .insert(net("net1"), vec![client("net1", "c1", &[])]);
            d
        };

        let first = harness.migration(directory()).run();
        assert!(first.is_clean());
        assert_eq!(first.migrated().count(), 1);
        assert_eq!(first.status_of(&net("empty")), Some(&MigrationStatus::NoMatrix));

        let second = harness.migration(directory()).run();
        assert_eq!(
            second.status_of(&net("net1")),
            Some(&MigrationStatus::AlreadyMigrated)
        );

        let forced = harness.migration(directory()).force(true).run();
        match forced.status_of(&net("net1")) {
            Some(MigrationStatus::Migrated(stats)) => {
                assert_eq!(stats.client_rows_added, 0);
                assert!(stats.removed_members.is_empty());
            }
            other => panic!("unexpected status {:?}", other),
        }
    }
}
