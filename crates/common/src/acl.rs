//! Per-network ACL matrix
//!
//! A matrix maps every member of a network (mesh node or external client) to
//! its row: the permission it holds toward each peer it has an entry for.
//! Node ids and client ids share one key space, [`AclId`].
//!
//! Persisted shape, one record per network:
//!
//! ```json
//! { "node1": { "node2": 2, "client1": 1 }, "node2": { "node1": 2 } }
//! ```
//!
//! where `2` is [`Permission::Allowed`] and `1` is [`Permission::NotAllowed`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap, BTreeSet};

/// Permission applied when a pair has no entry in the matrix
pub const DEFAULT_PERMISSION: Permission = Permission::NotAllowed;

/// Member key inside a network's ACL matrix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AclId(String);

impl AclId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("ACL member id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AclId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AclId> for String {
    fn from(id: AclId) -> Self {
        id.0
    }
}

impl std::str::FromStr for AclId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for AclId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A network member, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MemberId {
    Node(AclId),
    Client(AclId),
}

impl MemberId {
    pub fn acl_id(&self) -> &AclId {
        match self {
            MemberId::Node(id) | MemberId::Client(id) => id,
        }
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberId::Node(id) => write!(f, "node:{}", id),
            MemberId::Client(id) => write!(f, "client:{}", id),
        }
    }
}

/// The live members of one network.
///
/// Construction fails when a client id collides with a node id, so every
/// [`AclId`] resolves to exactly one [`MemberId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberRoster {
    nodes: BTreeSet<AclId>,
    clients: BTreeSet<AclId>,
}

impl MemberRoster {
    pub fn new(
        nodes: impl IntoIterator<Item = AclId>,
        clients: impl IntoIterator<Item = AclId>,
    ) -> Result<Self> {
        let nodes: BTreeSet<AclId> = nodes.into_iter().collect();
        let clients: BTreeSet<AclId> = clients.into_iter().collect();

        if let Some(clash) = nodes.intersection(&clients).next() {
            return Err(Error::Validation(format!(
                "member id '{}' is used by both a node and a client",
                clash
            )));
        }

        Ok(Self { nodes, clients })
    }

    pub fn resolve(&self, id: &AclId) -> Option<MemberId> {
        if self.nodes.contains(id) {
            Some(MemberId::Node(id.clone()))
        } else if self.clients.contains(id) {
            Some(MemberId::Client(id.clone()))
        } else {
            None
        }
    }

    pub fn members(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.nodes
            .iter()
            .cloned()
            .map(MemberId::Node)
            .chain(self.clients.iter().cloned().map(MemberId::Client))
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.clients.is_empty()
    }
}

/// Whether traffic between two members is permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Permission {
    NotAllowed,
    Allowed,
}

impl From<Permission> for u8 {
    fn from(p: Permission) -> Self {
        match p {
            Permission::NotAllowed => 1,
            Permission::Allowed => 2,
        }
    }
}

impl TryFrom<u8> for Permission {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Permission::NotAllowed),
            2 => Ok(Permission::Allowed),
            other => Err(format!("unknown ACL permission value: {}", other)),
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::NotAllowed => write!(f, "not_allowed"),
            Permission::Allowed => write!(f, "allowed"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not_allowed" => Ok(Permission::NotAllowed),
            "allowed" => Ok(Permission::Allowed),
            _ => Err(format!("unknown ACL permission: {}", s)),
        }
    }
}

/// One member's permissions toward its peers
pub type Acl = BTreeMap<AclId, Permission>;

/// The ACL matrix of a single network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclContainer(BTreeMap<AclId, Acl>);

impl AclContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an overlay payload. Malformed input is a validation failure.
    pub fn parse_overlay(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("malformed ACL payload: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_member(&self, id: &AclId) -> bool {
        self.0.contains_key(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &AclId> {
        self.0.keys()
    }

    pub fn rows(&self) -> btree_map::Iter<'_, AclId, Acl> {
        self.0.iter()
    }

    pub fn row(&self, id: &AclId) -> Option<&Acl> {
        self.0.get(id)
    }

    /// Return the row for `id`, creating an empty one if absent
    pub fn ensure_row(&mut self, id: &AclId) -> &mut Acl {
        self.0.entry(id.clone()).or_default()
    }

    /// Replace a whole row
    pub fn insert_row(&mut self, id: AclId, row: Acl) -> Option<Acl> {
        self.0.insert(id, row)
    }

    /// Stored permission of `from` toward `to`, if any
    pub fn permission(&self, from: &AclId, to: &AclId) -> Option<Permission> {
        self.0.get(from).and_then(|row| row.get(to)).copied()
    }

    /// Effective permission, with missing entries read as [`DEFAULT_PERMISSION`]
    pub fn is_allowed(&self, from: &AclId, to: &AclId) -> bool {
        self.permission(from, to).unwrap_or(DEFAULT_PERMISSION) == Permission::Allowed
    }

    /// Set the permission between two members in both directions.
    pub fn set_permission(&mut self, a: &AclId, b: &AclId, permission: Permission) -> Result<()> {
        if a == b {
            return Err(Error::Validation(format!(
                "member '{}' cannot hold an ACL entry for itself",
                a
            )));
        }
        self.ensure_row(a).insert(b.clone(), permission);
        self.ensure_row(b).insert(a.clone(), permission);
        Ok(())
    }

    /// Set a single directed entry. Callers own the symmetry of the pair.
    pub(crate) fn set_entry(&mut self, from: &AclId, to: &AclId, permission: Permission) {
        if from != to {
            self.ensure_row(from).insert(to.clone(), permission);
        }
    }

    /// Drop every entry a member holds for itself. Returns the members that
    /// had one.
    pub fn remove_self_entries(&mut self) -> Vec<AclId> {
        let mut cleared = Vec::new();
        for (id, row) in self.0.iter_mut() {
            if row.remove(id).is_some() {
                cleared.push(id.clone());
            }
        }
        cleared
    }

    /// Remove a member's row and every entry other rows hold for it.
    ///
    /// Returns true if anything was removed.
    pub fn remove_member(&mut self, id: &AclId) -> bool {
        let mut removed = false;
        for row in self.0.values_mut() {
            removed |= row.remove(id).is_some();
        }
        removed |= self.0.remove(id).is_some();
        removed
    }

    /// Replace every row present in `incoming`, leaving all other rows as they
    /// are. Rows are replaced whole; cells are never merged.
    pub fn apply_overlay(&mut self, incoming: AclContainer) {
        for (id, row) in incoming.0 {
            self.0.insert(id, row);
        }
    }

    /// Reject matrices in which a member holds an entry for itself
    pub fn validate(&self) -> Result<()> {
        for (id, row) in &self.0 {
            if row.contains_key(id) {
                return Err(Error::Validation(format!(
                    "member '{}' cannot hold an ACL entry for itself",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Pairs whose two directions disagree. A pair with only one direction
    /// present is reported too.
    pub fn asymmetric_pairs(&self) -> Vec<(AclId, AclId)> {
        let mut pairs = Vec::new();
        for (a, row) in &self.0 {
            for (b, permission) in row {
                let reverse = self.permission(b, a);
                if reverse == Some(*permission) {
                    continue;
                }
                // Reported from the other side already.
                if reverse.is_some() && b < a {
                    continue;
                }
                pairs.push((a.clone(), b.clone()));
            }
        }
        pairs
    }
}

impl FromIterator<(AclId, Acl)> for AclContainer {
    fn from_iter<I: IntoIterator<Item = (AclId, Acl)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AclContainer {
    type Item = (AclId, Acl);
    type IntoIter = btree_map::IntoIter<AclId, Acl>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
