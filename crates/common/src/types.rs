//! Core types for Meshplane

use crate::acl::AclId;
use crate::{Error, Result};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Network identifier (the network name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("network id must not be empty".to_string()));
        }
        if id.contains('/') {
            return Err(Error::Validation(format!(
                "network id '{}' must not contain '/'",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NetworkId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NetworkId> for String {
    fn from(id: NetworkId) -> Self {
        id.0
    }
}

impl FromStr for NetworkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mesh network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub net_id: NetworkId,
    /// IPv4 CIDR
    #[serde(default)]
    pub address_range: Option<String>,
    /// IPv6 CIDR
    #[serde(default)]
    pub address_range6: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl Network {
    pub fn new(
        net_id: NetworkId,
        address_range: Option<String>,
        address_range6: Option<String>,
    ) -> Self {
        Self {
            net_id,
            address_range: address_range.filter(|r| !r.trim().is_empty()),
            address_range6: address_range6.filter(|r| !r.trim().is_empty()),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Check that at least one address range is present and every present
    /// range parses as a CIDR of its family.
    pub fn validate(&self) -> Result<()> {
        let v4 = self.address_range.as_deref().filter(|r| !r.trim().is_empty());
        let v6 = self.address_range6.as_deref().filter(|r| !r.trim().is_empty());

        if v4.is_none() && v6.is_none() {
            return Err(Error::Validation("IPv4 or IPv6 CIDR required".to_string()));
        }
        if let Some(range) = v4 {
            Ipv4Network::from_str(range.trim()).map_err(|e| {
                Error::Validation(format!("invalid IPv4 range '{}': {}", range, e))
            })?;
        }
        if let Some(range) = v6 {
            Ipv6Network::from_str(range.trim()).map_err(|e| {
                Error::Validation(format!("invalid IPv6 range '{}': {}", range, e))
            })?;
        }
        Ok(())
    }
}

/// A mesh node as seen by the ACL engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: AclId,
    pub network: NetworkId,
    #[serde(default)]
    pub created_at: i64,
}

/// An external client attached through an ingress gateway.
///
/// `denied_acls` is the legacy per-client deny-list. The ACL migration folds it
/// into the network matrix, after which it is no longer consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtClient {
    pub client_id: AclId,
    pub network: NetworkId,
    #[serde(default)]
    pub denied_acls: BTreeSet<AclId>,
    #[serde(default)]
    pub created_at: i64,
}

impl ExtClient {
    pub fn denies(&self, peer: &AclId) -> bool {
        self.denied_acls.contains(peer)
    }
}

/// A stored value together with the version it was read at.
///
/// Version 0 means the value has never been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }

    pub fn unversioned(value: T) -> Self {
        Self { value, version: 0 }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}
