//! ACL entry points used by the HTTP layer and the migration driver

use crate::acl::{AclContainer, AclId, Permission};
use crate::notify::PeerUpdateNotifier;
use crate::store::PermissionStore;
use crate::types::{NetworkId, Versioned};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load, mutate and save network ACL matrices
#[derive(Clone)]
pub struct AclService {
    store: Arc<dyn PermissionStore>,
    notifier: PeerUpdateNotifier,
}

impl AclService {
    pub fn new(store: Arc<dyn PermissionStore>, notifier: PeerUpdateNotifier) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    /// Current matrix of a network together with its version. A network
    /// without a stored matrix yields an empty one at version 0.
    pub fn load(&self, network: &NetworkId) -> Result<Versioned<AclContainer>> {
        match self.store.load(network) {
            Ok(matrix) => Ok(matrix),
            Err(e) if e.is_not_found() => {
                debug!("No ACL stored for network {}, using empty matrix", network);
                Ok(Versioned::unversioned(AclContainer::new()))
            }
            Err(e) => Err(e),
        }
    }

    /// Current matrix of a network, empty when none is stored
    pub fn get_matrix(&self, network: &NetworkId) -> Result<AclContainer> {
        self.load(network).map(Versioned::into_inner)
    }

    /// Validate and persist a whole matrix, then request a peer update.
    ///
    /// `expected_version` must be the version the matrix was loaded at.
    pub fn save(
        &self,
        network: &NetworkId,
        matrix: &AclContainer,
        expected_version: u64,
    ) -> Result<Versioned<AclContainer>> {
        matrix.validate()?;
        let saved = self.store.save(network, matrix, expected_version)?;
        info!(
            "Updated ACLs for network {} ({} members, version {})",
            network,
            saved.value.len(),
            saved.version
        );
        self.notifier.notify_peer_update(network);
        Ok(saved)
    }

    /// Replace the rows named in `overlay` and save.
    ///
    /// Fails with a conflict if the matrix changed between the read and the
    /// write; the caller retries with a fresh read.
    pub fn overlay_and_save(
        &self,
        network: &NetworkId,
        overlay: AclContainer,
    ) -> Result<AclContainer> {
        overlay.validate()?;

        let Versioned {
            value: mut matrix,
            version,
        } = self.load(network)?;
        matrix.apply_overlay(overlay);

        let asymmetric = matrix.asymmetric_pairs();
        if !asymmetric.is_empty() {
            warn!(
                "ACL overlay for network {} leaves {} pair(s) with differing directions",
                network,
                asymmetric.len()
            );
        }

        Ok(self.save(network, &matrix, version)?.into_inner())
    }

    /// Decode a raw overlay payload and apply it
    pub fn overlay_and_save_json(&self, network: &NetworkId, body: &[u8]) -> Result<AclContainer> {
        let overlay = AclContainer::parse_overlay(body)?;
        self.overlay_and_save(network, overlay)
    }

    /// Set the permission between two members, both directions at once
    pub fn set_permission(
        &self,
        network: &NetworkId,
        a: &AclId,
        b: &AclId,
        permission: Permission,
    ) -> Result<AclContainer> {
        let Versioned {
            value: mut matrix,
            version,
        } = self.load(network)?;
        matrix.set_permission(a, b, permission)?;
        Ok(self.save(network, &matrix, version)?.into_inner())
    }
}
