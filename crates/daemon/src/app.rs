//! Startup wiring shared by the binary and its tests

use crate::config::{DaemonConfig, MessagingConfig};
use meshplane_common::{
    AclMigration, AclService, BroadcastTransport, Database, MemberDirectory, MigrationReport,
    PeerUpdateNotifier, PeerUpdatePublisher, PeerUpdateTransport, SqliteDirectory,
    SqlitePermissionStore, WebhookTransport,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Long-lived components of a running daemon
pub struct App {
    pub db: Database,
    pub directory: SqliteDirectory,
    pub acls: AclService,
    pub publisher: Option<JoinHandle<()>>,
}

impl App {
    /// Open storage and start the peer update publisher.
    ///
    /// Must be called inside a tokio runtime when messaging is enabled.
    pub fn build(config: &DaemonConfig, db: Database) -> Self {
        let (notifier, publisher) = start_notifier(&config.messaging);
        let store = SqlitePermissionStore::new(&db);
        let acls = AclService::new(Arc::new(store), notifier);
        let directory = SqliteDirectory::new(db.clone());

        Self {
            db,
            directory,
            acls,
            publisher,
        }
    }

    /// Run the ACL migration off the async workers
    pub async fn migrate(&self, force: bool) -> anyhow::Result<MigrationReport> {
        let directory: Arc<dyn MemberDirectory> = Arc::new(self.directory.clone());
        let migration = AclMigration::new(directory, self.acls.clone(), self.db.clone()).force(force);

        let report = tokio::task::spawn_blocking(move || migration.run()).await?;
        log_report(&report);
        Ok(report)
    }
}

/// Build the notifier handle and, when enabled, spawn the task draining it
pub fn start_notifier(messaging: &MessagingConfig) -> (PeerUpdateNotifier, Option<JoinHandle<()>>) {
    if !messaging.enabled {
        info!("Messaging disabled, ACL writes will not trigger peer updates");
        return (PeerUpdateNotifier::disabled(), None);
    }

    let transport: Arc<dyn PeerUpdateTransport> = match &messaging.endpoint {
        Some(endpoint) => {
            info!("Publishing peer updates to {}", endpoint);
            Arc::new(WebhookTransport::new(endpoint.clone()))
        }
        None => {
            info!("Publishing peer updates to in-process agents");
            Arc::new(BroadcastTransport::new(messaging.queue_capacity))
        }
    };

    let (notifier, rx) = PeerUpdateNotifier::channel(messaging.queue_capacity);
    let publisher = PeerUpdatePublisher::new(rx, transport, messaging.publish_timeout());
    (notifier, Some(tokio::spawn(publisher.run())))
}

fn log_report(report: &MigrationReport) {
    if let Some(e) = &report.listing_error {
        error!("ACL migration did not run: {}", e);
        return;
    }
    for (network, reason) in report.failed() {
        warn!("ACL migration left network {} unchanged: {}", network, reason);
    }
    if report.is_clean() {
        info!("ACL migration complete for {} network(s)", report.outcomes.len());
    }
}
