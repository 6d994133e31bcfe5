//! Peer update notifications
//!
//! After every successful ACL save the control plane asks connected mesh
//! agents to re-pull their peer configuration. Delivery is best effort:
//! agents also refresh on their own schedule, so a lost notification only
//! delays convergence.
//!
//! Saves enqueue onto a bounded channel without waiting. A
//! [`PeerUpdatePublisher`] drains the channel and hands each update to a
//! [`PeerUpdateTransport`].

use crate::types::NetworkId;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Instruction for agents to refresh their peer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub id: Uuid,
    /// Network whose ACL changed
    pub network: NetworkId,
    pub issued_at: i64,
}

impl PeerUpdate {
    pub fn new(network: NetworkId) -> Self {
        Self {
            id: Uuid::new_v4(),
            network,
            issued_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Messaging backend that reaches the agents
#[async_trait]
pub trait PeerUpdateTransport: Send + Sync {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()>;
}

/// Handle used by writers to request a peer update
#[derive(Clone, Debug)]
pub struct PeerUpdateNotifier {
    tx: Option<mpsc::Sender<PeerUpdate>>,
}

impl PeerUpdateNotifier {
    /// Create an enabled notifier and the queue it feeds
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PeerUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Notifier for deployments without a messaging backend
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a peer update for `network` without blocking.
    ///
    /// Returns true if the update was queued. A full or closed queue drops the
    /// update with a warning.
    pub fn notify_peer_update(&self, network: &NetworkId) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(PeerUpdate::new(network.clone())) {
            Ok(()) => {
                debug!("Queued peer update for network {}", network);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Peer update queue full, dropping update for network {}", network);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Peer update publisher stopped, dropping update for network {}", network);
                false
            }
        }
    }
}

/// Drains queued updates into a transport
pub struct PeerUpdatePublisher {
    rx: mpsc::Receiver<PeerUpdate>,
    transport: Arc<dyn PeerUpdateTransport>,
    timeout: Duration,
}

impl PeerUpdatePublisher {
    pub fn new(
        rx: mpsc::Receiver<PeerUpdate>,
        transport: Arc<dyn PeerUpdateTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            rx,
            transport,
            timeout,
        }
    }

    /// Publish until every notifier handle is dropped
    pub async fn run(mut self) {
        info!("Peer update publisher started");
        while let Some(update) = self.rx.recv().await {
            if let Err(e) = self.publish(&update).await {
                warn!("Failed to publish peer update for network {}: {}", update.network, e);
            }
        }
        info!("Peer update publisher stopped");
    }

    /// One bounded attempt; failures are not retried
    async fn publish(&self, update: &PeerUpdate) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.transport.publish_peer_update(update)).await
        {
            Ok(Ok(())) => {
                debug!("Published peer update {} for network {}", update.id, update.network);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                millis: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// In-process fan-out to agents attached to this control plane
#[derive(Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<PeerUpdate>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerUpdate> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PeerUpdateTransport for BroadcastTransport {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()> {
        match self.tx.send(update.clone()) {
            Ok(agents) => debug!("Peer update delivered to {} agent(s)", agents),
            Err(_) => debug!("No agents connected, peer update {} not delivered", update.id),
        }
        Ok(())
    }
}

/// Posts updates to a message broker's HTTP ingress
#[derive(Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PeerUpdateTransport for WebhookTransport {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
