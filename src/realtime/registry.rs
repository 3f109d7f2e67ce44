use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::info;

use super::connection::{ConnectionManager, ConnectionState, ConnectionStats};
use super::credentials::Credentials;
use super::message::InboundMessage;
use super::router::RouterStats;
use super::session::{Session, SessionStats, ViewState};
use super::snapshot::{SnapshotFetcher, SnapshotSource};
use super::subscription::{Subscription, ViewerId};
use super::transport::{Connector, Endpoint};
use super::view::{scope_label, Scope};
use crate::config::SyncConfig;
use crate::errors::Result;

/// Maps each viewer to its single live session.
///
/// Subscribing again with the same viewer tears the previous session down
/// before the new connection is opened. All methods take `&self`.
///
/// ```ignore
/// let registry = SubscriptionRegistry::new(endpoint, connector, source, creds, SyncConfig::default())?;
/// let sub = registry.subscribe("operator-1".into(), Some(StoreId::new("S1")));
/// let mut view = registry.view(sub.viewer_id()).unwrap();
/// view.changed().await?;
/// registry.unsubscribe(&sub);
/// ```
pub struct SubscriptionRegistry {
    sessions: Arc<DashMap<ViewerId, Session>>,
    endpoint: Endpoint,
    connections: ConnectionManager,
    fetcher: Arc<SnapshotFetcher>,
    config: SyncConfig,
}

impl SubscriptionRegistry {
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        source: Arc<dyn SnapshotSource>,
        credentials: Credentials,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sessions: Arc::new(DashMap::new()),
            endpoint,
            connections: ConnectionManager::new(connector, credentials, config.connection.clone()),
            fetcher: Arc::new(SnapshotFetcher::new(source, config.fetch.clone())),
            config,
        })
    }

    /// Start a subscription for `viewer_id`, replacing any existing one.
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, viewer_id: ViewerId, scope: Scope) -> Subscription {
        let subscription = Subscription::new(viewer_id.clone(), scope);

        match self.sessions.entry(viewer_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get_mut();
                info!(
                    viewer = %subscription.viewer_id(),
                    replaced = %previous.subscription().id(),
                    "replacing subscription"
                );
                // the old connection must be gone before the new one opens
                previous.close();
                let session = self.start(&subscription);
                entry.insert(session);
            }
            Entry::Vacant(entry) => {
                entry.insert(self.start(&subscription));
            }
        }

        info!(
            viewer = %subscription.viewer_id(),
            scope = scope_label(subscription.scope()),
            subscription = %subscription.id(),
            "subscribed"
        );
        subscription
    }

    fn start(&self, subscription: &Subscription) -> Session {
        let handle = self.connections.connect(&self.endpoint, subscription);
        Session::spawn(subscription.clone(), handle, self.fetcher.clone(), &self.config)
    }

    /// End `subscription`. Returns `false` if it was already gone or had
    /// been replaced by a newer subscription for the same viewer.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = self
            .sessions
            .remove_if(subscription.viewer_id(), |_, session| {
                session.subscription().id() == subscription.id()
            });
        match removed {
            Some((_, mut session)) => {
                session.close();
                info!(viewer = %subscription.viewer_id(), subscription = %subscription.id(), "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscription(&self, viewer_id: &ViewerId) -> Option<Subscription> {
        self.sessions.get(viewer_id).map(|s| s.subscription().clone())
    }

    /// Reconciled view updates for the viewer's live subscription.
    pub fn view(&self, viewer_id: &ViewerId) -> Option<watch::Receiver<ViewState>> {
        self.sessions.get(viewer_id).map(|s| s.view())
    }

    /// Notifications and heartbeat acks for the viewer's live subscription.
    /// Available once per subscription.
    pub fn take_observer(&self, viewer_id: &ViewerId) -> Option<mpsc::Receiver<InboundMessage>> {
        self.sessions.get_mut(viewer_id).and_then(|mut s| s.take_observer())
    }

    pub fn connection_state(&self, viewer_id: &ViewerId) -> Option<ConnectionState> {
        self.sessions.get(viewer_id).map(|s| s.connection_state())
    }

    pub fn connection_stats(&self, viewer_id: &ViewerId) -> Option<ConnectionStats> {
        self.sessions.get(viewer_id).map(|s| s.connection().stats())
    }

    pub fn router_stats(&self, viewer_id: &ViewerId) -> Option<RouterStats> {
        self.sessions.get(viewer_id).map(|s| s.connection().router_stats())
    }

    pub fn session_stats(&self, viewer_id: &ViewerId) -> Option<SessionStats> {
        self.sessions.get(viewer_id).map(|s| s.stats())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn viewers(&self) -> Vec<ViewerId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down every subscription and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        let viewers = self.viewers();
        let mut sessions = Vec::with_capacity(viewers.len());
        for viewer in viewers {
            if let Some((_, session)) = self.sessions.remove(&viewer) {
                sessions.push(session);
            }
        }
        for session in sessions {
            session.shutdown().await;
        }
        info!("subscription registry shut down");
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        for mut entry in self.sessions.iter_mut() {
            entry.value_mut().close();
        }
    }
}
