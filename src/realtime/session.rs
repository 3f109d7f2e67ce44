//! One live subscription: its connection, its view and its snapshot pulls.
//!
//! A single task owns the [`DashboardView`] and multiplexes connection
//! events, fetch completions, refresh ticks and shutdown, so every mutation
//! of the view happens in routing order on one task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connection::{
    shutdown_requested, ConnectionErrorKind, ConnectionEvent, ConnectionHandle, ConnectionMonitor,
    ConnectionState, ConnectionStatus,
};
use super::message::InboundMessage;
use super::reconcile::{self, OutcomeReason, ReconciliationOutcome};
use super::snapshot::{FetchedSnapshot, SnapshotFetcher};
use super::subscription::{Subscription, SubscriptionId};
use super::view::{scope_label, DashboardView};
use crate::config::SyncConfig;
use crate::errors::{FetchError, SurfacedError};

/// What a consumer sees for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub view: DashboardView,
    /// The last snapshot refresh failed; `view` may be outdated.
    pub stale: bool,
    pub connectivity: ConnectionStatus,
    pub last_error: Option<SurfacedError>,
    pub last_outcome: Option<ReconciliationOutcome>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            view: DashboardView::default(),
            stale: false,
            connectivity: ConnectionStatus::Disconnected,
            last_error: None,
            last_outcome: None,
        }
    }
}

/// Stats for one session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Snapshot fetches started, periodic and on demand
    pub fetches_started: u64,
    /// Refetch requests folded into a fetch already in flight
    pub refetches_coalesced: u64,
    /// Observer messages dropped because the observer lagged
    pub observer_dropped: u64,
}

#[derive(Default)]
struct Counters {
    fetches_started: AtomicU64,
    refetches_coalesced: AtomicU64,
    observer_dropped: AtomicU64,
}

type FetchResult = (SubscriptionId, Result<FetchedSnapshot, FetchError>);

pub struct Session {
    subscription: Subscription,
    view_rx: watch::Receiver<ViewState>,
    observer: Option<mpsc::Receiver<InboundMessage>>,
    connection: ConnectionMonitor,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Take ownership of `handle` and start driving the subscription.
    pub fn spawn(
        subscription: Subscription,
        handle: ConnectionHandle,
        fetcher: Arc<SnapshotFetcher>,
        config: &SyncConfig,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(ViewState::default());
        let (observer_tx, observer_rx) = mpsc::channel(config.observer_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let connection = handle.monitor();

        let task = SessionTask {
            subscription: subscription.clone(),
            state: ViewState::default(),
            handle,
            fetcher,
            view_tx,
            observer_tx,
            counters: counters.clone(),
            shutdown: shutdown_rx,
            fetches: JoinSet::new(),
            refetch_pending: false,
            connected_before: false,
            connection_done: false,
            refresh_enabled: true,
        };
        let task = tokio::spawn(task.run());

        Self {
            subscription,
            view_rx,
            observer: Some(observer_rx),
            connection,
            counters,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view_rx.clone()
    }

    pub fn current(&self) -> ViewState {
        self.view_rx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    /// The notification/ack stream. Can be taken once.
    pub fn take_observer(&mut self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.observer.take()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            fetches_started: self.counters.fetches_started.load(Ordering::Relaxed),
            refetches_coalesced: self.counters.refetches_coalesced.load(Ordering::Relaxed),
            observer_dropped: self.counters.observer_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the session. In-flight fetches are abandoned and the connection
    /// is closed. Idempotent.
    pub fn close(&mut self) {
        self.connection.close();
        self.shutdown.send_replace(true);
    }

    /// Close and wait until the task has released everything it held.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionTask {
    subscription: Subscription,
    state: ViewState,
    handle: ConnectionHandle,
    fetcher: Arc<SnapshotFetcher>,
    view_tx: watch::Sender<ViewState>,
    observer_tx: mpsc::Sender<InboundMessage>,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
    fetches: JoinSet<FetchResult>,
    refetch_pending: bool,
    connected_before: bool,
    connection_done: bool,
    refresh_enabled: bool,
}

impl SessionTask {
    async fn run(mut self) {
        let mut connection_state = self.handle.watch_state();
        let mut refresh = tokio::time::interval(self.fetcher.config().refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            viewer = %self.subscription.viewer_id(),
            scope = scope_label(self.subscription.scope()),
            subscription = %self.subscription.id(),
            "session started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                changed = connection_state.changed() => {
                    if changed.is_ok() {
                        let status = connection_state.borrow_and_update().status;
                        self.state.connectivity = status;
                        self.publish();
                    }
                }
                event = self.handle.recv(), if !self.connection_done => match event {
                    Some(event) => self.on_event(event),
                    None => self.connection_done = true,
                },
                Some(joined) = self.fetches.join_next() => self.on_fetch_done(joined),
                _ = refresh.tick(), if self.refresh_enabled => self.request_fetch("refresh"),
            }
        }

        self.fetches.abort_all();
        self.handle.close();
        self.state.connectivity = ConnectionStatus::Closed;
        self.publish();
        debug!(subscription = %self.subscription.id(), "session stopped");

        let SessionTask { handle, .. } = self;
        handle.shutdown().await;
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                // pushes sent while we were away are lost; resync from a snapshot
                if self.connected_before {
                    self.request_fetch("reconnected");
                }
                self.connected_before = true;
            }
            ConnectionEvent::Disconnected(reason) => {
                debug!(subscription = %self.subscription.id(), reason = %reason, "disconnected");
            }
            ConnectionEvent::Error(ConnectionErrorKind::AuthFailed) => {
                warn!(viewer = %self.subscription.viewer_id(), "live updates stopped: authentication failed");
                self.state.last_error = Some(SurfacedError::AuthFailed);
                self.state.connectivity = ConnectionStatus::Closed;
                self.refresh_enabled = false;
                self.publish();
            }
            ConnectionEvent::Frame(message) => self.on_frame(message),
        }
    }

    fn on_frame(&mut self, message: InboundMessage) {
        if message.kind.is_observational() {
            self.observe(message.clone());
        }

        let (next, outcome) = reconcile::apply(&self.state.view, &message);
        if outcome.applied {
            self.state.view = next;
        }
        if outcome.refetch {
            let reason = match outcome.reason {
                OutcomeReason::RejectedIncompletePayload => "incomplete patch",
                _ => "invalidated",
            };
            self.request_fetch(reason);
        }
        self.state.last_outcome = Some(outcome);
        self.publish();
    }

    fn observe(&mut self, message: InboundMessage) {
        match self.observer_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.observer_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Start a snapshot pull for the subscription's scope, or fold the
    /// request into the one already running.
    ///
    /// Every message that reaches this session is covered by the
    /// subscription's own scope, and a wider pull would leak other stores
    /// into a store-scoped view.
    fn request_fetch(&mut self, reason: &'static str) {
        if !self.fetches.is_empty() {
            if !self.refetch_pending {
                self.refetch_pending = true;
                self.counters.refetches_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        debug!(subscription = %self.subscription.id(), reason, "fetching snapshot");
        self.counters.fetches_started.fetch_add(1, Ordering::Relaxed);
        let fetcher = self.fetcher.clone();
        let id = self.subscription.id();
        let scope = self.subscription.scope().clone();
        self.fetches.spawn(async move { (id, fetcher.fetch(&scope).await) });
    }

    fn on_fetch_done(&mut self, joined: Result<FetchResult, JoinError>) {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                warn!(subscription = %self.subscription.id(), error = %err, "snapshot task failed");
                return;
            }
        };
        if id != self.subscription.id() {
            debug!(subscription = %self.subscription.id(), late = %id, "discarding foreign fetch result");
            return;
        }

        match result {
            Ok(fetched) => {
                self.state.stale = false;
                if matches!(self.state.last_error, Some(SurfacedError::SnapshotStale { .. })) {
                    self.state.last_error = None;
                }
                let (next, outcome) =
                    reconcile::apply_snapshot(&self.state.view, &fetched.snapshot, fetched.completed_at);
                if outcome.applied {
                    self.state.view = next;
                }
                self.state.last_outcome = Some(outcome);
            }
            Err(FetchError::Unauthorized) => {
                warn!(viewer = %self.subscription.viewer_id(), "snapshot source rejected credentials");
                self.state.stale = true;
                self.state.last_error = Some(SurfacedError::AuthFailed);
            }
            Err(err) => {
                let (attempts, last_error) = match err {
                    FetchError::Exhausted { attempts, last } => (attempts, last.to_string()),
                    other => (1, other.to_string()),
                };
                warn!(
                    viewer = %self.subscription.viewer_id(),
                    attempts,
                    error = %last_error,
                    "snapshot refresh failed, keeping last good view"
                );
                self.state.stale = true;
                if self.state.last_error != Some(SurfacedError::AuthFailed) {
                    self.state.last_error = Some(SurfacedError::SnapshotStale { attempts, last_error });
                }
            }
        }
        self.publish();

        if self.refetch_pending {
            self.refetch_pending = false;
            self.request_fetch("coalesced");
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.state.clone());
    }
}
