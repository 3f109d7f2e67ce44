//! Push-channel connection lifecycle for one subscription.
//!
//! [`ConnectionMachine`] is the pure state machine; [`ConnectionManager`]
//! spawns a driver task per subscription that performs the I/O and feeds the
//! machine. Consumers get a [`ConnectionHandle`] carrying the event stream and
//! a `watch` view of the current [`ConnectionState`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::ReconnectPolicy;
use super::credentials::Credentials;
use super::heartbeat::{heartbeat_frame, HeartbeatConfig, HeartbeatStats, HeartbeatTracker};
use super::message::{InboundMessage, MessageKind};
use super::router::{MessageRouter, RouterStats};
use super::subscription::{Subscription, SubscriptionId};
use super::transport::{Connector, Endpoint, Transport};
use super::view::scope_label;
use crate::config::duration_ms;
use crate::errors::TransportError;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful connect.
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
            next_retry_at: None,
        }
    }
}

/// Connection lifecycle without I/O.
///
/// `Closed` is terminal: every transition out of it is refused, so late
/// results from a cancelled handshake cannot resurrect a closed handle.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::default(),
            policy,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.status == ConnectionStatus::Closed
    }

    /// `Disconnected | Reconnecting -> Connecting`.
    pub fn begin_connect(&mut self) -> bool {
        match self.state.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {
                self.state.status = ConnectionStatus::Connecting;
                self.state.next_retry_at = None;
                true
            }
            _ => false,
        }
    }

    /// `Connecting -> Connected`; resets the attempt counter.
    pub fn handshake_succeeded(&mut self) -> bool {
        if self.state.status != ConnectionStatus::Connecting {
            return false;
        }
        self.state = ConnectionState {
            status: ConnectionStatus::Connected,
            attempt: 0,
            next_retry_at: None,
        };
        true
    }

    /// `Connecting | Connected -> Reconnecting`. Returns the backoff to wait
    /// before the next attempt.
    pub fn connection_lost(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        match self.state.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                self.state.attempt = self.state.attempt.saturating_add(1);
                let delay = self.policy.delay_for_attempt(self.state.attempt);
                self.state.status = ConnectionStatus::Reconnecting;
                self.state.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                Some(delay)
            }
            _ => None,
        }
    }

    /// Handshake rejected the credentials: straight to `Closed`.
    pub fn auth_failed(&mut self) -> bool {
        if self.state.status != ConnectionStatus::Connecting {
            return false;
        }
        self.close()
    }

    /// Any state `-> Closed`. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state.status = ConnectionStatus::Closed;
        self.state.next_retry_at = None;
        true
    }
}

// ---------------------------------------------------------------------------
// Events & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    TransportDropped(String),
    HeartbeatTimeout,
    ConnectFailed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportDropped(why) => write!(f, "transport dropped: {}", why),
            Self::HeartbeatTimeout => f.write_str("heartbeat timed out"),
            Self::ConnectFailed(why) => write!(f, "connect failed: {}", why),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    AuthFailed,
}

/// Lifecycle events emitted by a connection, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(DisconnectReason),
    Frame(InboundMessage),
    Error(ConnectionErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatConfig,
    /// Upper bound on one handshake; expiry counts as a transient failure.
    #[serde(with = "duration_ms", rename = "handshake_timeout_ms")]
    pub handshake_timeout: Duration,
    /// Capacity of the event channel between driver and consumer.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// Statistics for one connection handle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful handshakes
    pub connects: u64,
    /// Transitions into `Reconnecting`
    pub reconnects: u64,
    /// Raw frames received, before routing
    pub frames_received: u64,
    pub heartbeat: HeartbeatStats,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    pings: AtomicU64,
    acks: AtomicU64,
    timeouts: AtomicU64,
}

struct Shared {
    machine: Mutex<ConnectionMachine>,
    state_tx: watch::Sender<ConnectionState>,
    router: MessageRouter,
    counters: Counters,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Run one machine transition and publish the resulting state.
    fn transition<R>(&self, f: impl FnOnce(&mut ConnectionMachine) -> R) -> R {
        let mut machine = self.machine.lock();
        let result = f(&mut machine);
        self.state_tx.send_if_modified(|current| {
            if current == machine.state() {
                false
            } else {
                *current = machine.state().clone();
                true
            }
        });
        result
    }

    /// Move to `Closed` and stop the driver. `false` if already closed.
    fn close(&self) -> bool {
        let closed = self.transition(|m| m.close());
        self.shutdown.send_replace(true);
        closed
    }
}

// ---------------------------------------------------------------------------
// Manager & handle
// ---------------------------------------------------------------------------

/// Opens one supervised push-channel connection per subscription.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, credentials: Credentials, config: ConnectionConfig) -> Self {
        Self {
            connector,
            credentials,
            config,
        }
    }

    /// Start connecting on behalf of `subscription`. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self, endpoint: &Endpoint, subscription: &Subscription) -> ConnectionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            machine: Mutex::new(ConnectionMachine::new(self.config.reconnect.clone())),
            state_tx,
            router: MessageRouter::new(subscription.scope().clone()),
            counters: Counters::default(),
            shutdown: shutdown_tx,
        });

        let driver = Driver {
            shared: shared.clone(),
            connector: self.connector.clone(),
            credentials: self.credentials.clone(),
            config: self.config.clone(),
            url: endpoint.for_subscription(subscription),
            label: format!("{}/{}", subscription.viewer_id(), scope_label(subscription.scope())),
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        ConnectionHandle {
            subscription_id: subscription.id(),
            shared,
            state_rx,
            events: events_rx,
            task: Some(task),
        }
    }
}

/// A live connection owned by exactly one subscription.
///
/// Dropping the handle closes it.
pub struct ConnectionHandle {
    subscription_id: SubscriptionId,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    events: mpsc::Receiver<ConnectionEvent>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Next lifecycle event; `None` once the driver has stopped and every
    /// buffered event was consumed.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Close the connection. Takes effect immediately and is safe to call
    /// any number of times.
    pub fn close(&mut self) {
        if self.shared.close() {
            debug!(subscription = %self.subscription_id, "connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.machine.lock().is_closed()
    }

    /// Read-only view of this connection that outlives moves of the handle.
    pub fn monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor {
            shared: self.shared.clone(),
        }
    }

    pub fn router_stats(&self) -> RouterStats {
        self.shared.router.stats()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.monitor().stats()
    }

    /// Close and wait for the driver task to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Cheap, cloneable read access to a connection's state and counters.
#[derive(Clone)]
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
}

impl ConnectionMonitor {
    pub fn state(&self) -> ConnectionState {
        self.shared.machine.lock().state().clone()
    }

    /// Close on behalf of the owner of the handle.
    pub(crate) fn close(&self) {
        self.shared.close();
    }

    pub fn router_stats(&self) -> RouterStats {
        self.shared.router.stats()
    }

    pub fn stats(&self) -> ConnectionStats {
        let c = &self.shared.counters;
        ConnectionStats {
            connects: c.connects.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            heartbeat: HeartbeatStats {
                total_pings: c.pings.load(Ordering::Relaxed),
                total_acks: c.acks.load(Ordering::Relaxed),
                total_timeouts: c.timeouts.load(Ordering::Relaxed),
            },
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Driven {
    Lost(DisconnectReason),
    Shutdown,
}

struct Driver {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    config: ConnectionConfig,
    url: Url,
    label: String,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if !self.shared.transition(|m| m.begin_connect()) {
                break;
            }
            debug!(connection = %self.label, "connecting");

            let handshake = tokio::time::timeout(
                self.config.handshake_timeout,
                self.connector.connect(&self.url, &self.credentials),
            );
            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                result = handshake => result,
            };

            let reason = match result {
                Ok(Ok(mut transport)) => {
                    if !self.shared.transition(|m| m.handshake_succeeded()) {
                        transport.close().await;
                        break;
                    }
                    self.shared.counters.connects.fetch_add(1, Ordering::Relaxed);
                    info!(connection = %self.label, "connected");
                    if !self.emit(ConnectionEvent::Connected).await {
                        transport.close().await;
                        break;
                    }
                    match self.drive(transport.as_mut()).await {
                        Driven::Lost(reason) => reason,
                        Driven::Shutdown => break,
                    }
                }
                Ok(Err(err)) if err.is_terminal() => {
                    self.shared.transition(|m| m.auth_failed());
                    warn!(connection = %self.label, "handshake rejected credentials, closing");
                    self.emit(ConnectionEvent::Error(ConnectionErrorKind::AuthFailed)).await;
                    break;
                }
                Ok(Err(err)) => DisconnectReason::ConnectFailed(err.to_string()),
                Err(_) => DisconnectReason::ConnectFailed(TransportError::Timeout("handshake").to_string()),
            };

            let lost = self
                .shared
                .transition(|m| m.connection_lost(Utc::now()).map(|delay| (delay, m.state().attempt)));
            let Some((delay, attempt)) = lost else {
                break;
            };
            self.shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                connection = %self.label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "reconnecting"
            );
            if !self.emit(ConnectionEvent::Disconnected(reason)).await {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(connection = %self.label, "driver stopped");
    }

    /// Pump one established connection until it is lost or shut down.
    async fn drive(&mut self, transport: &mut dyn Transport) -> Driven {
        let interval = self.config.heartbeat.interval;
        let mut heartbeat = HeartbeatTracker::new(&self.config.heartbeat);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lost = loop {
            let deadline = heartbeat.deadline();
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    transport.close().await;
                    return Driven::Shutdown;
                }
                _ = deadline_elapsed(deadline) => {
                    self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(connection = %self.label, "no heartbeat ack before deadline");
                    break DisconnectReason::HeartbeatTimeout;
                }
                _ = ticker.tick() => {
                    heartbeat.ping_sent(Instant::now());
                    self.shared.counters.pings.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = transport.send_text(heartbeat_frame()).await {
                        break DisconnectReason::TransportDropped(err.to_string());
                    }
                }
                frame = transport.recv_text() => match frame {
                    None => break DisconnectReason::TransportDropped("closed by peer".into()),
                    Some(Err(err)) => break DisconnectReason::TransportDropped(err.to_string()),
                    Some(Ok(raw)) => {
                        self.shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        let Some(message) = self.shared.router.dispatch(&raw) else {
                            continue;
                        };
                        if message.kind == MessageKind::HeartbeatAck {
                            heartbeat.ack_received();
                            self.shared.counters.acks.fetch_add(1, Ordering::Relaxed);
                        }
                        if !self.emit(ConnectionEvent::Frame(message)).await {
                            transport.close().await;
                            return Driven::Shutdown;
                        }
                    }
                },
            }
        };

        transport.close().await;
        Driven::Lost(lost)
    }

    /// Deliver an event unless shutdown wins first. `false` means stop.
    async fn emit(&mut self, event: ConnectionEvent) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
