#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use url::Url;

use livesync::errors::{FetchError, TransportError};
use livesync::realtime::{
    Connector, Credentials, DashboardCounts, Endpoint, OverviewSnapshot, SnapshotSource,
    StoreCounts, StoreDetail, StoreId, StoreSnapshot, SubscriptionRegistry, Transport, ViewState,
};
use livesync::utils::format_iso;
use livesync::SyncConfig;

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// How the next handshake should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Fail,
    RejectAuth,
}

/// Server side of one accepted fake connection.
pub struct FakeServer {
    pub url: Url,
    push: mpsc::UnboundedSender<String>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    pub fn push(&self, frame: Value) {
        let _ = self.push.send(frame.to_string());
    }

    pub fn push_raw(&self, raw: &str) {
        let _ = self.push.send(raw.to_string());
    }

    /// Whether the client side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.push.is_closed()
    }

    /// Answer every heartbeat with an ack until the connection goes away.
    pub fn ack_heartbeats(mut self) {
        tokio::spawn(async move {
            while let Some(raw) = self.sent.recv().await {
                let frame: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                if frame["type"] == "heartbeat" {
                    self.push(json!({ "type": "heartbeat_ack", "ts": frame["ts"] }));
                }
            }
        });
    }
}

pub struct FakeConnector {
    script: Mutex<VecDeque<Handshake>>,
    servers: mpsc::UnboundedSender<FakeServer>,
    attempts: AtomicU32,
}

impl FakeConnector {
    /// Handshakes follow `script`, then always succeed.
    pub fn new(script: Vec<Handshake>) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            servers,
            attempts: AtomicU32::new(0),
        });
        (connector, accepted)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url, credentials: &Credentials) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        assert_eq!(credentials.token(), "test-token");

        let next = self.script.lock().pop_front().unwrap_or(Handshake::Accept);
        match next {
            Handshake::Fail => Err(TransportError::Connect("connection refused".into())),
            Handshake::RejectAuth => Err(TransportError::AuthFailed),
            Handshake::Accept => {
                let (push, incoming) = mpsc::unbounded_channel();
                let (outgoing, sent) = mpsc::unbounded_channel();
                let _ = self.servers.send(FakeServer {
                    url: url.clone(),
                    push,
                    sent,
                });
                Ok(Box::new(FakeTransport { incoming, outgoing }))
            }
        }
    }
}

struct FakeTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::Closed("server went away".into()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

// ---------------------------------------------------------------------------
// Snapshot source
// ---------------------------------------------------------------------------

/// In-memory dashboard API.
#[derive(Default)]
pub struct FakeSource {
    overview: Mutex<OverviewSnapshot>,
    stores: Mutex<BTreeMap<StoreId, StoreDetail>>,
    failures: Mutex<VecDeque<FetchError>>,
    delay: Mutex<Duration>,
    calls: AtomicU32,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_store(&self, id: &str, products: u64, orders: u64) {
        self.stores.lock().insert(
            StoreId::new(id),
            StoreDetail {
                sync_status: None,
                counts: StoreCounts {
                    products: Some(products),
                    orders: Some(orders),
                },
            },
        );
    }

    pub fn set_counts(&self, counts: DashboardCounts) {
        self.overview.lock().counts = counts;
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = FetchError>) {
        self.failures.lock().extend(errors);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch_overview(&self) -> Result<OverviewSnapshot, FetchError> {
        self.begin().await?;
        let mut overview = self.overview.lock().clone();
        overview.per_store = self.stores.lock().clone();
        Ok(overview)
    }

    async fn fetch_store(&self, store: &StoreId) -> Result<StoreSnapshot, FetchError> {
        self.begin().await?;
        let detail = self.stores.lock().get(store).cloned().unwrap_or_default();
        Ok(StoreSnapshot {
            store_id: store.clone(),
            detail,
            server_time: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Timers pushed far out so only what a test drives explicitly happens.
pub fn quiet_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.connection.reconnect.jitter_ratio = 0.0;
    config.connection.heartbeat.interval = Duration::from_secs(3600);
    config.connection.heartbeat.timeout = Duration::from_secs(3600);
    config.fetch.refresh_interval = Duration::from_secs(3600);
    config
}

pub struct Harness {
    pub registry: SubscriptionRegistry,
    pub connector: Arc<FakeConnector>,
    pub servers: mpsc::UnboundedReceiver<FakeServer>,
    pub source: Arc<FakeSource>,
}

impl Harness {
    pub fn new(config: SyncConfig, script: Vec<Handshake>) -> Self {
        init_tracing();
        let (connector, servers) = FakeConnector::new(script);
        let source = FakeSource::new();
        let registry = SubscriptionRegistry::new(
            Endpoint::parse("wss://push.example.test/live").unwrap(),
            connector.clone(),
            source.clone(),
            Credentials::bearer("test-token"),
            config,
        )
        .unwrap();
        Self {
            registry,
            connector,
            servers,
            source,
        }
    }

    pub async fn next_server(&mut self) -> FakeServer {
        tokio::time::timeout(Duration::from_secs(600), self.servers.recv())
            .await
            .expect("no connection accepted")
            .expect("connector dropped")
    }
}

/// Wait (in paused time) until the view satisfies `pred`.
pub async fn wait_for(
    view: &mut watch::Receiver<ViewState>,
    pred: impl FnMut(&ViewState) -> bool,
) -> ViewState {
    tokio::time::timeout(Duration::from_secs(600), view.wait_for(pred))
        .await
        .expect("view never reached the expected state")
        .expect("session dropped")
        .clone()
}

/// A push frame stamped `ts`.
pub fn frame(kind: &str, store: Option<&str>, payload: Value, ts: DateTime<Utc>) -> Value {
    json!({
        "type": kind,
        "storeId": store,
        "payload": payload,
        "ts": format_iso(&ts),
    })
}

/// Wall-clock offset; snapshots are stamped with the local clock. Truncated
/// to the millisecond precision frames carry.
pub fn in_hours(hours: i64) -> DateTime<Utc> {
    let ts = Utc::now() + chrono::Duration::hours(hours);
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap()
}

/// Route `RUST_LOG`-filtered engine logs to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
