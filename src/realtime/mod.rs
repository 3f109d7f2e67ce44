//! Real-time dashboard synchronization
//!
//! Push-channel connections with reconnect/backoff/heartbeat, frame routing,
//! freshness-ordered reconciliation against pulled snapshots, and the
//! per-viewer subscription registry tying them together.

pub mod backoff;
pub mod connection;
pub mod credentials;
pub mod heartbeat;
pub mod message;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod subscription;
pub mod transport;
pub mod view;

// Re-export main types for convenience
pub use backoff::ReconnectPolicy;
pub use connection::{
    ConnectionConfig, ConnectionErrorKind, ConnectionEvent, ConnectionHandle, ConnectionMachine,
    ConnectionManager, ConnectionMonitor, ConnectionState, ConnectionStats, ConnectionStatus,
    DisconnectReason,
};
pub use credentials::Credentials;
pub use heartbeat::{HeartbeatConfig, HeartbeatStats, HeartbeatTracker};
pub use message::{InboundMessage, MessageKind};
pub use reconcile::{apply, apply_snapshot, OutcomeReason, ReconciliationOutcome};
pub use registry::SubscriptionRegistry;
pub use router::{route, MessageRouter, RouterStats};
pub use session::{Session, SessionStats, ViewState};
pub use snapshot::{
    FetchConfig, FetchStats, FetchedSnapshot, HttpSnapshotSource, OverviewSnapshot, Snapshot,
    SnapshotFetcher, SnapshotSource, StoreSnapshot,
};
pub use subscription::{Subscription, SubscriptionId, ViewerId};
pub use transport::{Connector, Endpoint, Transport, WsConnector};
pub use view::{
    scope_admits, DashboardCounts, DashboardView, FreshnessSource, Scope, StoreCounts, StoreDetail,
    StoreId, StoreSummary, SyncStatus,
};
