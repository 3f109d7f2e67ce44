//! Real-time state synchronization for the operator dashboard.
//!
//! Keeps per-viewer dashboard views consistent by merging partial updates
//! from a push channel with authoritative snapshots pulled from the
//! dashboard API. Updates are ordered by freshness, scoped to the viewer's
//! store, and recovered after disconnects without regressing the view.
//!
//! The entry point is [`SubscriptionRegistry`]: one live subscription per
//! viewer, each exposing its reconciled [`ViewState`] on a `watch` channel.

pub mod config;
pub mod errors;
pub mod realtime;
pub mod utils;

pub use config::SyncConfig;
pub use errors::{FetchError, Result, RouterError, SurfacedError, SyncError, TransportError};
pub use realtime::{
    Credentials, DashboardView, Endpoint, HttpSnapshotSource, StoreId, Subscription,
    SubscriptionRegistry, ViewState, ViewerId, WsConnector,
};
