use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a connected commerce store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Store restriction of a subscription or a message. `None` means all
/// stores; for messages it marks a broadcast.
pub type Scope = Option<StoreId>;

/// Whether a message carrying `message_scope` may reach a subscription
/// bound to `subscription_scope`.
pub fn scope_admits(subscription_scope: &Scope, message_scope: &Scope) -> bool {
    match (subscription_scope, message_scope) {
        (None, _) | (_, None) => true,
        (Some(ours), Some(theirs)) => ours == theirs,
    }
}

/// Human-readable label for log fields.
pub fn scope_label(scope: &Scope) -> &str {
    scope.as_ref().map(StoreId::as_str).unwrap_or("*")
}

/// Catalog sync state of a store. Values this crate does not know are kept
/// verbatim so the dashboard can still show them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
    Unknown(String),
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Unknown(raw) => raw,
        }
    }
}

impl From<String> for SyncStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "idle" => SyncStatus::Idle,
            "syncing" => SyncStatus::Syncing,
            "synced" => SyncStatus::Synced,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Unknown(raw),
        }
    }
}

impl From<SyncStatus> for String {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters across every store the viewer can see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardCounts {
    pub stores: u64,
    pub connected_stores: u64,
    pub products: u64,
    pub orders: u64,
}

/// Per-store counters. `None` means no update has carried the value yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCounts {
    pub products: Option<u64>,
    pub orders: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreDetail {
    pub sync_status: Option<SyncStatus>,
    pub counts: StoreCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSummary {
    pub id: StoreId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default = "unknown_status")]
    pub sync_status: SyncStatus,
}

fn unknown_status() -> SyncStatus {
    SyncStatus::Unknown(String::new())
}

/// Which kind of update last moved `freshness`. Needed for the tie-break
/// where a snapshot at the same instant as a patch still wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessSource {
    Patch,
    #[default]
    Snapshot,
}

/// Reconciled dashboard state of one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    /// Timestamp of the most recent applied update; `None` until the first.
    pub freshness: Option<DateTime<Utc>>,
    pub freshness_source: FreshnessSource,
    pub counts: DashboardCounts,
    pub stores: Vec<StoreSummary>,
    pub per_store: BTreeMap<StoreId, StoreDetail>,
}

impl DashboardView {
    /// Whether an update stamped `ts` is strictly newer than this view.
    pub fn is_older_than(&self, ts: &DateTime<Utc>) -> bool {
        self.freshness.map_or(true, |current| *ts > current)
    }

    pub fn store(&self, id: &StoreId) -> Option<&StoreDetail> {
        self.per_store.get(id)
    }

    pub fn summary_mut(&mut self, id: &StoreId) -> Option<&mut StoreSummary> {
        self.stores.iter_mut().find(|s| &s.id == id)
    }
}
