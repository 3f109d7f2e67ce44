use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::credentials::Credentials;
use super::view::{scope_label, DashboardCounts, Scope, StoreDetail, StoreId, StoreSummary};
use crate::config::duration_ms;
use crate::errors::FetchError;
use crate::utils::wall_clock_now;

/// Aggregate dashboard state as served by the overview endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverviewSnapshot {
    pub counts: DashboardCounts,
    pub stores: Vec<StoreSummary>,
    pub per_store: BTreeMap<StoreId, StoreDetail>,
    pub server_time: Option<DateTime<Utc>>,
}

/// One store's detail as served by the per-store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub store_id: StoreId,
    #[serde(flatten)]
    pub detail: StoreDetail,
    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,
}

/// Authoritative state for a subscription scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Overview(OverviewSnapshot),
    Store(StoreSnapshot),
}

impl Snapshot {
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Snapshot::Overview(s) => s.server_time,
            Snapshot::Store(s) => s.server_time,
        }
    }
}

/// A snapshot plus the instant it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSnapshot {
    pub snapshot: Snapshot,
    /// Local wall-clock time at receipt; the server's time only when the
    /// local clock could not be read.
    pub completed_at: DateTime<Utc>,
}

/// The pull side of the dashboard API.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_overview(&self) -> Result<OverviewSnapshot, FetchError>;

    async fn fetch_store(&self, store: &StoreId) -> Result<StoreSnapshot, FetchError>;
}

/// [`SnapshotSource`] over the dashboard REST API.
///
/// `GET {base}/dashboard/overview` and `GET {base}/dashboard/stores/{id}`,
/// authenticated with the bearer token handed in by the host.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base: Url,
    credentials: Credentials,
}

impl HttpSnapshotSource {
    pub fn new(base: Url, credentials: Credentials) -> Self {
        Self::with_client(reqwest::Client::new(), base, credentials)
    }

    pub fn with_client(client: reqwest::Client, base: Url, credentials: Credentials) -> Self {
        Self {
            client,
            base,
            credentials,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Http(format!("base url `{}` cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credentials.token())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized),
            status if !status.is_success() => Err(FetchError::Status(status.as_u16())),
            _ => response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Decode(e.to_string())),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_overview(&self) -> Result<OverviewSnapshot, FetchError> {
        let url = self.url(&["dashboard", "overview"])?;
        self.get_json(url).await
    }

    async fn fetch_store(&self, store: &StoreId) -> Result<StoreSnapshot, FetchError> {
        let url = self.url(&["dashboard", "stores", store.as_str()])?;
        self.get_json(url).await
    }
}

/// Configuration for snapshot pulls
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Periodic refresh interval per subscription
    #[serde(with = "duration_ms", rename = "refresh_interval_ms")]
    pub refresh_interval: Duration,
    /// Attempts per fetch before the view is marked stale
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * retry_step`
    #[serde(with = "duration_ms", rename = "retry_step_ms")]
    pub retry_step: Duration,
    /// Upper bound on a single attempt
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            max_attempts: 3,
            retry_step: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Stats for snapshot pulls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Fetches that returned a snapshot
    pub succeeded: u64,
    /// Fetches that gave up
    pub failed: u64,
    /// Individual attempts that were retried
    pub retries: u64,
}

/// Pulls authoritative state with bounded, linearly backed-off retries.
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
    config: FetchConfig,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl SnapshotFetcher {
    pub fn new(source: Arc<dyn SnapshotSource>, config: FetchConfig) -> Self {
        Self {
            source,
            config,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch the snapshot for `scope`: the overview when unscoped, the
    /// store detail otherwise.
    pub async fn fetch(&self, scope: &Scope) -> Result<FetchedSnapshot, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.timeout, self.fetch_once(scope)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

            let err = match result {
                Ok(snapshot) => {
                    let completed_at = wall_clock_now()
                        .or_else(|| snapshot.server_time())
                        .ok_or_else(|| {
                            FetchError::Decode("no local clock and no server timestamp".into())
                        })?;
                    self.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(scope = scope_label(scope), attempt, "snapshot fetched");
                    return Ok(FetchedSnapshot {
                        snapshot,
                        completed_at,
                    });
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            if attempt >= max_attempts {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.config.retry_step * attempt;
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                scope = scope_label(scope),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "snapshot fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn fetch_once(&self, scope: &Scope) -> Result<Snapshot, FetchError> {
        match scope {
            None => self.source.fetch_overview().await.map(Snapshot::Overview),
            Some(store) => self.source.fetch_store(store).await.map(Snapshot::Store),
        }
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
