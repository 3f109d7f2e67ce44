//! Freshness-ordered merging of push patches and pulled snapshots.
//!
//! Every entry point is a pure function of the current view and one update.
//! The caller owns the view and replaces it only when the outcome says the
//! update was applied.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::message::{InboundMessage, MessageKind};
use super::snapshot::Snapshot;
use super::view::{DashboardView, FreshnessSource, Scope, StoreId, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeReason {
    AppliedPatch,
    AppliedSnapshot,
    RejectedStale,
    RejectedIncompletePayload,
    /// `snapshot_invalidate`: nothing merged, a refetch is due.
    RefetchRequested,
    /// `notification` / `heartbeat_ack`: forwarded to observers only.
    Observed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationOutcome {
    pub applied: bool,
    pub reason: OutcomeReason,
    /// The view cannot be brought up to date from pushes alone; the owner
    /// should pull a snapshot for its subscription.
    pub refetch: bool,
}

impl ReconciliationOutcome {
    fn applied(reason: OutcomeReason) -> Self {
        Self {
            applied: true,
            reason,
            refetch: false,
        }
    }

    fn untouched(reason: OutcomeReason) -> Self {
        Self {
            applied: false,
            reason,
            refetch: false,
        }
    }

    fn refetch(reason: OutcomeReason) -> Self {
        Self {
            applied: false,
            reason,
            refetch: true,
        }
    }
}

/// Apply one routed push message.
pub fn apply(view: &DashboardView, message: &InboundMessage) -> (DashboardView, ReconciliationOutcome) {
    if !view.is_older_than(&message.server_time) {
        return (view.clone(), ReconciliationOutcome::untouched(OutcomeReason::RejectedStale));
    }

    match message.kind {
        MessageKind::EntityPatch => apply_patch(view, message),
        MessageKind::SnapshotInvalidate => (
            view.clone(),
            ReconciliationOutcome::refetch(OutcomeReason::RefetchRequested),
        ),
        MessageKind::Notification | MessageKind::HeartbeatAck => {
            (view.clone(), ReconciliationOutcome::untouched(OutcomeReason::Observed))
        }
    }
}

/// Replace the view's data with a complete snapshot received at
/// `fetch_completed_at`.
///
/// Accepted when strictly newer, or when equal to a freshness that a patch
/// set: at the same instant the snapshot is the more complete record.
///
/// A store snapshot is the whole record of a store-scoped view. Aggregate
/// counts, summaries and other stores' entries that earlier broadcast
/// patches left behind are cleared, so no patch at or before
/// `fetch_completed_at` survives it.
pub fn apply_snapshot(
    view: &DashboardView,
    snapshot: &Snapshot,
    fetch_completed_at: DateTime<Utc>,
) -> (DashboardView, ReconciliationOutcome) {
    let accepted = match view.freshness {
        None => true,
        Some(current) => {
            fetch_completed_at > current
                || (fetch_completed_at == current && view.freshness_source == FreshnessSource::Patch)
        }
    };
    if !accepted {
        return (view.clone(), ReconciliationOutcome::untouched(OutcomeReason::RejectedStale));
    }

    let mut next = match snapshot {
        Snapshot::Overview(overview) => DashboardView {
            counts: overview.counts.clone(),
            stores: overview.stores.clone(),
            per_store: overview.per_store.clone(),
            ..DashboardView::default()
        },
        Snapshot::Store(store) => DashboardView {
            per_store: BTreeMap::from([(store.store_id.clone(), store.detail.clone())]),
            ..DashboardView::default()
        },
    };
    next.freshness = Some(fetch_completed_at);
    next.freshness_source = FreshnessSource::Snapshot;

    (next, ReconciliationOutcome::applied(OutcomeReason::AppliedSnapshot))
}

fn apply_patch(view: &DashboardView, message: &InboundMessage) -> (DashboardView, ReconciliationOutcome) {
    let Some(patch) = Patch::decode(&message.scope, &message.payload) else {
        return (
            view.clone(),
            ReconciliationOutcome::refetch(OutcomeReason::RejectedIncompletePayload),
        );
    };

    let mut next = view.clone();
    match &message.scope {
        Some(store) => patch.merge_into_store(&mut next, store),
        None => patch.merge_into_aggregate(&mut next),
    }
    next.freshness = Some(message.server_time);
    next.freshness_source = FreshnessSource::Patch;

    (next, ReconciliationOutcome::applied(OutcomeReason::AppliedPatch))
}

const STORE_FIELDS: &[&str] = &["products", "orders", "syncStatus"];
const AGGREGATE_FIELDS: &[&str] = &["stores", "connectedStores", "products", "orders"];

/// The fields a patch claims to update, each with a usable value.
#[derive(Debug, Default, PartialEq, Eq)]
struct Patch {
    stores: Option<u64>,
    connected_stores: Option<u64>,
    products: Option<u64>,
    orders: Option<u64>,
    sync_status: Option<SyncStatus>,
}

impl Patch {
    /// `None` when the payload cannot be merged without guessing: nothing
    /// claimed, an unrecognised claimed field, or a claimed field without a
    /// valid value.
    fn decode(scope: &Scope, payload: &Value) -> Option<Self> {
        let fields = payload.as_object()?;
        let recognised = if scope.is_some() { STORE_FIELDS } else { AGGREGATE_FIELDS };

        let claimed: Vec<&str> = match fields.get("changed") {
            Some(Value::Array(names)) => names.iter().map(Value::as_str).collect::<Option<_>>()?,
            Some(_) => return None,
            None => recognised
                .iter()
                .copied()
                .filter(|name| fields.contains_key(*name))
                .collect(),
        };
        if claimed.is_empty() {
            return None;
        }

        let mut patch = Patch::default();
        for name in claimed {
            if !recognised.contains(&name) {
                return None;
            }
            match name {
                "stores" => patch.stores = Some(count(fields, name)?),
                "connectedStores" => patch.connected_stores = Some(count(fields, name)?),
                "products" => patch.products = Some(count(fields, name)?),
                "orders" => patch.orders = Some(count(fields, name)?),
                "syncStatus" => {
                    let raw = fields.get(name)?.as_str()?;
                    patch.sync_status = Some(SyncStatus::from(raw.to_string()));
                }
                _ => return None,
            }
        }
        Some(patch)
    }

    fn merge_into_store(self, view: &mut DashboardView, store: &StoreId) {
        if let (Some(status), Some(summary)) = (&self.sync_status, view.summary_mut(store)) {
            summary.sync_status = status.clone();
        }
        let detail = view.per_store.entry(store.clone()).or_default();
        if let Some(products) = self.products {
            detail.counts.products = Some(products);
        }
        if let Some(orders) = self.orders {
            detail.counts.orders = Some(orders);
        }
        if let Some(status) = self.sync_status {
            detail.sync_status = Some(status);
        }
    }

    fn merge_into_aggregate(self, view: &mut DashboardView) {
        let counts = &mut view.counts;
        if let Some(stores) = self.stores {
            counts.stores = stores;
        }
        if let Some(connected) = self.connected_stores {
            counts.connected_stores = connected;
        }
        if let Some(products) = self.products {
            counts.products = products;
        }
        if let Some(orders) = self.orders {
            counts.orders = orders;
        }
    }
}

fn count(fields: &Map<String, Value>, name: &str) -> Option<u64> {
    fields.get(name)?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::snapshot::{OverviewSnapshot, StoreSnapshot};
    use crate::realtime::view::{DashboardCounts, StoreDetail, StoreSummary};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).unwrap()
    }

    fn s1() -> StoreId {
        StoreId::new("S1")
    }

    fn patch(scope: Option<&str>, payload: Value, ts: DateTime<Utc>) -> InboundMessage {
        InboundMessage::new(MessageKind::EntityPatch, scope.map(StoreId::new), payload, ts)
    }

    fn store_snapshot(orders: u64) -> Snapshot {
        Snapshot::Store(StoreSnapshot {
            store_id: s1(),
            detail: StoreDetail {
                sync_status: Some(SyncStatus::Synced),
                counts: crate::realtime::view::StoreCounts {
                    products: Some(40),
                    orders: Some(orders),
                },
            },
            server_time: None,
        })
    }

    #[test]
    fn store_patch_merges_only_claimed_fields() {
        let (view, outcome) = apply(&DashboardView::default(), &patch(Some("S1"), json!({"orders": 12}), at(1)));

        assert_eq!(outcome, ReconciliationOutcome::applied(OutcomeReason::AppliedPatch));
        let detail = view.store(&s1()).unwrap();
        assert_eq!(detail.counts.orders, Some(12));
        assert_eq!(detail.counts.products, None);
        assert_eq!(detail.sync_status, None);
        assert_eq!(view.freshness, Some(at(1)));
        assert_eq!(view.freshness_source, FreshnessSource::Patch);
    }

    #[test]
    fn stale_messages_leave_the_view_identical() {
        let (view, _) = apply(&DashboardView::default(), &patch(Some("S1"), json!({"orders": 12}), at(5)));

        for ts in [at(5), at(4)] {
            let (after, outcome) = apply(&view, &patch(Some("S1"), json!({"orders": 99}), ts));
            assert_eq!(outcome.reason, OutcomeReason::RejectedStale);
            assert!(!outcome.applied);
            assert_eq!(after, view);
        }
    }

    #[test]
    fn incomplete_patches_never_guess() {
        let base = DashboardView::default();
        let cases = [
            json!({"entity": "order", "op": "created"}),
            json!({"orders": null}),
            json!({"orders": "twelve"}),
            json!({"orders": -1}),
            json!({"changed": ["orders"], "products": 3}),
            json!({"changed": ["refunds"], "refunds": 1}),
            json!({"changed": "orders", "orders": 1}),
            json!("orders=12"),
        ];
        for payload in cases {
            let (after, outcome) = apply(&base, &patch(Some("S1"), payload.clone(), at(1)));
            assert_eq!(
                outcome,
                ReconciliationOutcome::refetch(OutcomeReason::RejectedIncompletePayload),
                "payload {payload}"
            );
            assert_eq!(after, base);
        }
    }

    #[test]
    fn changed_list_limits_the_merge() {
        let (view, outcome) = apply(
            &DashboardView::default(),
            &patch(Some("S1"), json!({"changed": ["products"], "products": 7, "orders": 3}), at(1)),
        );
        assert!(outcome.applied);
        let detail = view.store(&s1()).unwrap();
        assert_eq!(detail.counts.products, Some(7));
        assert_eq!(detail.counts.orders, None);
    }

    #[test]
    fn aggregate_patch_updates_counts() {
        let (view, outcome) = apply(
            &DashboardView::default(),
            &patch(None, json!({"connectedStores": 3, "orders": 120}), at(1)),
        );
        assert!(outcome.applied);
        assert_eq!(
            view.counts,
            DashboardCounts {
                stores: 0,
                connected_stores: 3,
                products: 0,
                orders: 120,
            }
        );
        assert!(view.per_store.is_empty());
    }

    #[test]
    fn sync_status_patch_updates_summary_too() {
        let mut base = DashboardView::default();
        base.stores.push(StoreSummary {
            id: s1(),
            name: "Main".into(),
            platform: "shopify".into(),
            connected: true,
            sync_status: SyncStatus::Idle,
        });
        let (view, _) = apply(&base, &patch(Some("S1"), json!({"syncStatus": "syncing"}), at(1)));
        assert_eq!(view.stores[0].sync_status, SyncStatus::Syncing);
        assert_eq!(view.store(&s1()).unwrap().sync_status, Some(SyncStatus::Syncing));
    }

    #[test]
    fn invalidate_requests_refetch_without_touching_the_view() {
        let msg = InboundMessage::new(MessageKind::SnapshotInvalidate, Some(s1()), json!({"orders": 1}), at(1));
        let (view, outcome) = apply(&DashboardView::default(), &msg);
        assert_eq!(outcome, ReconciliationOutcome::refetch(OutcomeReason::RefetchRequested));
        assert_eq!(view, DashboardView::default());
    }

    #[test]
    fn observational_messages_never_mutate() {
        for kind in [MessageKind::Notification, MessageKind::HeartbeatAck] {
            let msg = InboundMessage::new(kind, None, json!({"orders": 1}), at(1));
            let (view, outcome) = apply(&DashboardView::default(), &msg);
            assert_eq!(outcome.reason, OutcomeReason::Observed);
            assert_eq!(view, DashboardView::default());
        }
    }

    #[test]
    fn snapshot_wins_ties_in_either_order() {
        let empty = DashboardView::default();
        let p = patch(Some("S1"), json!({"orders": 12}), at(10));
        let snap = store_snapshot(15);

        let (after_patch, _) = apply(&empty, &p);
        let (patch_then_snap, outcome) = apply_snapshot(&after_patch, &snap, at(10));
        assert_eq!(outcome.reason, OutcomeReason::AppliedSnapshot);

        let (after_snap, _) = apply_snapshot(&empty, &snap, at(10));
        let (snap_then_patch, outcome) = apply(&after_snap, &p);
        assert_eq!(outcome.reason, OutcomeReason::RejectedStale);

        assert_eq!(patch_then_snap, snap_then_patch);
        assert_eq!(patch_then_snap.store(&s1()).unwrap().counts.orders, Some(15));
    }

    #[test]
    fn store_snapshot_clears_what_broadcast_patches_left() {
        let empty = DashboardView::default();
        let broadcast = patch(None, json!({"orders": 120}), at(10));
        let other_store = patch(Some("S2"), json!({"orders": 7}), at(4));
        let snap = store_snapshot(15);

        let (patched, _) = apply(&empty, &other_store);
        let (patched, _) = apply(&patched, &broadcast);
        assert_eq!(patched.counts.orders, 120);

        let (patch_then_snap, outcome) = apply_snapshot(&patched, &snap, at(10));
        assert_eq!(outcome.reason, OutcomeReason::AppliedSnapshot);
        assert_eq!(patch_then_snap.counts, DashboardCounts::default());
        assert!(patch_then_snap.store(&StoreId::new("S2")).is_none());

        let (after_snap, _) = apply_snapshot(&empty, &snap, at(10));
        let (snap_then_patch, outcome) = apply(&after_snap, &broadcast);
        assert_eq!(outcome.reason, OutcomeReason::RejectedStale);
        assert_eq!(patch_then_snap, snap_then_patch);

        // an older broadcast is gone as well once a later snapshot lands
        let (older, _) = apply(&empty, &patch(None, json!({"orders": 120}), at(3)));
        let (after, _) = apply_snapshot(&older, &snap, at(10));
        assert_eq!(after.counts.orders, 0);
        assert_eq!(after, after_snap);
    }

    #[test]
    fn equal_snapshot_does_not_replace_a_snapshot() {
        let (view, _) = apply_snapshot(&DashboardView::default(), &store_snapshot(15), at(10));
        let (after, outcome) = apply_snapshot(&view, &store_snapshot(99), at(10));
        assert_eq!(outcome.reason, OutcomeReason::RejectedStale);
        assert_eq!(after, view);
    }

    #[test]
    fn overview_snapshot_replaces_everything() {
        let (view, _) = apply(&DashboardView::default(), &patch(Some("S9"), json!({"orders": 1}), at(1)));
        let overview = Snapshot::Overview(OverviewSnapshot {
            counts: DashboardCounts {
                stores: 1,
                connected_stores: 1,
                products: 40,
                orders: 15,
            },
            ..Default::default()
        });
        let (after, outcome) = apply_snapshot(&view, &overview, at(2));
        assert!(outcome.applied);
        assert!(after.per_store.is_empty());
        assert_eq!(after.counts.orders, 15);
        assert_eq!(after.freshness_source, FreshnessSource::Snapshot);
    }

    #[test]
    fn walkthrough_of_a_scoped_viewer() {
        let mut view = DashboardView::default();

        let (next, outcome) = apply(&view, &patch(Some("S1"), json!({"orders": 12}), at(10)));
        assert!(outcome.applied);
        view = next;
        assert_eq!(view.store(&s1()).unwrap().counts.orders, Some(12));
        assert_eq!(view.freshness, Some(at(10)));

        let (next, outcome) = apply_snapshot(&view, &store_snapshot(3), at(5));
        assert_eq!(outcome.reason, OutcomeReason::RejectedStale);
        assert_eq!(next, view);

        let (next, outcome) = apply_snapshot(&view, &store_snapshot(15), at(20));
        assert!(outcome.applied);
        view = next;
        assert_eq!(view.store(&s1()).unwrap().counts.orders, Some(15));
        assert_eq!(view.freshness, Some(at(20)));
    }
}
