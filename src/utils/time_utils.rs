use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

// ──────────────────────────── timestamps ─────────────────────────────────── //

/// Local wall-clock time, or `None` when the system clock is unusable
/// (set before the Unix epoch).
pub fn wall_clock_now() -> Option<DateTime<Utc>> {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    DateTime::<Utc>::from_timestamp(
        since_epoch.as_secs() as i64,
        since_epoch.subsec_nanos(),
    )
}

/// Current UTC time as an ISO 8601 string (``2026-02-23T14:30:00.000Z``).
pub fn now_iso() -> String {
    format_iso(&Utc::now())
}

// ────────────────────────── formatting / parsing ─────────────────────────── //

/// Format a timestamp as ISO 8601 UTC with millisecond precision.
pub fn format_iso(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse an ISO 8601 / RFC 3339 datetime string, keeping sub-second
/// precision.
///
/// Returns ``None`` on unparseable input.
///
/// Accepts:
/// - ``2026-02-23T14:30:00Z``
/// - ``2026-02-23T14:30:00.123+02:00``
/// - ``2026-02-23T14:30:00``  (assumes UTC)
/// - ``2026-02-23``           (start of day UTC)
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // naive datetime, assumed UTC
    for fmt in &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    let nd = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&nd.and_hms_opt(0, 0, 0)?))
}
