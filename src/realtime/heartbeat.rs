use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::utils::now_iso;

/// Configuration for heartbeat monitoring
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat pings while connected
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// How long the oldest unacknowledged ping may stay unanswered
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
        }
    }
}

/// Stats for heartbeat monitoring
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Total pings sent
    pub total_pings: u64,
    /// Total acks received
    pub total_acks: u64,
    /// Connections dropped for missing acks
    pub total_timeouts: u64,
}

/// Liveness of one push-channel connection.
///
/// Tracks the oldest ping still waiting for an ack; any ack clears it, since
/// the server answers in order.
#[derive(Debug)]
pub struct HeartbeatTracker {
    timeout: Duration,
    awaiting_since: Option<Instant>,
}

impl HeartbeatTracker {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            timeout: config.timeout,
            awaiting_since: None,
        }
    }

    /// Record that a ping was sent at `now`
    pub fn ping_sent(&mut self, now: Instant) {
        self.awaiting_since.get_or_insert(now);
    }

    /// Record that an ack was received
    pub fn ack_received(&mut self) {
        self.awaiting_since = None;
    }

    /// When the connection is considered dead if no ack arrives.
    pub fn deadline(&self) -> Option<Instant> {
        self.awaiting_since.map(|since| since + self.timeout)
    }
}

/// Outbound heartbeat frame.
pub fn heartbeat_frame() -> String {
    json!({ "type": "heartbeat", "ts": now_iso() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_follows_oldest_unacked_ping() {
        let config = HeartbeatConfig::default();
        let mut tracker = HeartbeatTracker::new(&config);
        let t0 = Instant::now();

        assert_eq!(tracker.deadline(), None);
        tracker.ping_sent(t0);
        tracker.ping_sent(t0 + Duration::from_secs(15));
        assert_eq!(tracker.deadline(), Some(t0 + Duration::from_secs(45)));
    }

    #[test]
    fn ack_clears_the_deadline() {
        let mut tracker = HeartbeatTracker::new(&HeartbeatConfig::default());
        let t0 = Instant::now();
        tracker.ping_sent(t0);
        tracker.ack_received();
        assert_eq!(tracker.deadline(), None);

        tracker.ping_sent(t0 + Duration::from_secs(30));
        assert_eq!(tracker.deadline(), Some(t0 + Duration::from_secs(75)));
    }

    #[test]
    fn frame_is_a_heartbeat_envelope() {
        let frame: serde_json::Value = serde_json::from_str(&heartbeat_frame()).unwrap();
        assert_eq!(frame["type"], "heartbeat");
        assert!(crate::utils::parse_iso(frame["ts"].as_str().unwrap()).is_some());
    }
}
