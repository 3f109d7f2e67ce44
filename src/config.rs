use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};
use crate::realtime::connection::ConnectionConfig;
use crate::realtime::snapshot::FetchConfig;

/// `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Engine-wide tuning, shared by every subscription.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub fetch: FetchConfig,
    /// Capacity of each subscription's notification stream.
    pub observer_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            fetch: FetchConfig::default(),
            observer_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let reconnect = &self.connection.reconnect;
        let heartbeat = &self.connection.heartbeat;

        if reconnect.base_delay.is_zero() {
            return Err(invalid("connection.reconnect.base_delay_ms must be positive"));
        }
        if reconnect.max_delay < reconnect.base_delay {
            return Err(invalid("connection.reconnect.max_delay_ms is below base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(invalid("connection.reconnect.jitter_ratio must be within [0, 1]"));
        }
        if heartbeat.interval.is_zero() || heartbeat.timeout.is_zero() {
            return Err(invalid("connection.heartbeat intervals must be positive"));
        }
        if self.connection.handshake_timeout.is_zero() {
            return Err(invalid("connection.handshake_timeout_ms must be positive"));
        }
        if self.connection.event_buffer == 0 || self.observer_buffer == 0 {
            return Err(invalid("channel buffers must hold at least one message"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(invalid("fetch.max_attempts must be at least 1"));
        }
        if self.fetch.refresh_interval.is_zero() || self.fetch.timeout.is_zero() {
            return Err(invalid("fetch intervals must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SyncError {
    SyncError::Config(msg.to_string())
}
