use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::view::Scope;

/// Recognised push-channel message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SnapshotInvalidate,
    EntityPatch,
    Notification,
    HeartbeatAck,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot_invalidate" => Some(Self::SnapshotInvalidate),
            "entity_patch" => Some(Self::EntityPatch),
            "notification" => Some(Self::Notification),
            "heartbeat_ack" => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SnapshotInvalidate => "snapshot_invalidate",
            Self::EntityPatch => "entity_patch",
            Self::Notification => "notification",
            Self::HeartbeatAck => "heartbeat_ack",
        }
    }

    /// Types that are only forwarded to observers.
    pub fn is_observational(&self) -> bool {
        matches!(self, Self::Notification | Self::HeartbeatAck)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated push-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub scope: Scope,
    pub payload: Value,
    pub server_time: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(kind: MessageKind, scope: Scope, payload: Value, server_time: DateTime<Utc>) -> Self {
        Self {
            kind,
            scope,
            payload,
            server_time,
        }
    }
}
