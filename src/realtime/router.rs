use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::debug;

use super::message::{InboundMessage, MessageKind};
use super::view::{scope_admits, scope_label, Scope, StoreId};
use crate::errors::RouterError;
use crate::utils::parse_iso;

/// Parse and validate one raw push-channel frame.
///
/// Required: `type` (string, recognised) and `ts` (ISO-8601). `storeId` may
/// be absent, `null` or a string; `payload` defaults to an empty object.
pub fn route(raw: &str) -> Result<InboundMessage, RouterError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| RouterError::Malformed(e.to_string()))?;
    let Value::Object(mut frame) = value else {
        return Err(RouterError::Malformed("frame is not a JSON object".into()));
    };

    let kind = required_str(&frame, "type")?.to_string();
    let ts = required_str(&frame, "ts")?;
    let server_time =
        parse_iso(ts).ok_or_else(|| RouterError::InvalidTimestamp(ts.to_string()))?;

    let scope = match frame.get("storeId") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) if id.is_empty() => None,
        Some(Value::String(id)) => Some(StoreId::new(id.as_str())),
        Some(_) => return Err(RouterError::Malformed("`storeId` must be a string".into())),
    };

    let kind = MessageKind::parse(&kind).ok_or(RouterError::UnknownType(kind))?;

    let payload = match frame.remove("payload") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(payload) => payload,
    };

    Ok(InboundMessage::new(kind, scope, payload, server_time))
}

fn required_str<'a>(frame: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, RouterError> {
    match frame.get(field) {
        None | Some(Value::Null) => Err(RouterError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(RouterError::Malformed(format!("`{}` must be a string", field))),
    }
}

/// Statistics for a router
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames forwarded to the reconciler
    pub routed: u64,
    /// Frames that failed validation
    pub malformed: u64,
    /// Well-formed frames with an unrecognised `type`
    pub unknown_type: u64,
    /// Valid frames addressed to another store
    pub out_of_scope: u64,
}

/// Per-subscription front door for inbound frames.
///
/// Nothing it rejects is surfaced: malformed and unknown frames are counted
/// and dropped, scope mismatches are normal fan-out filtering.
pub struct MessageRouter {
    scope: Scope,
    routed: AtomicU64,
    malformed: AtomicU64,
    unknown_type: AtomicU64,
    out_of_scope: AtomicU64,
}

impl MessageRouter {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            routed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            unknown_type: AtomicU64::new(0),
            out_of_scope: AtomicU64::new(0),
        }
    }

    /// Route a raw frame; `Some` only for valid, in-scope messages.
    pub fn dispatch(&self, raw: &str) -> Option<InboundMessage> {
        let message = match route(raw) {
            Ok(message) => message,
            Err(RouterError::UnknownType(kind)) => {
                self.unknown_type.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, scope = scope_label(&self.scope), "dropping frame of unknown type");
                return None;
            }
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, scope = scope_label(&self.scope), "dropping malformed frame");
                return None;
            }
        };

        if !self.accepts(&message) {
            self.out_of_scope.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.routed.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    pub fn accepts(&self, message: &InboundMessage) -> bool {
        scope_admits(&self.scope, &message.scope)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_type: self.unknown_type.load(Ordering::Relaxed),
            out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
        }
    }
}
