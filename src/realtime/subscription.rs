use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::view::Scope;

/// Identity of a dashboard viewer (one browser tab / operator session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(pub String);

impl ViewerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ViewerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Tags everything spawned on behalf of one subscription so that work
/// finishing after teardown can be recognised and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0.simple())
    }
}

/// A viewer bound to an optional store scope.
///
/// The scope is fixed for the subscription's lifetime; changing it means
/// unsubscribing and subscribing again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    viewer_id: ViewerId,
    scope: Scope,
}

impl Subscription {
    pub fn new(viewer_id: ViewerId, scope: Scope) -> Self {
        Self {
            id: SubscriptionId::generate(),
            viewer_id,
            scope,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}
