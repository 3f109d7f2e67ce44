use thiserror::Error;

/// Failures of the push-channel transport.
///
/// Everything except [`TransportError::AuthFailed`] is transient and drives a
/// reconnect with backoff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("authentication rejected during handshake")]
    AuthFailed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

impl TransportError {
    /// Whether the failure ends the handle instead of triggering a reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::AuthFailed)
    }
}

/// Reasons a raw frame could not be turned into an [`InboundMessage`].
///
/// These never leave the router; they are counted and dropped.
///
/// [`InboundMessage`]: crate::realtime::message::InboundMessage
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

/// Failures of a single snapshot pull, or of the whole retry sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("snapshot endpoint returned status {0}")]
    Status(u16),
    #[error("snapshot body could not be decoded: {0}")]
    Decode(String),
    #[error("snapshot request timed out")]
    Timeout,
    #[error("snapshot endpoint rejected credentials")]
    Unauthorized,
    #[error("snapshot fetch gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Unauthorized | FetchError::Exhausted { .. })
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// The only conditions shown to the dashboard; everything else is handled
/// internally and at most changes the connectivity indicator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SurfacedError {
    /// Handshake rejected the credentials. A new subscription with fresh
    /// credentials is required.
    #[error("live updates rejected: authentication failed")]
    AuthFailed,
    /// Snapshot refresh exhausted its retries; the view is kept but may be
    /// outdated.
    #[error("dashboard data may be outdated ({attempts} refresh attempts failed: {last_error})")]
    SnapshotStale { attempts: u32, last_error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failure_is_terminal() {
        assert!(TransportError::AuthFailed.is_terminal());
        assert!(!TransportError::Connect("refused".into()).is_terminal());
        assert!(!TransportError::Timeout("heartbeat").is_terminal());
    }

    #[test]
    fn exhausted_fetch_is_not_retried() {
        let err = FetchError::Exhausted {
            attempts: 3,
            last: Box::new(FetchError::Timeout),
        };
        assert!(!err.is_retryable());
        assert!(FetchError::Status(503).is_retryable());
        assert!(!FetchError::Unauthorized.is_retryable());
        assert_eq!(
            err.to_string(),
            "snapshot fetch gave up after 3 attempts: snapshot request timed out"
        );
    }

    #[test]
    fn surfaced_errors_read_as_dashboard_messages() {
        let stale = SurfacedError::SnapshotStale {
            attempts: 3,
            last_error: FetchError::Status(502).to_string(),
        };
        assert_eq!(
            stale.to_string(),
            "dashboard data may be outdated (3 refresh attempts failed: snapshot endpoint returned status 502)"
        );
        assert_eq!(
            SurfacedError::AuthFailed.to_string(),
            "live updates rejected: authentication failed"
        );
    }
}
