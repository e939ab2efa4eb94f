//! Engine error taxonomy.
//!
//! Task-level failures are both embedded in a [`WatcherResponse`] record and
//! returned to the scheduler, so `WatchError` is `Clone`: the same value can
//! travel down both paths without reconstructing messages.
//!
//! [`WatcherResponse`]: crate::response::WatcherResponse

use thiserror::Error;

/// Convenience result alias for engine operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors produced by the watcher engine.
#[derive(Debug, Clone, Error)]
pub enum WatchError {
    /// A watcher failed validation at registration time.
    #[error("invalid watcher: {0}")]
    InvalidWatcher(String),

    /// No watcher with the given ID is registered.
    #[error("watcher not found: {0}")]
    WatcherNotFound(String),

    /// The response stream has already been handed to a consumer.
    #[error("response stream already taken")]
    StreamAlreadyTaken,

    /// An endpoint task is misconfigured (missing URL, empty pinned address,
    /// and similar validate-time faults).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dial, TLS handshake, or request transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The peer closed the connection in an expected way (normal closure,
    /// going away, close already sent).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// An unexpected socket-level write failure.
    #[error("unexpected write error: {0}")]
    Write(String),

    /// Malformed or semantically invalid protocol payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A JSON-RPC reply arrived with a correlation ID the engine never
    /// issued.
    #[error("unknown response ID: {0}")]
    UnknownCorrelationId(String),

    /// The persistent connection was torn down with this request still in
    /// flight; no reply will ever arrive.
    #[error("transport reset while request in flight")]
    TransportReset,

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The response body could not be read, or was already consumed.
    #[error("body error: {0}")]
    Body(String),

    /// An operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A response record could not be delivered because the channel is gone.
    #[error("response channel closed")]
    ChannelClosed,

    /// Several failures aggregated from one compound operation.
    #[error("multiple errors: [{}]", join_all(.0))]
    Multiple(Vec<WatchError>),
}

impl WatchError {
    /// Folds a list of errors into `None` (empty), the single error, or
    /// [`WatchError::Multiple`].
    pub fn from_errors(mut errors: Vec<WatchError>) -> Option<WatchError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(WatchError::Multiple(errors)),
        }
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        WatchError::Serialization(e.to_string())
    }
}

fn join_all(errors: &[WatchError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_errors_folds() {
        assert!(WatchError::from_errors(vec![]).is_none());

        let single = WatchError::from_errors(vec![WatchError::ChannelClosed]).unwrap();
        assert!(matches!(single, WatchError::ChannelClosed));

        let multiple = WatchError::from_errors(vec![
            WatchError::ChannelClosed,
            WatchError::Configuration("no URL".into()),
        ])
        .unwrap();
        let WatchError::Multiple(inner) = &multiple else {
            panic!("expected Multiple");
        };
        assert_eq!(inner.len(), 2);
        assert!(multiple.to_string().contains("no URL"));
    }
}
