use thiserror::Error;
use uuid::Uuid;

use crate::types::FeedErrorKind;

/// Errors surfaced by the storage layer.
///
/// `NotFound` and `WrongState` are invariant signals, not transient faults:
/// they tell the caller a race was lost (another worker won the row) or a
/// transition was attempted from the wrong state. Callers must not retry
/// them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A status transition matched zero rows.
    #[error("row {0} not found (or no longer in the expected status)")]
    NotFound(Uuid),

    /// A transition was attempted from a state that does not permit it.
    #[error("row {id} is in state {actual}, expected {expected}")]
    WrongState {
        id: Uuid,
        expected: &'static str,
        actual: String,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Transient faults worth retrying at the next tick. Invariant signals
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::NotFound(_) | StoreError::WrongState { .. } => false,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
        }
    }
}

/// A classified feed poll failure: the kind drives auto-disable thresholds,
/// the message is recorded on the feed state row.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct PollError {
    pub kind: FeedErrorKind,
    pub message: String,
}

impl PollError {
    pub fn new(kind: FeedErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an HTTP status into a poll error kind.
    pub fn from_status(status: u16) -> Self {
        let kind = match status {
            429 => FeedErrorKind::RateLimited,
            403 => FeedErrorKind::Forbidden,
            404 => FeedErrorKind::NotFound,
            410 => FeedErrorKind::Gone,
            500..=599 => FeedErrorKind::Upstream,
            _ => FeedErrorKind::Unexpected,
        };
        Self::new(kind, format!("HTTP status {status}"))
    }
}

/// Errors from the frontier fetch worker.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("response too large ({0} byte limit)")]
    ResponseTooLarge(usize),

    #[error("disallowed by robots.txt")]
    RobotsDisallowed,
}

impl FetchError {
    /// Permanent client errors go straight to `dead`; everything else
    /// retries with backoff.
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::HttpStatus(status) => {
                matches!(status, 400 | 401 | 403 | 404 | 410)
            }
            FetchError::RobotsDisallowed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert_eq!(PollError::from_status(429).kind, FeedErrorKind::RateLimited);
        assert_eq!(PollError::from_status(403).kind, FeedErrorKind::Forbidden);
        assert_eq!(PollError::from_status(404).kind, FeedErrorKind::NotFound);
        assert_eq!(PollError::from_status(410).kind, FeedErrorKind::Gone);
        assert_eq!(PollError::from_status(500).kind, FeedErrorKind::Upstream);
        assert_eq!(PollError::from_status(503).kind, FeedErrorKind::Upstream);
        assert_eq!(PollError::from_status(418).kind, FeedErrorKind::Unexpected);
    }

    #[test]
    fn permanent_fetch_errors() {
        assert!(FetchError::HttpStatus(404).is_permanent());
        assert!(FetchError::HttpStatus(410).is_permanent());
        assert!(FetchError::RobotsDisallowed.is_permanent());
        assert!(!FetchError::HttpStatus(500).is_permanent());
        assert!(!FetchError::HttpStatus(429).is_permanent());
        assert!(!FetchError::Timeout.is_permanent());
    }

    #[test]
    fn invariant_errors_are_not_retryable() {
        assert!(!StoreError::NotFound(Uuid::new_v4()).is_retryable());
        assert!(
            !StoreError::WrongState {
                id: Uuid::new_v4(),
                expected: "dead",
                actual: "pending".to_string(),
            }
            .is_retryable()
        );
    }
}
