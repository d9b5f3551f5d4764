//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Rule {rule}: invalid {field} pattern: {message}")]
    InvalidPattern {
        rule: String,
        field: String,
        message: String,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors reported by a messaging client.
///
/// Every variant is either transient (worth retrying) or permanent,
/// see [`ChannelError::is_transient`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Request to {name} failed: {reason}")]
    Transport { name: String, reason: String },

    #[error("Request to {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Permission denied on channel {name}: {reason}")]
    Forbidden { name: String, reason: String },

    #[error("Message not found on channel {name}: {reason}")]
    NotFound { name: String, reason: String },

    #[error("Request rejected by {name}: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

impl ChannelError {
    /// Whether the operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Delivery tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Delivery of {source_key} to {destination} is already recorded")]
    AlreadyRecorded {
        source_key: String,
        destination: i64,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Event-level failures of the relay.
///
/// Per-destination failures are reported in the event report instead;
/// these abort the whole event so it can be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Store failure: {0}")]
    Store(#[from] DatabaseError),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Relay is shut down")]
    Closed,
}

impl From<TrackerError> for RelayError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Database(e) => Self::Store(e),
            other => Self::Store(DatabaseError::Query(other.to_string())),
        }
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let transport = ChannelError::Transport {
            name: "telegram".into(),
            reason: "connection reset".into(),
        };
        let timeout = ChannelError::Timeout {
            name: "telegram".into(),
            timeout: Duration::from_secs(5),
        };
        let limited = ChannelError::RateLimited {
            name: "telegram".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(transport.is_transient());
        assert!(timeout.is_transient());
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        let forbidden = ChannelError::Forbidden {
            name: "telegram".into(),
            reason: "bot was kicked".into(),
        };
        let missing = ChannelError::NotFound {
            name: "telegram".into(),
            reason: "message to delete not found".into(),
        };
        assert!(!forbidden.is_transient());
        assert!(!missing.is_transient());
        assert!(forbidden.retry_after().is_none());
    }

    #[test]
    fn tracker_database_error_maps_to_store() {
        let err: RelayError = TrackerError::Database(DatabaseError::Query("boom".into())).into();
        assert!(matches!(err, RelayError::Store(DatabaseError::Query(_))));
    }
}
