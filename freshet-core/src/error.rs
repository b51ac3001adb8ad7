//! Error types for freshet operations

use thiserror::Error;

/// Local cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open cache store at {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt cache entry for {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    SerializationFailed { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors reported by the Resource Access Facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Resource not found: {key}")]
    NotFound { key: String },

    #[error("Transient failure reading {key}: {reason}")]
    Transient { key: String, reason: String },

    #[error("Write rejected for {key}: {reason}")]
    Rejected { key: String, reason: String },
}

impl AccessError {
    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Connection and transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Session limit reached ({max_sessions})")]
    SessionLimitReached { max_sessions: usize },

    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid resource key {key:?}: {reason}")]
    InvalidResourceKey { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all freshet errors.
#[derive(Debug, Clone, Error)]
pub enum FreshetError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for freshet operations.
pub type FreshetResult<T> = Result<T, FreshetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_error_transient() {
        let err = AccessError::Transient {
            key: "current-user".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.is_transient());
        assert!(!AccessError::NotFound {
            key: "current-user".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_storage_error_display_corrupt_entry() {
        let err = StorageError::CorruptEntry {
            key: "user-42".to_string(),
            reason: "truncated header".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("user-42"));
        assert!(msg.contains("truncated header"));
    }

    #[test]
    fn test_freshet_error_from_transport() {
        let err: FreshetError = TransportError::ConnectFailed {
            endpoint: "ws://127.0.0.1:3000/api/v1/ws".to_string(),
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            FreshetError::Transport(TransportError::ConnectFailed { .. })
        ));
        assert!(format!("{}", err).contains("connection refused"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "reconnect.multiplier".to_string(),
            value: "0.5".to_string(),
            reason: "must be >= 1.0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("reconnect.multiplier"));
        assert!(msg.contains("0.5"));
    }
}
