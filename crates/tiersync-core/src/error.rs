use thiserror::Error;

/// Retry classification shared by adapters and the transfer executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry with backoff (timeouts, 5xx, connection resets, checksum mismatch).
    Transient,
    /// Fail the item immediately (not found, quota exceeded, bad request).
    Permanent,
    /// Credentials rejected; fail immediately, never retried.
    AuthFailure,
}

impl ErrorClass {
    /// Returns the label used for metrics and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::AuthFailure => "auth_failure",
        }
    }
}

/// Canonical error type for tiering and sync operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"asset"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"asset"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// A compare-and-set write lost a race; the caller must re-read and retry.
    #[error("concurrency conflict on {entity} `{id}`: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Entity type name.
        entity: &'static str,
        /// Identifier of the contended entity.
        id: String,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Network, rate-limit or timeout failure that may succeed on retry.
    #[error("transient transfer error: {0}")]
    TransientTransfer(String),

    /// Not-found, quota or request failure that will not succeed on retry.
    #[error("permanent transfer error: {0}")]
    PermanentTransfer(String),

    /// Target rejected the configured credentials.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Bidirectional conflict suspended under the manual review policy.
    #[error("conflict on `{key}` needs manual review")]
    ConflictNeedsReview {
        /// Object key in conflict.
        key: String,
    },

    /// No adapter is registered for a storage target type.
    #[error("no adapter registered for target type `{kind}`")]
    AdapterMissing {
        /// Target type label.
        kind: String,
    },

    /// A running task already covers an overlapping source scope.
    #[error("task `{task}` overlaps the scope of running task `{running}`")]
    ScopeBusy {
        /// Task that was refused.
        task: String,
        /// Running task holding the scope.
        running: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Validation error for a policy, target or task definition.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `ValidationError` variant.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Retry class of a transfer-path error.
    ///
    /// Errors outside the transfer taxonomy are treated as permanent so the
    /// executor never spins on a bug.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientTransfer(_) => ErrorClass::Transient,
            Self::AuthFailure(_) => ErrorClass::AuthFailure,
            Self::IoError(err) => classify_io_error(err),
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether the executor should retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this is a lost compare-and-set race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Maps an I/O error kind onto the transfer retry classes.
#[must_use]
pub fn classify_io_error(err: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::BrokenPipe
        | ErrorKind::WouldBlock
        | ErrorKind::UnexpectedEof => ErrorClass::Transient,
        ErrorKind::PermissionDenied => ErrorClass::AuthFailure,
        _ => ErrorClass::Permanent,
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_classes() {
        assert_eq!(
            CoreError::TransientTransfer("503".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CoreError::PermanentTransfer("404".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            CoreError::AuthFailure("403".into()).class(),
            ErrorClass::AuthFailure
        );
        assert!(CoreError::TransientTransfer("timeout".into()).is_retryable());
        assert!(!CoreError::AuthFailure("bad key".into()).is_retryable());
    }

    #[test]
    fn test_io_error_classification() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(CoreError::from(reset).class(), ErrorClass::Transient);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(CoreError::from(denied).class(), ErrorClass::AuthFailure);

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(CoreError::from(missing).class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_conflict_display() {
        let err = CoreError::ConcurrencyConflict {
            entity: "asset",
            id: "a1".into(),
            expected: 3,
            actual: 4,
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected version 3"));
    }
}
