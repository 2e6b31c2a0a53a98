//! Error taxonomy with transient/permanent classification.
//!
//! Locally recoverable kinds (parse failures, validation findings) never
//! surface beyond the component that produced them; everything else reaches
//! the sync loop, which logs and counts them and keeps running. Fatal kinds
//! terminate through the drain path.

use thiserror::Error;

/// Error produced anywhere in the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Startup configuration is invalid. Fatal, exit code 1.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The source rejected our credentials; refresh once, retry once.
    #[error("authentication expired: {message}")]
    AuthExpired { message: String },

    /// Temporary condition (network fault, 5xx, rate limiting). Retried
    /// with backoff up to the configured bound.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The source returned a non-retryable API error.
    #[error("source api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// A wire record could not be parsed. Skipped with a warning; the
    /// surrounding page still succeeds.
    #[error("malformed record: {message}")]
    Parse { message: String },

    /// A sink operation was invoked in the wrong mode. Indicates a pipeline
    /// bug; fatal, exit code 2.
    #[error("sink mode mismatch: {operation} is not allowed in {mode} mode")]
    SinkModeMismatch {
        operation: &'static str,
        mode: &'static str,
    },

    /// Persisting the continuation token failed. The loop retries the same
    /// position next tick; the cursor never advances past it.
    #[error("cursor save failed: {message}")]
    CursorSaveFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Shutdown requested; unwinds to the draining path.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Sink storage failure.
    #[error("storage error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload (de)serialization failure.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Anything that does not fit the categories above.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Whether the operation should be retried with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient { .. } => true,
            SyncError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this kind must terminate the service.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config { .. } | SyncError::SinkModeMismatch { .. }
        )
    }

    /// Stable code for metric labels and span attributes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Config { .. } => "CONFIG_INVALID",
            SyncError::AuthExpired { .. } => "AUTH_EXPIRED",
            SyncError::Transient { .. } => "TRANSIENT",
            SyncError::Api { .. } => "API_ERROR",
            SyncError::Parse { .. } => "PARSE_ERROR",
            SyncError::SinkModeMismatch { .. } => "SINK_MODE_MISMATCH",
            SyncError::CursorSaveFailed { .. } => "CURSOR_SAVE_FAILED",
            SyncError::Cancelled => "CANCELLED",
            SyncError::Database { .. } => "STORAGE_ERROR",
            SyncError::Serialization { .. } => "SERIALIZATION_ERROR",
            SyncError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors, mirrored across the workspace.

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        SyncError::AuthExpired {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        SyncError::Parse {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Database {
            message: message.into(),
            source: None,
        }
    }

    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn cursor_save_failed(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::CursorSaveFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        SyncError::Serialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SyncError::Internal {
            message: message.into(),
        }
    }
}

/// Result alias used throughout the workspace.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::transient("connection reset").is_transient());
        assert!(SyncError::Api {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(SyncError::Api {
            status: 429,
            message: "slow down".to_string()
        }
        .is_transient());

        assert!(!SyncError::Api {
            status: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!SyncError::auth_expired("401").is_transient());
        assert!(!SyncError::Cancelled.is_transient());
        assert!(!SyncError::config("missing endpoint").is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::config("bad").is_fatal());
        assert!(SyncError::SinkModeMismatch {
            operation: "write_log",
            mode: "state",
        }
        .is_fatal());
        assert!(!SyncError::transient("net").is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::Cancelled.code(), "CANCELLED");
        assert_eq!(SyncError::parse("x").code(), "PARSE_ERROR");
        assert_eq!(
            SyncError::cursor_save_failed("x", std::io::Error::other("io")).code(),
            "CURSOR_SAVE_FAILED"
        );
    }

    #[test]
    fn display_includes_context() {
        let err = SyncError::SinkModeMismatch {
            operation: "apply_state",
            mode: "log",
        };
        assert_eq!(
            err.to_string(),
            "sink mode mismatch: apply_state is not allowed in log mode"
        );
    }
}
