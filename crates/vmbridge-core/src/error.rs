//! Application error types with rich context

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport / Connection Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to connect to VM Service at {uri}: {reason}")]
    ConnectFailed { uri: String, reason: String },

    #[error("Not connected to the VM Service")]
    NotConnected,

    #[error("Already connected to the VM Service")]
    AlreadyConnected,

    #[error("Connection to the VM Service closed")]
    ConnectionClosed,

    #[error("Invalid VM Service endpoint: {message}")]
    InvalidEndpoint { message: String },

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("VM Service error {code}: {message}")]
    RemoteError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("VM Service protocol error: {message}")]
    Protocol { message: String },

    #[error("VM Service error: {0}")]
    VmService(String),

    // ─────────────────────────────────────────────────────────────
    // Supervision Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No debuggable isolate found on the target VM")]
    NoIsolate,

    #[error("Recovery exhausted for target {target}; manual restart required")]
    RecoveryExhausted { target: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn connect_failed(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    pub fn remote(code: i32, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::RemoteError {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a [`Error::VmService`] error with a message.
    pub fn vm_service(msg: impl Into<String>) -> Self {
        Self::VmService(msg.into())
    }

    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            message: message.into(),
        }
    }

    pub fn recovery_exhausted(target: impl Into<String>) -> Self {
        Self::RecoveryExhausted {
            target: target.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Errors that no amount of reconnecting will fix.
    ///
    /// `RemoteError` and `Timeout` are not fatal but are never retried
    /// either; they belong to the single call that produced them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NoIsolate | Error::RecoveryExhausted { .. } | Error::InvalidEndpoint { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::connect_failed("ws://127.0.0.1:8181/ws", "connection refused");
        assert_eq!(
            err.to_string(),
            "Failed to connect to VM Service at ws://127.0.0.1:8181/ws: connection refused"
        );

        let err = Error::timeout("getVM", Duration::from_millis(50));
        assert!(err.to_string().contains("getVM"));
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_remote_error_contains_code_and_message() {
        let err = Error::remote(-32601, "Method not found", None);
        let msg = err.to_string();
        assert!(msg.contains("-32601"));
        assert!(msg.contains("Method not found"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::NoIsolate.is_fatal());
        assert!(Error::recovery_exhausted("app-1").is_fatal());
        assert!(!Error::NotConnected.is_fatal());
        assert!(!Error::timeout("getVM", Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_call_errors_are_not_fatal() {
        assert!(!Error::remote(100, "feature disabled", None).is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(!Error::connect_failed("ws://x", "refused").is_fatal());
        assert!(Error::invalid_endpoint("https is not supported").is_fatal());
    }

    #[test]
    fn test_context_keeps_original_error() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.context("Writing config").unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        let result: Result<()> = Err(Error::NotConnected);
        let err = result
            .with_context(|| format!("Calling {}", "getVM"))
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
