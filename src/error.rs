//! Gateway error taxonomy with MCP protocol conversion.

use rmcp::model::ErrorCode;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

/// Stable error kind carried by terminal error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnknownBackend,
    DuplicateBackend,
    AcquireTimeout,
    PoolClosed,
    BackendSaturated,
    AdmissionTimeout,
    Adapter,
    Cancelled,
    ProtocolViolation,
    AccessDenied,
    Config,
}

impl ErrorKind {
    /// MCP error code and application code used when surfacing this kind.
    fn mcp_code(self) -> (ErrorCode, &'static str) {
        match self {
            ErrorKind::UnknownBackend => (ErrorCode::RESOURCE_NOT_FOUND, "UNKNOWN_BACKEND"),
            ErrorKind::DuplicateBackend => (ErrorCode::INVALID_REQUEST, "DUPLICATE_BACKEND"),
            ErrorKind::AcquireTimeout => (ErrorCode::INTERNAL_ERROR, "ACQUIRE_TIMEOUT"),
            ErrorKind::PoolClosed => (ErrorCode::INTERNAL_ERROR, "POOL_CLOSED"),
            ErrorKind::BackendSaturated => (ErrorCode::INTERNAL_ERROR, "BACKEND_SATURATED"),
            ErrorKind::AdmissionTimeout => (ErrorCode::INTERNAL_ERROR, "ADMISSION_TIMEOUT"),
            ErrorKind::Adapter => (ErrorCode::INTERNAL_ERROR, "ADAPTER_ERROR"),
            ErrorKind::Cancelled => (ErrorCode::INTERNAL_ERROR, "CANCELLED"),
            ErrorKind::ProtocolViolation => (ErrorCode::INVALID_PARAMS, "PROTOCOL_VIOLATION"),
            ErrorKind::AccessDenied => (ErrorCode::INVALID_REQUEST, "ACCESS_DENIED"),
            ErrorKind::Config => (ErrorCode::INTERNAL_ERROR, "CONFIG_ERROR"),
        }
    }
}

/// Why an invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller withdrew the invocation.
    Withdrawn,
    /// The invocation deadline elapsed.
    DeadlineExceeded,
    /// The consumer of the frame stream went away.
    ConsumerGone,
    /// The gateway is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CancelReason::Withdrawn => "withdrawn by caller",
            CancelReason::DeadlineExceeded => "deadline exceeded",
            CancelReason::ConsumerGone => "consumer went away",
            CancelReason::Shutdown => "gateway shutting down",
        };
        f.write_str(text)
    }
}

/// Driver-level failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// Opening the connection failed.
    Connect,
    /// Network or protocol fault on an established connection.
    Io,
    /// The statement or its parameters were rejected before execution.
    Statement,
    /// The backend reported an error while executing.
    Backend,
    /// A result value could not be decoded.
    Decode,
}

/// Error raised by a backend adapter.
///
/// `connection_usable` tells the router whether the connection that produced
/// the error may go back to the idle set.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{backend_id}: {cause}")]
pub struct AdapterError {
    pub backend_id: String,
    pub kind: AdapterErrorKind,
    pub connection_usable: bool,
    pub cause: String,
}

impl AdapterError {
    pub fn new(
        backend_id: impl Into<String>,
        kind: AdapterErrorKind,
        connection_usable: bool,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind,
            connection_usable,
            cause: cause.into(),
        }
    }

    /// Connection could not be established.
    pub fn connect(backend_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(backend_id, AdapterErrorKind::Connect, false, cause)
    }

    /// Connection-level fault; the connection must be discarded.
    pub fn io(backend_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(backend_id, AdapterErrorKind::Io, false, cause)
    }

    /// Statement or parameters rejected client-side; the connection is fine.
    pub fn statement(backend_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(backend_id, AdapterErrorKind::Statement, true, cause)
    }

    /// Error reported by the backend during execution.
    pub fn backend(
        backend_id: impl Into<String>,
        connection_usable: bool,
        cause: impl Into<String>,
    ) -> Self {
        Self::new(backend_id, AdapterErrorKind::Backend, connection_usable, cause)
    }

    /// A value in the result could not be decoded.
    pub fn decode(backend_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(backend_id, AdapterErrorKind::Decode, true, cause)
    }
}

/// Gateway-level errors, one variant per kind surfaced to the session layer.
#[derive(Error, Debug)]
pub enum GatewayError {
    // Registry
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    // Pool
    #[error("Timed out after {waited_ms}ms acquiring a connection for {backend_id}")]
    AcquireTimeout { backend_id: String, waited_ms: u64 },

    #[error("Connection pool for {0} is closed")]
    PoolClosed(String),

    // Admission
    #[error("Backend {backend_id} is saturated ({max_concurrency} invocations in flight)")]
    BackendSaturated {
        backend_id: String,
        max_concurrency: usize,
    },

    #[error("Timed out after {waited_ms}ms waiting for admission to {backend_id}")]
    AdmissionTimeout { backend_id: String, waited_ms: u64 },

    // Execution
    #[error("Adapter error on {0}")]
    Adapter(#[from] AdapterError),

    #[error("Invocation cancelled: {0}")]
    Cancelled(CancelReason),

    // Request
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Access denied on {backend_id}: {reason}")]
    AccessDenied { backend_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            GatewayError::DuplicateBackend(_) => ErrorKind::DuplicateBackend,
            GatewayError::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            GatewayError::PoolClosed(_) => ErrorKind::PoolClosed,
            GatewayError::BackendSaturated { .. } => ErrorKind::BackendSaturated,
            GatewayError::AdmissionTimeout { .. } => ErrorKind::AdmissionTimeout,
            GatewayError::Adapter(_) => ErrorKind::Adapter,
            GatewayError::Cancelled(_) => ErrorKind::Cancelled,
            GatewayError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            GatewayError::AccessDenied { .. } => ErrorKind::AccessDenied,
            GatewayError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the connection involved survived, when the error concerns one.
    pub fn connection_usable(&self) -> Option<bool> {
        match self {
            GatewayError::Adapter(e) => Some(e.connection_usable),
            _ => None,
        }
    }

    /// Human-readable cause, without the kind prefix where one exists.
    pub fn cause(&self) -> String {
        match self {
            GatewayError::Adapter(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

/// Builds the MCP error for a kind and message.
pub(crate) fn mcp_error(kind: ErrorKind, message: &str) -> rmcp::model::ErrorData {
    let (code, app_code) = kind.mcp_code();
    rmcp::model::ErrorData::new(code, format!("[{}] {}", app_code, message), None)
}

impl From<GatewayError> for rmcp::model::ErrorData {
    fn from(err: GatewayError) -> Self {
        mcp_error(err.kind(), &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            GatewayError::UnknownBackend("x".into()).kind(),
            ErrorKind::UnknownBackend
        );
        assert_eq!(
            GatewayError::Cancelled(CancelReason::DeadlineExceeded).kind(),
            ErrorKind::Cancelled
        );
        let adapter = AdapterError::io("pg1", "broken pipe");
        assert_eq!(GatewayError::from(adapter).kind(), ErrorKind::Adapter);
    }

    #[test]
    fn test_adapter_error_usability() {
        assert!(!AdapterError::io("pg1", "reset").connection_usable);
        assert!(!AdapterError::connect("pg1", "refused").connection_usable);
        assert!(AdapterError::statement("pg1", "bad param").connection_usable);
        assert!(AdapterError::backend("pg1", true, "syntax error").connection_usable);

        let err = GatewayError::from(AdapterError::io("pg1", "reset"));
        assert_eq!(err.connection_usable(), Some(false));
        assert_eq!(GatewayError::PoolClosed("pg1".into()).connection_usable(), None);
    }

    #[test]
    fn test_mcp_error_prefix() {
        let data: rmcp::model::ErrorData = GatewayError::BackendSaturated {
            backend_id: "pg1".into(),
            max_concurrency: 2,
        }
        .into();
        assert!(data.message.starts_with("[BACKEND_SATURATED]"));
        assert!(data.message.contains("pg1"));
    }

    #[test]
    fn test_adapter_cause_keeps_backend() {
        let err = GatewayError::from(AdapterError::backend("my1", true, "1064: syntax"));
        assert_eq!(err.cause(), "my1: 1064: syntax");
    }
}
