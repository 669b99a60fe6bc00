//! Error handling for Cascade Core.
//!
//! This module provides:
//! - Comprehensive error types with context and chaining
//! - HTTP status code mapping for API responses
//! - Error codes for machine-readable API responses
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Cascade operations.
pub type Result<T> = std::result::Result<T, CascadeError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // DAG errors
    CycleDetected,
    DagValidationFailed,
    DagNotFound,
    NodeNotFound,
    DuplicateNode,
    EmptyGraph,
    UnknownTaskKind,

    // Run errors
    RunNotFound,
    InvalidStateTransition,

    // Executor errors
    ExecutorFailure,
    ExecutorTimeout,
    SsrfBlocked,
    ConfigMissing,

    // Queue errors
    QueueError,
    QueueConnectionFailed,
    InvalidMessage,

    // Database errors
    DatabaseError,
    DatabaseConnectionFailed,
    RecordNotFound,

    // Serialization errors
    SerializationError,
    InvalidJson,

    // Trigger / auth errors
    Unauthorized,
    TriggerDisabled,
    MethodNotAllowed,

    // Validation errors
    ValidationError,

    // Configuration errors
    ConfigurationError,
    MissingConfiguration,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::DagNotFound
            | Self::NodeNotFound
            | Self::RunNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::DuplicateNode | Self::InvalidStateTransition => StatusCode::CONFLICT,

            Self::CycleDetected
            | Self::DagValidationFailed
            | Self::EmptyGraph
            | Self::UnknownTaskKind
            | Self::ValidationError
            | Self::InvalidMessage => StatusCode::UNPROCESSABLE_ENTITY,

            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::TriggerDisabled => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,

            Self::ExecutorTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::DatabaseConnectionFailed | Self::QueueConnectionFailed => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::SsrfBlocked => StatusCode::FORBIDDEN,

            Self::ExecutorFailure
            | Self::ConfigMissing
            | Self::QueueError
            | Self::DatabaseError
            | Self::SerializationError
            | Self::InvalidJson
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable codes correspond to transient infrastructure trouble; the
    /// worker retries executor failures separately via the per-DAG retry
    /// policy.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::QueueError
                | Self::QueueConnectionFailed
                | Self::ExecutorFailure
                | Self::ExecutorTimeout
        )
    }

    /// Codes that terminate a task immediately, bypassing the retry policy.
    pub const fn is_fatal_for_task(&self) -> bool {
        matches!(
            self,
            Self::SsrfBlocked
                | Self::ConfigMissing
                | Self::UnknownTaskKind
                | Self::DagNotFound
                | Self::NodeNotFound
                | Self::ValidationError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::CycleDetected
            | Self::DagValidationFailed
            | Self::DagNotFound
            | Self::NodeNotFound
            | Self::DuplicateNode
            | Self::EmptyGraph
            | Self::UnknownTaskKind => "dag",

            Self::RunNotFound | Self::InvalidStateTransition => "run",

            Self::ExecutorFailure
            | Self::ExecutorTimeout
            | Self::SsrfBlocked
            | Self::ConfigMissing => "executor",

            Self::QueueError | Self::QueueConnectionFailed | Self::InvalidMessage => "queue",

            Self::DatabaseError | Self::DatabaseConnectionFailed | Self::RecordNotFound => {
                "database"
            }

            Self::SerializationError | Self::InvalidJson => "serialization",

            Self::Unauthorized | Self::TriggerDisabled | Self::MethodNotAllowed => "trigger",

            Self::ValidationError => "validation",

            Self::ConfigurationError | Self::MissingConfiguration => "configuration",

            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, validation failures)
    Low,
    /// Operational issues (executor failures, timeouts)
    Medium,
    /// System errors (store failures, critical bugs)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::CycleDetected
            | ErrorCode::DagValidationFailed
            | ErrorCode::DagNotFound
            | ErrorCode::NodeNotFound
            | ErrorCode::DuplicateNode
            | ErrorCode::EmptyGraph
            | ErrorCode::UnknownTaskKind
            | ErrorCode::RunNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::Unauthorized
            | ErrorCode::TriggerDisabled
            | ErrorCode::MethodNotAllowed => Self::Low,

            ErrorCode::ExecutorFailure
            | ErrorCode::ExecutorTimeout
            | ErrorCode::SsrfBlocked
            | ErrorCode::ConfigMissing
            | ErrorCode::InvalidMessage => Self::Medium,

            ErrorCode::QueueError
            | ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::QueueConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Cascade Core.
///
/// Supports structured error codes, user-friendly vs internal messages,
/// error chaining, and HTTP status code mapping.
#[derive(Error, Debug)]
pub struct CascadeError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CascadeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error for a named entity.
    pub fn not_found(entity_type: &'static str, entity_id: impl fmt::Display) -> Self {
        let code = match entity_type {
            "dag" => ErrorCode::DagNotFound,
            "run" => ErrorCode::RunNotFound,
            "node" => ErrorCode::NodeNotFound,
            _ => ErrorCode::RecordNotFound,
        };
        Self::new(code, format!("{} not found: {}", entity_type, entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a cycle-detected error.
    pub fn cycle_detected(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CycleDetected, message)
    }

    /// Create an executor failure.
    pub fn executor_failure(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ExecutorFailure, message)
    }

    /// Create an executor timeout.
    pub fn executor_timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ExecutorTimeout, message)
    }

    /// Create a missing-configuration error for a task.
    pub fn config_missing(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigMissing, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error terminates a task immediately.
    pub fn is_fatal_for_task(&self) -> bool {
        self.code.is_fatal_for_task()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "cascade_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.code.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// User-friendly error message
    pub message: String,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&CascadeError> for ErrorResponse {
    fn from(error: &CascadeError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                message: error.user_message.to_string(),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for CascadeError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions from Library Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for CascadeError {
    fn from(e: sqlx::Error) -> Self {
        let code = match &e {
            sqlx::Error::RowNotFound => ErrorCode::RecordNotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorCode::DatabaseConnectionFailed,
            _ => ErrorCode::DatabaseError,
        };
        Self::with_internal(code, "Database operation failed", e.to_string()).with_source(e)
    }
}

impl From<redis::RedisError> for CascadeError {
    fn from(e: redis::RedisError) -> Self {
        let code = if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            ErrorCode::QueueConnectionFailed
        } else {
            ErrorCode::QueueError
        };
        Self::with_internal(code, "Queue operation failed", e.to_string()).with_source(e)
    }
}

impl From<serde_json::Error> for CascadeError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Serialization failed",
            e.to_string(),
        )
        .with_source(e)
    }
}

impl From<reqwest::Error> for CascadeError {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            ErrorCode::ExecutorTimeout
        } else {
            ErrorCode::ExecutorFailure
        };
        Self::with_internal(code, "Outbound HTTP request failed", e.to_string()).with_source(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap an error as an internal error with a context message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap an error with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CascadeError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| CascadeError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CascadeError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| CascadeError::new(code, "value missing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ErrorCode::DagNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::CycleDetected.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::Unauthorized.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorCode::MethodNotAllowed.http_status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_fatal_task_errors_are_not_retryable() {
        assert!(ErrorCode::SsrfBlocked.is_fatal_for_task());
        assert!(!ErrorCode::SsrfBlocked.is_retryable());
        assert!(ErrorCode::ConfigMissing.is_fatal_for_task());
        assert!(ErrorCode::ExecutorFailure.is_retryable());
        assert!(!ErrorCode::ExecutorFailure.is_fatal_for_task());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = CascadeError::with_internal(
            ErrorCode::QueueError,
            "Queue operation failed",
            "RPOP timed out",
        );
        let text = err.to_string();
        assert!(text.contains("QueueError"));
        assert!(text.contains("RPOP timed out"));
    }

    #[test]
    fn test_not_found_maps_entity_types() {
        assert_eq!(CascadeError::not_found("dag", "x").code(), ErrorCode::DagNotFound);
        assert_eq!(CascadeError::not_found("run", "x").code(), ErrorCode::RunNotFound);
        assert_eq!(
            CascadeError::not_found("worker", "x").code(),
            ErrorCode::RecordNotFound
        );
    }
}
