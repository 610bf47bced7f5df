//! Error handling for Driftbox Core.
//!
//! This module provides:
//! - Error types with context and chaining
//! - HTTP status code mapping for API responses
//! - Stable error codes for machine-readable API responses
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use driftbox_core::error::{DriftboxError, Result, ErrorContext};
//!
//! fn my_function() -> Result<()> {
//!     some_operation()
//!         .context("Failed to perform operation")
//!         .with_error_code(ErrorCode::InternalError)?;
//!     Ok(())
//! }
//! ```

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

/// A specialized Result type for Driftbox operations.
pub type Result<T> = std::result::Result<T, DriftboxError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Counter Store Errors (2000-2099)
    StoreConnectionFailed,
    StoreCommandFailed,
    StoreTimeout,

    // Serialization Errors (2100-2199)
    SerializationError,
    DeserializationError,

    // Rate Limiting (3000-3099)
    RateLimitExceeded,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Counter Store Errors
            Self::StoreConnectionFailed => 2000,
            Self::StoreCommandFailed => 2001,
            Self::StoreTimeout => 2002,

            // Serialization Errors
            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,

            // Rate Limiting
            Self::RateLimitExceeded => 3000,

            // Validation Errors
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Too Many Requests (429)
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            // Unprocessable Entity (422)
            Self::ValidationError | Self::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,

            // Service Unavailable (503)
            Self::StoreConnectionFailed | Self::StoreTimeout => StatusCode::SERVICE_UNAVAILABLE,

            // Internal Server Error (500)
            Self::StoreCommandFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreConnectionFailed | Self::StoreCommandFailed | Self::StoreTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            2000..=2099 => "store",
            2100..=2199 => "serialization",
            3000..=3099 => "rate_limit",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
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
    /// Operational issues (rate limits, timeouts)
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
            // Low severity - user errors
            ErrorCode::ValidationError | ErrorCode::InvalidInput => Self::Low,

            // Medium severity - operational
            ErrorCode::RateLimitExceeded | ErrorCode::StoreTimeout => Self::Medium,

            // High severity - system errors
            ErrorCode::StoreCommandFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            // Critical severity
            ErrorCode::StoreConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Driftbox Core.
///
/// This error type supports:
/// - Structured error codes for API responses
/// - Error chaining with context
/// - User-friendly vs internal messages
/// - HTTP status code mapping
/// - Metrics integration
#[derive(Error, Debug)]
pub struct DriftboxError {
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

impl fmt::Display for DriftboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DriftboxError {
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

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a counter store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreCommandFailed,
            "Counter store operation failed",
            message,
        )
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

    /// Get the severity of this error.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging and Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category()
        )
        .increment(1);
    }

    /// Log this error at the appropriate level for its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    code = %self.code,
                    category = self.code.category(),
                    internal = self.internal_message.as_deref(),
                    "{}",
                    self.user_message
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    code = %self.code,
                    category = self.code.category(),
                    internal = self.internal_message.as_deref(),
                    "{}",
                    self.user_message
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions from External Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for DriftboxError {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::StoreTimeout
        } else if err.is_connection_refusal() || err.is_connection_dropped() {
            ErrorCode::StoreConnectionFailed
        } else {
            ErrorCode::StoreCommandFailed
        };
        Self::with_internal(code, "Counter store operation failed", err.to_string())
            .with_source(err)
    }
}

impl From<serde_json::Error> for DriftboxError {
    fn from(err: serde_json::Error) -> Self {
        let code = match err.classify() {
            serde_json::error::Category::Io => ErrorCode::SerializationError,
            _ => ErrorCode::DeserializationError,
        };
        Self::with_internal(code, "Serialization failed", err.to_string()).with_source(err)
    }
}

impl From<config::ConfigError> for DriftboxError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Invalid configuration",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response Mapping
// ═══════════════════════════════════════════════════════════════════════════════

/// The error payload returned to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
}

/// The inner error body of an [`ErrorResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    pub retryable: bool,
}

impl From<&DriftboxError> for ErrorResponse {
    fn from(err: &DriftboxError) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: err.code,
                numeric_code: err.code.numeric_code(),
                message: err.user_message.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

impl IntoResponse for DriftboxError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.http_status();
        let body = ErrorResponse::from(&self);
        (status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to results.
pub trait ErrorContext<T> {
    /// Add a context message, defaulting to an internal error code.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Attach an explicit error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| DriftboxError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| {
            DriftboxError::with_internal(code, "Operation failed", e.to_string()).with_source(e)
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| DriftboxError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| DriftboxError::new(code, "Value was missing"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(
            ErrorCode::RateLimitExceeded.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::StoreConnectionFailed.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::ValidationError.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::StoreCommandFailed.category(), "store");
        assert_eq!(ErrorCode::DeserializationError.category(), "serialization");
        assert_eq!(ErrorCode::RateLimitExceeded.category(), "rate_limit");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::StoreTimeout.is_retryable());
        assert!(ErrorCode::StoreConnectionFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::RateLimitExceeded.is_retryable());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = DriftboxError::with_internal(
            ErrorCode::StoreCommandFailed,
            "Counter store operation failed",
            "ZADD failed: connection reset",
        );
        let formatted = err.to_string();
        assert!(formatted.contains("StoreCommandFailed"));
        assert!(formatted.contains("connection reset"));
    }

    #[test]
    fn test_error_response_hides_internal_message() {
        let err = DriftboxError::with_internal(
            ErrorCode::StoreCommandFailed,
            "Counter store operation failed",
            "secret details",
        );
        let response = ErrorResponse::from(&err);
        assert!(!response.success);
        assert_eq!(response.error.numeric_code, 2001);
        assert!(!response.error.message.contains("secret"));
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidInput),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::RateLimitExceeded),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_context_on_result() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "boom",
        ));
        let err = result.context("wrapping failed operation").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.internal_message(), Some("wrapping failed operation"));
    }

    #[test]
    fn test_context_on_option() {
        let missing: Option<u32> = None;
        let err = missing.with_error_code(ErrorCode::InvalidInput).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}
