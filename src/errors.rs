//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance. The fan-out aggregator additionally uses the machine-readable
//! [`ErrorKind`] to report per-account failures as data instead of strings.

use rmcp::model::ErrorData;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the mail gateway may encounter. Each variant maps
/// to an appropriate MCP error code in [`ErrorData`] and to an [`ErrorKind`]
/// for structured reporting. `Clone` lets one shared connect attempt deliver
/// its failure to every concurrent acquirer.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request). Raised
    /// before any session is touched.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Resource not found (account, folder, message id)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (credential decrypt failure, backend rejects
    /// credentials or token)
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Transport-level failure establishing or maintaining a session
    #[error("connection failed: {0}")]
    Connection(String),
    /// Operation timeout (connect, operation, fan-out branch, or overall
    /// deadline; the message states which budget fired)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Backend-specific operation failure (mailbox cannot be opened, API
    /// rejects a well-formed request)
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Message submission rejected
    #[error("send failed: {0}")]
    Send(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Machine-readable error classification
///
/// Serialized inside fan-out results so callers can distinguish failure
/// classes without string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Auth,
    Connection,
    Timeout,
    Protocol,
    Send,
    Internal,
}

impl AppError {
    /// Convenience constructor for `Validation`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify this error for structured reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Send(_) => ErrorKind::Send,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Maps each `AppError` variant to the appropriate MCP error type and
    /// includes a structured `code` field for client error handling.
    ///
    /// # Mappings
    ///
    /// - `Validation` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `Auth` → `invalid_request`
    /// - `Connection`, `Timeout`, `Protocol`, `Send`, `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let code = serde_json::to_value(self.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "internal".to_owned());
        let data = Some(json!({ "code": code }));
        match self {
            Self::Validation(msg) => ErrorData::invalid_params(msg.clone(), data),
            Self::NotFound(msg) => ErrorData::resource_not_found(msg.clone(), data),
            Self::Auth(msg) => ErrorData::invalid_request(msg.clone(), data),
            Self::Connection(msg)
            | Self::Timeout(msg)
            | Self::Protocol(msg)
            | Self::Send(msg)
            | Self::Internal(msg) => ErrorData::internal_error(msg.clone(), data),
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AppError, ErrorKind};

    #[test]
    fn kind_classifies_without_string_matching() {
        assert_eq!(
            AppError::Timeout("connect timeout".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            AppError::Auth("bad refresh token".into()).kind(),
            ErrorKind::Auth
        );
        assert_eq!(AppError::invalid("nope").kind(), ErrorKind::Validation);
    }

    #[test]
    fn error_data_carries_structured_code() {
        let data = AppError::Connection("refused".into()).to_error_data();
        let code = data
            .data
            .as_ref()
            .and_then(|d| d.get("code"))
            .and_then(|c| c.as_str());
        assert_eq!(code, Some("connection"));
    }
}
