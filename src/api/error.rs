//! Unified API error handling.
//!
//! Every handler returns `Result<_, ApiError>`; errors render as
//! `{"error": {"code", "message", "details"?}}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lifecycle::LifecycleError;

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client errors (4xx)
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ValidationError,
    PasswordTooShort,
    PendingApproval,
    EmailNotVerified,
    AccountRejected,
    AccountDenied,
    IncorrectPassword,
    UnknownAccount,
    InvalidCode,
    CodeExpired,
    InvalidOrExpiredCode,
    InvalidLink,
    LinkExpired,

    // Server errors (5xx)
    InternalError,
    PersistenceError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::PasswordTooShort
            | ErrorCode::InvalidCode
            | ErrorCode::CodeExpired
            | ErrorCode::InvalidOrExpiredCode
            | ErrorCode::InvalidLink
            | ErrorCode::LinkExpired => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized | ErrorCode::IncorrectPassword | ErrorCode::UnknownAccount => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::Forbidden
            | ErrorCode::PendingApproval
            | ErrorCode::EmailNotVerified
            | ErrorCode::AccountRejected
            | ErrorCode::AccountDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InternalError | ErrorCode::PersistenceError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::PasswordTooShort => "password_too_short",
            ErrorCode::PendingApproval => "pending_approval",
            ErrorCode::EmailNotVerified => "email_not_verified",
            ErrorCode::AccountRejected => "account_rejected",
            ErrorCode::AccountDenied => "account_denied",
            ErrorCode::IncorrectPassword => "incorrect_password",
            ErrorCode::UnknownAccount => "unknown_account",
            ErrorCode::InvalidCode => "invalid_code",
            ErrorCode::CodeExpired => "code_expired",
            ErrorCode::InvalidOrExpiredCode => "invalid_or_expired_code",
            ErrorCode::InvalidLink => "invalid_link",
            ErrorCode::LinkExpired => "link_expired",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::PersistenceError => "persistence_error",
        }
    }
}

/// The inner error object in the response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (e.g., validation errors per field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Additional error details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetails {
    /// Field-level validation errors
    ValidationErrors(HashMap<String, Vec<String>>),
}

/// The full error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Unified API error type
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: String,
    details: Option<ErrorDetails>,
}

impl ApiError {
    /// Create a new API error with a specific code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Add validation errors as details
    pub fn with_validation_errors(mut self, errors: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(ErrorDetails::ValidationErrors(errors));
        self
    }

    // -------------------------------------------------------------------------
    // Convenience constructors for common error types
    // -------------------------------------------------------------------------

    /// Unauthorized error (401) - authentication required
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Forbidden error (403) - authenticated but not allowed
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Not found error (404)
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Conflict error (409) - resource already exists or state conflict
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Validation error (400) with field-level details
    pub fn validation(errors: HashMap<String, Vec<String>>) -> Self {
        let message = if errors.len() == 1 {
            errors
                .values()
                .next()
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_else(|| "Validation failed".to_string())
        } else {
            format!("Validation failed for {} fields", errors.len())
        };

        Self::new(ErrorCode::ValidationError, message).with_validation_errors(errors)
    }

    /// Single field validation error
    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = HashMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::validation(errors)
    }

    /// Internal server error (500)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

// -------------------------------------------------------------------------
// Conversion from lifecycle rejections
// -------------------------------------------------------------------------

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::Validation { field, message } => ApiError::validation_field(field, message),
            LifecycleError::PasswordTooShort(_) => ApiError::new(ErrorCode::PasswordTooShort, message),
            LifecycleError::DuplicateEmail
            | LifecycleError::AlreadyVerified
            | LifecycleError::AlreadyAssigned
            | LifecycleError::NotPending => ApiError::conflict(message),
            LifecycleError::ProtectedAccount => ApiError::forbidden(message),
            LifecycleError::NotFound(_) => ApiError::not_found(message),
            LifecycleError::UnknownAccount => ApiError::new(ErrorCode::UnknownAccount, message),
            LifecycleError::PendingApproval => ApiError::new(ErrorCode::PendingApproval, message),
            LifecycleError::EmailNotVerified => ApiError::new(ErrorCode::EmailNotVerified, message),
            LifecycleError::Rejected => ApiError::new(ErrorCode::AccountRejected, message),
            LifecycleError::Denied => ApiError::new(ErrorCode::AccountDenied, message),
            LifecycleError::NoPasswordSet => ApiError::new(ErrorCode::PendingApproval, message),
            LifecycleError::IncorrectPassword => ApiError::new(ErrorCode::IncorrectPassword, message),
            LifecycleError::InvalidCode => ApiError::new(ErrorCode::InvalidCode, message),
            LifecycleError::CodeExpired => ApiError::new(ErrorCode::CodeExpired, message),
            LifecycleError::InvalidOrExpiredCode => {
                ApiError::new(ErrorCode::InvalidOrExpiredCode, message)
            }
            LifecycleError::InvalidLink => ApiError::new(ErrorCode::InvalidLink, message),
            LifecycleError::LinkExpired => ApiError::new(ErrorCode::LinkExpired, message),
            LifecycleError::Credential(detail) => {
                tracing::error!(error = %detail, "Credential operation failed");
                ApiError::internal("An internal error occurred")
            }
            LifecycleError::Persistence(e) => {
                tracing::error!(error = %e, "Responding 500 after failed save");
                ApiError::new(
                    ErrorCode::PersistenceError,
                    "The change could not be saved. State is uncertain, retry the read.",
                )
            }
        }
    }
}

// -------------------------------------------------------------------------
// Builder for validation errors (integrates with the validation module)
// -------------------------------------------------------------------------

/// Builder for collecting multiple validation errors
#[derive(Debug, Default)]
pub struct ValidationErrorBuilder {
    errors: HashMap<String, Vec<String>>,
}

impl ValidationErrorBuilder {
    /// Create a new validation error builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validation error for a field
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
        self
    }

    /// Record the error of a `validate_*` result, if any
    pub fn check(&mut self, field: &str, result: Result<(), String>) -> &mut Self {
        if let Err(message) = result {
            self.add(field, message);
        }
        self
    }

    /// Build the ApiError if there are any errors
    pub fn build(self) -> Option<ApiError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(ApiError::validation(self.errors))
        }
    }

    /// Return Ok(()) if no errors, or Err(ApiError) if there are errors
    pub fn finish(self) -> Result<(), ApiError> {
        match self.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
