//! Closed error taxonomy shared by every acquisition component.
//!
//! Backends never hand raw transport or process failures to the relay. They
//! build an [`UpstreamError`] (usually through the classifiers in
//! [`crate::normalize`]) that already knows its client-facing status code and
//! whether any other backend could still succeed.

use std::fmt;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InputValidationError,
    UpstreamAuthError,
    UpstreamNotFoundError,
    UpstreamBlockedError,
    NetworkError,
    ExtractionError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputValidationError => "InputValidationError",
            Self::UpstreamAuthError => "UpstreamAuthError",
            Self::UpstreamNotFoundError => "UpstreamNotFoundError",
            Self::UpstreamBlockedError => "UpstreamBlockedError",
            Self::NetworkError => "NetworkError",
            Self::ExtractionError => "ExtractionError",
            Self::InternalError => "InternalError",
        }
    }

    /// Status used when the classifier has no reason to pick another one.
    pub fn default_status(self) -> StatusCode {
        match self {
            Self::InputValidationError => StatusCode::BAD_REQUEST,
            Self::UpstreamAuthError => StatusCode::FORBIDDEN,
            Self::UpstreamNotFoundError => StatusCode::NOT_FOUND,
            Self::UpstreamBlockedError => StatusCode::FORBIDDEN,
            Self::NetworkError => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExtractionError => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short headline placed in the `error` field of response bodies.
    pub fn headline(self) -> &'static str {
        match self {
            Self::InputValidationError => "Invalid request",
            Self::UpstreamAuthError => "Upstream API access denied",
            Self::UpstreamNotFoundError => "Video not found",
            Self::UpstreamBlockedError => "Video access blocked",
            Self::NetworkError => "Upstream unreachable",
            Self::ExtractionError => "Extraction service unavailable",
            Self::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure of any upstream interaction.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    kind: ErrorKind,
    http_status: StatusCode,
    raw_reason: Option<String>,
    message: String,
    details: Option<String>,
    terminal: bool,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: kind.default_status(),
            raw_reason: None,
            message: message.into(),
            details: None,
            terminal: matches!(kind, ErrorKind::InputValidationError),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputValidationError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamAuthError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamNotFoundError, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamBlockedError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    /// Network error for an operation that ran out of time (504).
    pub fn timeout(operation: &str) -> Self {
        Self::network(format!("{operation} timed out. Try again later."))
            .with_status(StatusCode::GATEWAY_TIMEOUT)
            .with_reason("timeout")
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExtractionError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.raw_reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        if !details.trim().is_empty() {
            self.details = Some(details);
        }
        self
    }

    /// Marks the failure as one no other backend can work around.
    pub fn into_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn http_status(&self) -> StatusCode {
        self.http_status
    }

    pub fn raw_reason(&self) -> Option<&str> {
        self.raw_reason.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// JSON body shared by every error response.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind.headline().to_string(),
            message: self.message.clone(),
            reason: self.raw_reason.clone(),
            details: self.details.clone(),
        }
    }
}

/// `{error, message, reason?, details?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
