use serde::{Deserialize, Serialize};

// ── Error Category ───────────────────────────────────────────────

/// Closed set of failure categories surfaced to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidParams,
    Denied,
    NotFound,
    Conflict,
    Retryable,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParams => write!(f, "invalid_params"),
            Self::Denied => write!(f, "denied"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Retryable => write!(f, "retryable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

// ── ToolError ────────────────────────────────────────────────────

/// The single failure channel of every manager and tool.
///
/// `code` is a stable machine-readable identifier (e.g. `profile_not_found`);
/// `hint` is an optional remediation note for the caller. `details` must never
/// contain secret material.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidParams, "invalid_params", message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Denied, "denied", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, "conflict", message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Retryable, "retryable", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, "timeout", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, "internal", message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Classify an HTTP status code into the taxonomy.
    pub fn category_for_status(status: u16) -> ErrorCategory {
        match status {
            401 | 403 => ErrorCategory::Denied,
            404 => ErrorCategory::NotFound,
            408 => ErrorCategory::Timeout,
            409 => ErrorCategory::Conflict,
            400 | 422 => ErrorCategory::InvalidParams,
            429 => ErrorCategory::Retryable,
            s if s >= 500 => ErrorCategory::Retryable,
            _ => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let e = ToolError::not_found("profile 'db' not found")
            .with_code("profile_not_found")
            .with_hint("create it with profile upsert");
        assert_eq!(e.category, ErrorCategory::NotFound);
        assert_eq!(e.code, "profile_not_found");
        assert!(e.hint.is_some());
        assert_eq!(format!("{e}"), "profile_not_found: profile 'db' not found");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ToolError::category_for_status(403), ErrorCategory::Denied);
        assert_eq!(ToolError::category_for_status(404), ErrorCategory::NotFound);
        assert_eq!(ToolError::category_for_status(429), ErrorCategory::Retryable);
        assert_eq!(ToolError::category_for_status(503), ErrorCategory::Retryable);
        assert_eq!(ToolError::category_for_status(409), ErrorCategory::Conflict);
        assert_eq!(ToolError::category_for_status(400), ErrorCategory::InvalidParams);
    }

    #[test]
    fn test_serialize_skips_empty() {
        let e = ToolError::internal("boom");
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("hint").is_none());
        assert!(json.get("details").is_none());
    }
}
