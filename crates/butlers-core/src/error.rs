//! Canonical error taxonomy shared by every butler.
//!
//! The executor class set (`validation_error`, `target_unavailable`,
//! `timeout`, `overload_rejected`, `internal_error`) is the only set a
//! routed butler may emit. Switchboard additionally owns
//! `classification_error` and `routing_error` for its own decision layer;
//! downstream butlers must never produce those.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical error class carried across butler boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Schema, targeting, or policy violation. Never retried.
    ValidationError,
    /// Downstream butler or external provider unavailable or throttled.
    TargetUnavailable,
    /// Deadline or budget expiry.
    Timeout,
    /// Local admission control or queue saturation.
    OverloadRejected,
    /// Unexpected failure; original cause preserved as metadata.
    InternalError,
    /// Switchboard-only: the classifier produced unusable output.
    ClassificationError,
    /// Switchboard-only: the routing layer itself failed.
    RoutingError,
}

impl ErrorClass {
    /// Whether a failure of this class is eligible for retry.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::TargetUnavailable | Self::Timeout | Self::OverloadRejected
        )
    }

    /// Whether this class belongs to the executor set that routed
    /// butlers are allowed to emit.
    #[must_use]
    pub fn is_executor_class(self) -> bool {
        !matches!(self, Self::ClassificationError | Self::RoutingError)
    }

    /// The wire name of the class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::TargetUnavailable => "target_unavailable",
            Self::Timeout => "timeout",
            Self::OverloadRejected => "overload_rejected",
            Self::InternalError => "internal_error",
            Self::ClassificationError => "classification_error",
            Self::RoutingError => "routing_error",
        }
    }

    /// Parse a wire class name. Unknown names return `None`; callers
    /// normalize those to [`ErrorClass::InternalError`] preserving the
    /// original string as metadata.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation_error" => Some(Self::ValidationError),
            "target_unavailable" => Some(Self::TargetUnavailable),
            "timeout" => Some(Self::Timeout),
            "overload_rejected" => Some(Self::OverloadRejected),
            "internal_error" => Some(Self::InternalError),
            "classification_error" => Some(Self::ClassificationError),
            "routing_error" => Some(Self::RoutingError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified butler failure.
///
/// Carries the canonical class, a human-readable message, and optional
/// non-user-facing metadata (e.g. the original class name an unknown
/// downstream error was normalized from).
#[derive(Debug, Error)]
#[error("{class}: {message}")]
pub struct ButlerError {
    /// Canonical class.
    pub class: ErrorClass,
    /// Human-readable message. Safe to surface to operators, not
    /// guaranteed safe for end users.
    pub message: String,
    /// Non-user-facing metadata preserved through normalization.
    pub metadata: Option<serde_json::Value>,
}

impl ButlerError {
    /// Create an error with the given class and message.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            metadata: None,
        }
    }

    /// A `validation_error`.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ValidationError, message)
    }

    /// A `target_unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TargetUnavailable, message)
    }

    /// A `timeout` error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    /// An `overload_rejected` error.
    #[must_use]
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::OverloadRejected, message)
    }

    /// An `internal_error`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InternalError, message)
    }

    /// Attach non-user-facing metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether the failure is retryable.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.class.retryable()
    }

    /// Normalize an arbitrary downstream class name into the executor
    /// set. Unknown names become `internal_error` with the original
    /// class preserved as metadata.
    #[must_use]
    pub fn normalize_downstream(class_name: &str, message: impl Into<String>) -> Self {
        match ErrorClass::parse(class_name) {
            Some(class) if class.is_executor_class() => Self::new(class, message),
            _ => Self::new(ErrorClass::InternalError, message).with_metadata(serde_json::json!({
                "original_class": class_name,
            })),
        }
    }
}

/// Result alias for fallible butler operations.
pub type ButlerResult<T> = Result<T, ButlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::TargetUnavailable.retryable());
        assert!(ErrorClass::Timeout.retryable());
        assert!(ErrorClass::OverloadRejected.retryable());
        assert!(!ErrorClass::ValidationError.retryable());
        assert!(!ErrorClass::InternalError.retryable());
    }

    #[test]
    fn switchboard_classes_are_not_executor_classes() {
        assert!(!ErrorClass::ClassificationError.is_executor_class());
        assert!(!ErrorClass::RoutingError.is_executor_class());
        assert!(ErrorClass::ValidationError.is_executor_class());
    }

    #[test]
    fn wire_names_round_trip() {
        for class in [
            ErrorClass::ValidationError,
            ErrorClass::TargetUnavailable,
            ErrorClass::Timeout,
            ErrorClass::OverloadRejected,
            ErrorClass::InternalError,
            ErrorClass::ClassificationError,
            ErrorClass::RoutingError,
        ] {
            assert_eq!(ErrorClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(ErrorClass::parse("made_up_class"), None);
    }

    #[test]
    fn unknown_downstream_class_normalizes_to_internal() {
        let err = ButlerError::normalize_downstream("quota_exceeded", "quota hit");
        assert_eq!(err.class, ErrorClass::InternalError);
        let meta = err.metadata.expect("metadata preserved");
        assert_eq!(meta["original_class"], "quota_exceeded");
    }

    #[test]
    fn switchboard_class_from_downstream_normalizes_to_internal() {
        // A downstream butler must not emit classification_error.
        let err = ButlerError::normalize_downstream("classification_error", "nope");
        assert_eq!(err.class, ErrorClass::InternalError);
    }

    #[test]
    fn display_includes_class_and_message() {
        let err = ButlerError::validation("bad envelope");
        assert_eq!(err.to_string(), "validation_error: bad envelope");
    }
}
