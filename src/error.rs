//! Error types for the Tenant Disk Operator
//!
//! Provides structured error types for the orchestrator gateway, the naming
//! reservation service, quota admission, the disk state machine and the API.

use crate::controlplane::lifecycle::{DiskEvent, DiskState};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Orchestrator Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Orchestrator unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    // =========================================================================
    // Disk Lifecycle Errors
    // =========================================================================
    #[error("Disk name {name} is already taken in {scope}")]
    NameTaken { scope: String, name: String },

    #[error(
        "Quota exceeded for {scope}: {used} bytes used, {requested} bytes requested, limit {limit} bytes"
    )]
    QuotaExceeded {
        scope: String,
        used: u64,
        limit: u64,
        requested: u64,
    },

    #[error("Invalid disk transition: {event} is not allowed from {from}")]
    InvalidTransition { from: DiskState, event: DiskEvent },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Unavailable { .. } | Error::Conflict { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Caller, policy or logic errors - don't retry automatically
            Error::InvalidTransition { .. }
            | Error::QuotaExceeded { .. }
            | Error::NameTaken { .. }
            | Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::DurationParse(_)
            | Error::CapacityParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Unavailable { .. } | Error::Conflict { .. }
        )
    }

    /// Whether the referenced orchestrator resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this is an optimistic-concurrency collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub(crate) fn unavailable(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::Unavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::QuotaExceeded {
            scope: "acme/ml".into(),
            used: 10,
            limit: 12,
            requested: 5,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(!err.is_retryable());

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::InvalidTransition {
            from: DiskState::Deleting,
            event: DiskEvent::DeleteRequested,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::unavailable("list", "connection refused");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let conflict = Error::Conflict {
            kind: "PersistentVolumeClaim".into(),
            name: "disk-1".into(),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_transient());

        let taken = Error::NameTaken {
            scope: "acme/ml".into(),
            name: "logs".into(),
        };
        assert!(!taken.is_retryable());
        assert!(!taken.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::QuotaExceeded {
            scope: "acme/ml".into(),
            used: 100,
            limit: 150,
            requested: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("100 bytes used"));
        assert!(msg.contains("limit 150"));

        let err = Error::InvalidTransition {
            from: DiskState::Terminated,
            event: DiskEvent::VolumeBound,
        };
        assert_eq!(
            err.to_string(),
            "Invalid disk transition: volume-bound is not allowed from Terminated"
        );
    }
}
