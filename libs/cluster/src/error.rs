//! Error taxonomy for remote calls and reconciliation failures.
//!
//! Remote failures are classified once, from the structured error code the
//! service returns (falling back to the HTTP status for unknown codes).
//! Message text is carried for diagnostics only and never inspected.

use std::fmt;
use std::time::Duration;

use cirrus_id::{ClusterId, ReconcileId};
use cirrus_reconcile::Retryable;
use thiserror::Error;

use crate::model::{ClusterState, ClusterStatus, ValidationErrors};

/// Classification of a remote call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The resource does not exist.
    NotFound,
    /// Request rate exceeded.
    Throttled,
    /// Name collision or concurrent modification.
    Conflict,
    /// The service rejected the request as malformed.
    InvalidInput,
    /// Temporary service-side failure.
    Transient,
    /// Anything else.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Throttled => "throttled",
            Self::Conflict => "conflict",
            Self::InvalidInput => "invalid_input",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    /// Classify a remote error code.
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code {
            "ResourceNotFoundException" | "ClusterNotFound" | "NoSuchEntity" | "NotFound" => {
                Self::NotFound
            }
            "ThrottlingException" | "Throttling" | "RequestLimitExceeded"
            | "TooManyRequestsException" => Self::Throttled,
            "ConflictException" | "ResourceConflict" | "ClusterAlreadyExists"
            | "EntityAlreadyExists" => Self::Conflict,
            "ValidationException" | "InvalidRequestException" | "InvalidParameterValue"
            | "InvalidParameterCombination" | "MissingParameter" => Self::InvalidInput,
            "InternalServerError" | "InternalServerException" | "InternalFailure"
            | "ServiceUnavailable" | "RequestTimeout" | "RequestTimeoutException" => {
                Self::Transient
            }
            _ => return None,
        };
        Some(kind)
    }

    /// Classify by HTTP status when the code is not recognised.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::Throttled,
            400..=499 => Self::InvalidInput,
            500..=599 => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({code}): {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    /// Remote error code, verbatim.
    pub code: String,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build from a remote error response.
    pub fn from_remote(code: &str, http_status: Option<u16>, message: impl Into<String>) -> Self {
        let kind = ErrorKind::from_code(code)
            .or_else(|| http_status.map(ErrorKind::from_http_status))
            .unwrap_or(ErrorKind::Fatal);
        Self::new(kind, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, "ResourceNotFoundException", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Throttled | ErrorKind::Transient)
    }
}

/// The step of the lifecycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Validate,
    CheckDependencies,
    Refresh,
    Create,
    AwaitReady,
    Update,
    ClearTerminationProtection,
    Delete,
    AwaitGone,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::CheckDependencies => "check_dependencies",
            Self::Refresh => "refresh",
            Self::Create => "create",
            Self::AwaitReady => "await_ready",
            Self::Update => "update",
            Self::ClearTerminationProtection => "clear_termination_protection",
            Self::Delete => "delete",
            Self::AwaitGone => "await_gone",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reconciliation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureKind {
    /// Local validation failed; the remote service was never called.
    #[error(transparent)]
    InvalidInput(#[from] ValidationErrors),

    /// Declared dependencies have not completed yet.
    #[error("dependencies not complete: {}", .0.join(", "))]
    DependenciesPending(Vec<String>),

    /// A remote call failed.
    #[error("remote call failed: {0}")]
    Remote(ClientError),

    /// A wait exceeded its deadline.
    #[error("timed out after {elapsed:?} ({reads} reads)")]
    Timeout { elapsed: Duration, reads: u32 },

    /// The service reports the operation itself failed.
    #[error("cluster reached {status}{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    RemoteTerminalFailure {
        status: ClusterStatus,
        reason: Option<String>,
    },

    /// The caller aborted a wait.
    #[error("cancelled")]
    Cancelled,
}

impl FailureKind {
    /// Remote error classification, when the failure came from a remote call.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        self.error_kind() == Some(ErrorKind::NotFound)
    }
}

/// A reconciliation that ended in `Failed`, with enough context for the
/// caller to decide whether manual cleanup is needed.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed{}: {kind}", .cluster_id.as_ref().map(|id| format!(" for cluster {id}")).unwrap_or_default())]
pub struct ReconcileError {
    pub kind: FailureKind,
    pub operation: Operation,
    /// The cluster involved, if one was created or targeted.
    pub cluster_id: Option<ClusterId>,
    /// Last observed state, if any was observed.
    pub last_state: Option<Box<ClusterState>>,
    pub reconcile_id: ReconcileId,
}

impl ReconcileError {
    pub fn last_state(&self) -> Option<&ClusterState> {
        self.last_state.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_uses_code_not_message() {
        let e = ClientError::from_remote("ThrottlingException", Some(400), "Cluster not found");
        assert_eq!(e.kind, ErrorKind::Throttled);
        assert!(e.is_retryable());

        let e = ClientError::from_remote("ResourceNotFoundException", None, "rate exceeded");
        assert!(e.is_not_found());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_unknown_code_falls_back_to_status() {
        assert_eq!(
            ClientError::from_remote("Weird", Some(503), "").kind,
            ErrorKind::Transient
        );
        assert_eq!(
            ClientError::from_remote("Weird", Some(429), "").kind,
            ErrorKind::Throttled
        );
        assert_eq!(
            ClientError::from_remote("Weird", Some(403), "").kind,
            ErrorKind::InvalidInput
        );
        assert_eq!(ClientError::from_remote("Weird", None, "").kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_terminal_failure_display_includes_reason() {
        let kind = FailureKind::RemoteTerminalFailure {
            status: ClusterStatus::TerminatedWithErrors,
            reason: Some("bootstrap action 1 failed".into()),
        };
        assert_eq!(
            kind.to_string(),
            "cluster reached TERMINATED_WITH_ERRORS: bootstrap action 1 failed"
        );
    }
}
