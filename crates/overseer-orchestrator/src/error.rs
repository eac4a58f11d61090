use thiserror::Error;

use overseer_core::{ErrorKind, LockError};
use overseer_types::LockConflict;

use crate::traits::SandboxError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("scope conflict: {0}")]
    ScopeConflict(LockConflict),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run {0} is already terminal")]
    AlreadyTerminal(String),
    #[error("sandbox unavailable ({classification}): {message}")]
    SandboxUnavailable {
        classification: ErrorKind,
        message: String,
    },
    #[error("sandbox operation failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("duplicate run id: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable error kind identifier surfaced to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            OrchestratorError::ScopeConflict(_) => ErrorKind::ScopeConflict,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::AlreadyTerminal(_) => ErrorKind::AlreadyTerminal,
            OrchestratorError::SandboxUnavailable { classification, .. } => *classification,
            OrchestratorError::Sandbox(err) => match err {
                SandboxError::NotFound(_) => ErrorKind::NotFound,
                SandboxError::InvalidTransition { .. } => ErrorKind::AlreadyTerminal,
                SandboxError::Unavailable(_) => ErrorKind::MissingDependency,
                SandboxError::Misconfigured(_) => ErrorKind::Misconfiguration,
                SandboxError::Transport(_) | SandboxError::ApplyFailed(_) => ErrorKind::System,
            },
            OrchestratorError::Duplicate(_) => ErrorKind::Duplicate,
            OrchestratorError::Internal(_) => ErrorKind::System,
        }
    }

    pub fn conflict(&self) -> Option<&LockConflict> {
        match self {
            OrchestratorError::ScopeConflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict(conflict) => OrchestratorError::ScopeConflict(conflict),
            LockError::InvalidScope(_) | LockError::InvalidTtl => {
                OrchestratorError::InvalidRequest(err.to_string())
            }
            LockError::NotFound(_) | LockError::Expired(_) => {
                OrchestratorError::Internal(anyhow::anyhow!(err))
            }
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_map_to_caller_kinds() {
        let invalid: OrchestratorError = LockError::InvalidScope("..".into()).into();
        assert_eq!(invalid.kind(), ErrorKind::InvalidRequest);
        let expired: OrchestratorError = LockError::Expired("lock_1".into()).into();
        assert_eq!(expired.kind(), ErrorKind::System);
    }

    #[test]
    fn sandbox_unavailable_reports_its_classification() {
        let err = OrchestratorError::SandboxUnavailable {
            classification: ErrorKind::MissingDependency,
            message: "docker not installed".into(),
        };
        assert_eq!(err.kind().as_str(), "missing_dependency");
        assert!(err.to_string().contains("missing_dependency"));
    }
}
