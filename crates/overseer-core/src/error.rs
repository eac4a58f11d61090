use serde::{Deserialize, Serialize};

/// Stable error classification surfaced to callers and recorded in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    ScopeConflict,
    NotFound,
    AlreadyTerminal,
    SandboxUnavailable,
    MissingDependency,
    Misconfiguration,
    TestFailure,
    System,
    Cancelled,
    TimedOut,
    Duplicate,
    GapDetected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ScopeConflict => "scope_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::Misconfiguration => "misconfiguration",
            ErrorKind::TestFailure => "test_failure",
            ErrorKind::System => "system",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::GapDetected => "gap_detected",
        }
    }

    /// Only transport-class failures are worth retrying inside the engine.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::System)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
