use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Active,
    Stopped,
    Approved,
    Rejected,
    Deleted,
    Error,
}

impl SandboxStatus {
    /// Lifecycle edges. `deleted` absorbs; `approved`, `rejected` and `error` only lead there.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Error)
                | (Active, Stopped)
                | (Active, Approved)
                | (Active, Rejected)
                | (Active, Error)
                | (Stopped, Active)
                | (Stopped, Deleted)
                | (Stopped, Error)
                | (Approved, Deleted)
                | (Rejected, Deleted)
                | (Error, Deleted)
        )
    }

    /// Changes can still be approved or rejected.
    pub fn is_reviewable(self) -> bool {
        matches!(self, SandboxStatus::Active | SandboxStatus::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Active => "active",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Approved => "approved",
            SandboxStatus::Rejected => "rejected",
            SandboxStatus::Deleted => "deleted",
            SandboxStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: String,
    pub scope_path: String,
    pub project_root: String,
    pub status: SandboxStatus,
    pub work_dir: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub run_id: String,
    pub scope_path: String,
    pub project_root: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file_id: String,
    pub path: String,
    pub change_type: ChangeType,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub sandbox_id: String,
    pub files: Vec<FileChange>,
    pub total_additions: u32,
    pub total_deletions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub sandbox_id: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    /// `None` approves every pending file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResult {
    pub success: bool,
    pub applied: usize,
    pub remaining: usize,
    pub is_partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub applied_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Availability {
    pub fn ok() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}
